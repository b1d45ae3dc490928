// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration management for rdgate

use std::path::{Path, PathBuf};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::{RdGateError, Result};
use crate::identity::{COMPUTE_SERVICE_PRINCIPAL, REMOTE_MANAGEMENT_CAPABILITY};
use crate::instance::OsFamily;
use crate::network::SubnetVisibility;
use crate::security::TrustEntry;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Stack name of the deployment
    #[serde(default = "default_name")]
    pub name: String,

    /// Version of the configuration format
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub identity: IdentityConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub instance: InstanceConfig,

    #[serde(default)]
    pub bootstrap: BootstrapConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Address space and subnet tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_cidr")]
    pub cidr: Ipv4Net,

    #[serde(default = "default_subnet_mask")]
    pub subnet_mask: u8,

    #[serde(default = "default_visibility")]
    pub visibility: SubnetVisibility,

    #[serde(default = "default_availability_zones")]
    pub availability_zones: u8,

    #[serde(default)]
    pub nat_gateways: u32,
}

/// Execution role of the instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_role_name")]
    pub role_name: String,

    #[serde(default = "default_trusted_principal")]
    pub trusted_principal: String,

    /// Managed capability attached to the role
    #[serde(default = "default_capability")]
    pub capability: String,
}

/// Trust list of the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub allow_all_outbound: bool,

    /// Peers allowed in. The default trusts one address on every port.
    #[serde(default = "default_trusted_peers")]
    pub trusted_peers: Vec<TrustEntry>,
}

/// Compute resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(default = "default_logical_id")]
    pub logical_id: String,

    #[serde(default = "default_machine_class")]
    pub machine_class: String,

    #[serde(default = "default_image_family")]
    pub image_family: OsFamily,

    #[serde(default = "default_image")]
    pub image: String,
}

/// First-boot bootstrap
///
/// The export directory and permitted groups are fixed by the delivered
/// script, so they are not configurable; unknown keys are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootstrapConfig {
    /// Subject DNS name of the gateway certificate
    #[serde(default = "default_dns_name")]
    pub dns_name: String,

    /// PowerShell executable used by `rdgate bootstrap`
    #[serde(default = "default_powershell")]
    pub powershell: String,

    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log file path (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            cidr: default_cidr(),
            subnet_mask: default_subnet_mask(),
            visibility: default_visibility(),
            availability_zones: default_availability_zones(),
            nat_gateways: 0,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            role_name: default_role_name(),
            trusted_principal: default_trusted_principal(),
            capability: default_capability(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            trusted_peers: default_trusted_peers(),
            allow_all_outbound: false,
        }
    }
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            logical_id: default_logical_id(),
            machine_class: default_machine_class(),
            image_family: default_image_family(),
            image: default_image(),
        }
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            dns_name: default_dns_name(),
            powershell: default_powershell(),
            step_timeout_secs: default_step_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            version: default_version(),
            network: NetworkConfig::default(),
            identity: IdentityConfig::default(),
            security: SecurityConfig::default(),
            instance: InstanceConfig::default(),
            bootstrap: BootstrapConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// The parsed configuration or an error
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(RdGateError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;

        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate the configuration
    ///
    /// Component inputs (CIDRs, peers, DNS names) are checked by their
    /// builders during synthesis so errors name the failing component.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(RdGateError::InvalidConfig {
                message: "Stack name cannot be empty".to_string(),
            });
        }

        if !SUPPORTED_VERSIONS.contains(&self.version.as_str()) {
            return Err(RdGateError::InvalidConfig {
                message: format!(
                    "Unsupported configuration version '{}' (supported: {})",
                    self.version,
                    SUPPORTED_VERSIONS.join(", ")
                ),
            });
        }

        if self.bootstrap.step_timeout_secs == 0 {
            return Err(RdGateError::InvalidConfig {
                message: "bootstrap.step_timeout_secs must be positive".to_string(),
            });
        }

        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(RdGateError::InvalidConfig {
                message: format!("Unknown log level '{}'", self.logging.level),
            });
        }

        Ok(())
    }
}

/// Configuration format versions this build reads
const SUPPORTED_VERSIONS: [&str; 1] = ["1.0"];

// Default value functions

fn default_name() -> String {
    "RdGateStack".to_string()
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_cidr() -> Ipv4Net {
    Ipv4Net::new(std::net::Ipv4Addr::new(172, 16, 0, 0), 16).unwrap_or_default()
}

fn default_subnet_mask() -> u8 {
    20
}

fn default_visibility() -> SubnetVisibility {
    SubnetVisibility::Public
}

fn default_availability_zones() -> u8 {
    1
}

fn default_role_name() -> String {
    "Role".to_string()
}

fn default_trusted_principal() -> String {
    COMPUTE_SERVICE_PRINCIPAL.to_string()
}

fn default_capability() -> String {
    REMOTE_MANAGEMENT_CAPABILITY.to_string()
}

fn default_trusted_peers() -> Vec<TrustEntry> {
    vec![TrustEntry::all_traffic("58.96.89.81/32", "Allow all from trusted ip")]
}

fn default_logical_id() -> String {
    "rdGateway".to_string()
}

fn default_machine_class() -> String {
    "t3.small".to_string()
}

fn default_image_family() -> OsFamily {
    OsFamily::Windows
}

fn default_image() -> String {
    "WINDOWS_SERVER_2016_ENGLISH_FULL_BASE".to_string()
}

fn default_dns_name() -> String {
    "yourvmname.eastus.cloudapp.azure.com".to_string()
}

fn default_powershell() -> String {
    "powershell.exe".to_string()
}

fn default_step_timeout() -> u64 {
    120 // 2 minutes
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}
