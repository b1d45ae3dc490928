// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bootstrap script composer
//!
//! Renders the first-boot PowerShell script with the gateway's DNS name. The
//! template spells out every bootstrap state literally; the only thing filled
//! in is `dns_name`.

use serde::Serialize;
use tera::{Context, Tera};
use tracing::debug;

use crate::error::{RdGateError, Result};

const COMPONENT: &str = "bootstrap-script";

const TEMPLATE_NAME: &str = "setup.ps1";

/// Where the script lands on the instance
pub const SCRIPT_TARGET_PATH: &str = r"C:\setup.ps1";

const SETUP_TEMPLATE: &str = r#"<#
    .SYNOPSIS
        Configure a Remote Desktop Gateway jump (bastion) server

    .DESCRIPTION
        Creates a self-signed certificate and exports it for connecting clients, binds it to the
        gateway, installs an RD-CAP and an RD-RAP and restarts the gateway service.

    .NOTES
        The Remote Desktop Gateway role must be installed before this script runs.
        Non-AD local groups are added to the RD-CAP and the RD-RAP permits every back-end resource.
        Any failing step other than the export stops the script; the gateway keeps its previous
        configuration.
#>
$ErrorActionPreference = "Stop"

Import-Module RemoteDesktopServices

$dnsName = "{{ dns_name }}"
$userGroups = @("administrators@BUILTIN"; "Remote Desktop Users@BUILTIN")
$stamp = (Get-Date).ToUniversalTime().ToString("yyyyMMddTHHmmssZ")

# 1. GenerateCertificate
$x509Obj = New-SelfSignedCertificate -CertStoreLocation Cert:\LocalMachine\My -DnsName $dnsName

# 2. ExportCertificate. Clients must import this into their Trusted Root store.
# Best effort: a failed export does not stop the gateway from being configured.
$x509Obj | Export-Certificate -FilePath "$HOME\Desktop\$dnsName.cer" -Force -Type CERT -ErrorAction Continue

# 3. InstallTrustBinding
Set-Item -Path RDS:\GatewayServer\SSLCertificate\Thumbprint -Value $x509Obj.Thumbprint

# 4. CreateConnectionAuthorization
New-Item -Path RDS:\GatewayServer\CAP -Name "RD-CAP-$stamp" -UserGroups $userGroups -AuthMethod 1

# 5. CreateResourceAuthorization. ComputerGroupType 2 permits connections to any device.
New-Item -Path RDS:\GatewayServer\RAP -Name "RD-RAP-$stamp" -UserGroups $userGroups -ComputerGroupType 2

# 6. ActivateConfiguration
Restart-Service TSGateway
"#;

/// Script language of a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptDialect {
    PowerShell,
    Shell,
}

impl std::fmt::Display for ScriptDialect {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptDialect::PowerShell => write!(formatter, "PowerShell"),
            ScriptDialect::Shell => write!(formatter, "shell"),
        }
    }
}

/// Rendered first-boot configuration, written once and read-only afterwards
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootstrapPayload {
    target_path: String,
    dialect: ScriptDialect,
    dns_name: String,
    body: String,
}

impl BootstrapPayload {
    pub fn target_path(&self) -> &str {
        &self.target_path
    }

    pub fn dialect(&self) -> ScriptDialect {
        self.dialect
    }

    pub fn dns_name(&self) -> &str {
        &self.dns_name
    }

    pub fn body(&self) -> &str {
        &self.body
    }
}

/// Render the gateway setup script for `dns_name`
pub fn compose_payload(dns_name: &str) -> Result<BootstrapPayload> {
    validate_dns_name(dns_name)?;

    let mut tera = Tera::default();
    tera.add_raw_template(TEMPLATE_NAME, SETUP_TEMPLATE)?;

    let mut context = Context::new();
    context.insert("dns_name", dns_name);
    let body = tera.render(TEMPLATE_NAME, &context)?;

    debug!(dns_name = %dns_name, bytes = body.len(), "Rendered bootstrap script");

    Ok(BootstrapPayload {
        target_path: SCRIPT_TARGET_PATH.to_string(),
        dialect: ScriptDialect::PowerShell,
        dns_name: dns_name.to_string(),
        body,
    })
}

/// Check that `name` is usable as a certificate subject DNS name
pub fn validate_dns_name(name: &str) -> Result<()> {
    let invalid = |message: String| Err(RdGateError::configuration(COMPONENT, message));

    if name.is_empty() {
        return invalid("DNS name cannot be empty".to_string());
    }

    if name.len() > 253 {
        return invalid(format!("DNS name is {} characters, limit is 253", name.len()));
    }

    for label in name.split('.') {
        if label.is_empty() {
            return invalid(format!("DNS name '{}' has an empty label", name));
        }
        if label.len() > 63 {
            return invalid(format!("label '{}' is longer than 63 characters", label));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return invalid(format!("label '{}' starts or ends with '-'", label));
        }
        if let Some(c) = label.chars().find(|c| !c.is_ascii_alphanumeric() && *c != '-') {
            return invalid(format!("character '{}' is not allowed in DNS name '{}'", c, name));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::BootstrapState;

    const DNS_NAME: &str = "yourvmname.eastus.cloudapp.azure.com";

    #[test]
    fn test_render_substitutes_dns_name() {
        let payload = compose_payload(DNS_NAME).unwrap();
        assert!(payload
            .body()
            .contains(r#"$dnsName = "yourvmname.eastus.cloudapp.azure.com""#));
        assert!(!payload.body().contains("{{"));
        assert_eq!(payload.target_path(), r"C:\setup.ps1");
        assert_eq!(payload.dialect(), ScriptDialect::PowerShell);
    }

    #[test]
    fn test_render_is_idempotent() {
        let first = compose_payload(DNS_NAME).unwrap();
        let second = compose_payload(DNS_NAME).unwrap();
        assert_eq!(first.body().as_bytes(), second.body().as_bytes());
        assert_eq!(first, second);
    }

    #[test]
    fn test_script_stops_on_first_error() {
        let payload = compose_payload(DNS_NAME).unwrap();
        let stop = payload.body().find(r#"$ErrorActionPreference = "Stop""#).unwrap();
        let first_step = payload.body().find("New-SelfSignedCertificate").unwrap();
        assert!(stop < first_step);
    }

    #[test]
    fn test_script_steps_follow_state_order() {
        let payload = compose_payload(DNS_NAME).unwrap();
        let positions: Vec<usize> = BootstrapState::ALL
            .iter()
            .map(|state| {
                payload
                    .body()
                    .find(state.script_marker())
                    .unwrap_or_else(|| panic!("{} missing from script", state))
            })
            .collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_script_uses_fixed_groups_and_export_dir() {
        use crate::bootstrap::{EXPORT_DIR, PERMITTED_GROUPS};

        let payload = compose_payload(DNS_NAME).unwrap();
        for group in PERMITTED_GROUPS {
            assert!(payload.body().contains(group), "{} missing from script", group);
        }
        let export_line = payload
            .body()
            .lines()
            .find(|line| line.contains("Export-Certificate"))
            .unwrap();
        assert!(export_line.contains(&format!(r#""{}\$dnsName.cer""#, EXPORT_DIR)));
        assert!(export_line.contains("-ErrorAction Continue"));
    }

    #[test]
    fn test_invalid_dns_names() {
        let long_label = "a".repeat(64);
        let long_name = vec!["abc"; 70].join(".");
        for name in [
            "",
            "host..example.com",
            "-host.example.com",
            "host-.example.com",
            "host_name.example.com",
            "host name",
            "hönig.example.com",
            "evil\"; Remove-Item C:\\",
            long_label.as_str(),
            long_name.as_str(),
        ] {
            assert!(
                matches!(
                    compose_payload(name),
                    Err(RdGateError::ConfigurationError { .. })
                ),
                "{:?} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_valid_dns_names() {
        for name in ["localhost", "gw-01.example.com", "a1.b2.c3", DNS_NAME] {
            assert!(validate_dns_name(name).is_ok(), "{} should be accepted", name);
        }
    }
}
