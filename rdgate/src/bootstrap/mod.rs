// SPDX-License-Identifier: AGPL-3.0-or-later
//! First-boot bootstrap of the Remote Desktop Gateway
//!
//! The provisioning side renders the bootstrap script ([`script`]); the
//! instance side runs the same protocol as an explicit state machine
//! ([`BootstrapMachine`]) against a [`GatewayHost`].

mod host;
mod machine;
pub mod script;

pub use host::{GatewayHost, HostCall, MemoryHost, PowerShellHost};
pub use machine::{
    profile_suffix, BootstrapMachine, BootstrapPhase, BootstrapReport, BootstrapSettings,
    BootstrapState, Clock, StepResult, SystemClock,
};
pub use script::{compose_payload, BootstrapPayload, ScriptDialect};

use serde::{Deserialize, Serialize};

/// Windows service name of the Remote Desktop Gateway
pub const GATEWAY_SERVICE: &str = "TSGateway";

/// Local machine personal store the certificate is created in
pub const CERTIFICATE_STORE: &str = r"Cert:\LocalMachine\My";

/// Local groups permitted through the gateway
pub const PERMITTED_GROUPS: [&str; 2] = ["administrators@BUILTIN", "Remote Desktop Users@BUILTIN"];

/// Directory on the gateway the certificate is exported to (expanded by PowerShell)
pub const EXPORT_DIR: &str = r"$HOME\Desktop";

/// Default CAP authentication method (password)
pub const AUTH_METHOD_DEFAULT: u8 = 1;

/// RAP computer group type permitting connections to any device
pub const COMPUTER_GROUP_ANY: u8 = 2;

/// Self-signed certificate generated on the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayCertificate {
    pub dns_name: String,
    pub store_location: String,
    pub thumbprint: String,
    /// Set once the certificate has been exported for clients
    pub exported_path: Option<String>,
}

/// What an authorization profile governs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ProfileScope {
    /// RD-CAP: who may connect
    Connection { auth_method: u8 },
    /// RD-RAP: which downstream resources they may reach
    Resource { computer_group_type: u8 },
}

/// A named gateway authorization rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationProfile {
    pub name: String,
    pub user_groups: Vec<String>,
    pub scope: ProfileScope,
}
