// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bootstrap state machine
//!
//! The same six states the rendered script performs, driven one at a time
//! against a [`GatewayHost`]. Nothing is retried. A failure is terminal in
//! every state except [`BootstrapState::ExportCertificate`], whose output
//! only serves client distribution; the run records a warning and moves on.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::host::GatewayHost;
use super::{
    AuthorizationProfile, GatewayCertificate, ProfileScope, AUTH_METHOD_DEFAULT,
    CERTIFICATE_STORE, COMPUTER_GROUP_ANY, EXPORT_DIR, GATEWAY_SERVICE, PERMITTED_GROUPS,
};
use crate::error::{RdGateError, Result};

/// One step of the bootstrap protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BootstrapState {
    GenerateCertificate,
    ExportCertificate,
    InstallTrustBinding,
    CreateConnectionAuthorization,
    CreateResourceAuthorization,
    ActivateConfiguration,
}

impl BootstrapState {
    /// Every state in execution order
    pub const ALL: [BootstrapState; 6] = [
        BootstrapState::GenerateCertificate,
        BootstrapState::ExportCertificate,
        BootstrapState::InstallTrustBinding,
        BootstrapState::CreateConnectionAuthorization,
        BootstrapState::CreateResourceAuthorization,
        BootstrapState::ActivateConfiguration,
    ];

    pub const fn first() -> Self {
        BootstrapState::GenerateCertificate
    }

    /// The state entered after this one succeeds, `None` once activated
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::GenerateCertificate => Some(Self::ExportCertificate),
            Self::ExportCertificate => Some(Self::InstallTrustBinding),
            Self::InstallTrustBinding => Some(Self::CreateConnectionAuthorization),
            Self::CreateConnectionAuthorization => Some(Self::CreateResourceAuthorization),
            Self::CreateResourceAuthorization => Some(Self::ActivateConfiguration),
            Self::ActivateConfiguration => None,
        }
    }

    /// 1-based position in the sequence
    pub const fn number(self) -> usize {
        match self {
            Self::GenerateCertificate => 1,
            Self::ExportCertificate => 2,
            Self::InstallTrustBinding => 3,
            Self::CreateConnectionAuthorization => 4,
            Self::CreateResourceAuthorization => 5,
            Self::ActivateConfiguration => 6,
        }
    }

    /// Whether a failure in this state halts the run
    pub const fn is_fatal(self) -> bool {
        !matches!(self, Self::ExportCertificate)
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::GenerateCertificate => "Generating self-signed certificate",
            Self::ExportCertificate => "Exporting certificate for clients",
            Self::InstallTrustBinding => "Binding certificate to the gateway",
            Self::CreateConnectionAuthorization => "Creating connection authorization profile",
            Self::CreateResourceAuthorization => "Creating resource authorization profile",
            Self::ActivateConfiguration => "Restarting the gateway service",
        }
    }

    /// Command in the rendered script that performs this state
    pub const fn script_marker(self) -> &'static str {
        match self {
            Self::GenerateCertificate => "New-SelfSignedCertificate",
            Self::ExportCertificate => "Export-Certificate",
            Self::InstallTrustBinding => r"RDS:\GatewayServer\SSLCertificate\Thumbprint",
            Self::CreateConnectionAuthorization => r"RDS:\GatewayServer\CAP",
            Self::CreateResourceAuthorization => r"RDS:\GatewayServer\RAP",
            Self::ActivateConfiguration => "Restart-Service TSGateway",
        }
    }
}

impl std::fmt::Display for BootstrapState {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::GenerateCertificate => "GenerateCertificate",
            Self::ExportCertificate => "ExportCertificate",
            Self::InstallTrustBinding => "InstallTrustBinding",
            Self::CreateConnectionAuthorization => "CreateConnectionAuthorization",
            Self::CreateResourceAuthorization => "CreateResourceAuthorization",
            Self::ActivateConfiguration => "ActivateConfiguration",
        };
        write!(formatter, "{}.{}", self.number(), name)
    }
}

/// Source of the profile name timestamp
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Profile name suffix. Second resolution: two runs within the same second collide.
pub fn profile_suffix(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Outcome of one state
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub state: BootstrapState,
    pub success: bool,
    pub error: Option<String>,
    /// Non-fatal failure the run continued past
    pub warning: Option<String>,
    pub duration_ms: u64,
}

/// Where a run ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "kebab-case")]
pub enum BootstrapPhase {
    /// All six states succeeded and the service was restarted
    Completed,
    /// Halted at `state`; later states never ran
    Failed {
        state: BootstrapState,
        reason: String,
    },
}

/// Summary of a bootstrap run
#[derive(Debug, Clone, Serialize)]
pub struct BootstrapReport {
    pub dns_name: String,
    pub phase: BootstrapPhase,
    pub steps: Vec<StepResult>,
    pub certificate: Option<GatewayCertificate>,
    pub connection_profile: Option<AuthorizationProfile>,
    pub resource_profile: Option<AuthorizationProfile>,
    pub total_duration_ms: u64,
}

impl BootstrapReport {
    pub fn success(&self) -> bool {
        self.phase == BootstrapPhase::Completed
    }

    pub fn failed_state(&self) -> Option<BootstrapState> {
        match &self.phase {
            BootstrapPhase::Completed => None,
            BootstrapPhase::Failed { state, .. } => Some(*state),
        }
    }

    /// Non-fatal failures, in order
    pub fn warnings(&self) -> Vec<(BootstrapState, &str)> {
        self.steps
            .iter()
            .filter_map(|step| step.warning.as_deref().map(|w| (step.state, w)))
            .collect()
    }

    /// States that completed, in order
    pub fn completed_states(&self) -> Vec<BootstrapState> {
        self.steps
            .iter()
            .filter(|step| step.success)
            .map(|step| step.state)
            .collect()
    }

    /// Turn a failed run into a [`RdGateError::BootstrapStepFailure`]
    pub fn into_result(self) -> Result<Self> {
        match &self.phase {
            BootstrapPhase::Completed => Ok(self),
            BootstrapPhase::Failed { state, reason } => Err(RdGateError::step(*state, reason.clone())),
        }
    }
}

/// Settings for one run
#[derive(Debug, Clone)]
pub struct BootstrapSettings {
    pub dns_name: String,
    /// Directory the certificate is exported to (expanded on the host)
    pub export_dir: String,
    pub user_groups: Vec<String>,
}

impl BootstrapSettings {
    /// Settings matching the rendered script: fixed export directory and group pair
    pub fn for_dns_name(dns_name: &str) -> Self {
        Self {
            dns_name: dns_name.to_string(),
            export_dir: EXPORT_DIR.to_string(),
            user_groups: PERMITTED_GROUPS.iter().map(|g| g.to_string()).collect(),
        }
    }

    pub fn export_path(&self) -> String {
        format!(r"{}\{}.cer", self.export_dir.trim_end_matches('\\'), self.dns_name)
    }
}

#[derive(Default)]
struct RunState {
    certificate: Option<GatewayCertificate>,
    suffix: Option<String>,
    connection_profile: Option<AuthorizationProfile>,
    resource_profile: Option<AuthorizationProfile>,
}

/// Drives the bootstrap states against a host
pub struct BootstrapMachine {
    settings: BootstrapSettings,
    clock: Arc<dyn Clock>,
}

impl BootstrapMachine {
    pub fn new(settings: BootstrapSettings) -> Result<Self> {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: BootstrapSettings, clock: Arc<dyn Clock>) -> Result<Self> {
        super::script::validate_dns_name(&settings.dns_name)?;

        if settings.user_groups.is_empty() || settings.user_groups.iter().any(|g| g.trim().is_empty()) {
            return Err(RdGateError::InvalidConfig {
                message: "authorization profiles need at least one non-empty user group".to_string(),
            });
        }

        Ok(Self { settings, clock })
    }

    pub fn settings(&self) -> &BootstrapSettings {
        &self.settings
    }

    /// Run every state in order, stopping at the first failure
    pub async fn run(&self, host: &dyn GatewayHost) -> BootstrapReport {
        let start_time = std::time::Instant::now();
        let mut steps = Vec::with_capacity(BootstrapState::ALL.len());
        let mut run = RunState::default();
        let mut phase = BootstrapPhase::Completed;

        info!(dns_name = %self.settings.dns_name, "Starting gateway bootstrap");

        let mut next = Some(BootstrapState::first());
        while let Some(state) = next {
            debug!(state = %state, "{}", state.description());
            let step_start = std::time::Instant::now();

            let outcome = self.enter(state, host, &mut run).await;
            let duration_ms = step_start.elapsed().as_millis() as u64;

            match outcome {
                Ok(()) => {
                    steps.push(StepResult {
                        state,
                        success: true,
                        error: None,
                        warning: None,
                        duration_ms,
                    });
                    next = state.next();
                }
                Err(e) if !state.is_fatal() => {
                    warn!(state = %state, error = %e, "Non-fatal bootstrap step failed, continuing");
                    steps.push(StepResult {
                        state,
                        success: true,
                        error: None,
                        warning: Some(e.to_string()),
                        duration_ms,
                    });
                    next = state.next();
                }
                Err(e) => {
                    error!(state = %state, error = %e, "Bootstrap step failed");
                    warn!("Stopping bootstrap; the gateway keeps its previous configuration");
                    steps.push(StepResult {
                        state,
                        success: false,
                        error: Some(e.to_string()),
                        warning: None,
                        duration_ms,
                    });
                    phase = BootstrapPhase::Failed {
                        state,
                        reason: e.to_string(),
                    };
                    next = None;
                }
            }
        }

        let total_duration_ms = start_time.elapsed().as_millis() as u64;

        info!(
            dns_name = %self.settings.dns_name,
            success = phase == BootstrapPhase::Completed,
            steps = steps.len(),
            duration_ms = total_duration_ms,
            "Gateway bootstrap finished"
        );

        BootstrapReport {
            dns_name: self.settings.dns_name.clone(),
            phase,
            steps,
            certificate: run.certificate,
            connection_profile: run.connection_profile,
            resource_profile: run.resource_profile,
            total_duration_ms,
        }
    }

    async fn enter(
        &self,
        state: BootstrapState,
        host: &dyn GatewayHost,
        run: &mut RunState,
    ) -> Result<()> {
        match state {
            BootstrapState::GenerateCertificate => {
                let thumbprint = host
                    .create_certificate(&self.settings.dns_name, CERTIFICATE_STORE)
                    .await?;
                if thumbprint.trim().is_empty() {
                    return Err(RdGateError::step(state, "host returned an empty thumbprint"));
                }
                run.certificate = Some(GatewayCertificate {
                    dns_name: self.settings.dns_name.clone(),
                    store_location: CERTIFICATE_STORE.to_string(),
                    thumbprint: thumbprint.trim().to_string(),
                    exported_path: None,
                });
            }
            BootstrapState::ExportCertificate => {
                let certificate = certificate_mut(state, run)?;
                let path = self.settings.export_path();
                host.export_certificate(&certificate.thumbprint, &path).await?;
                certificate.exported_path = Some(path);
            }
            BootstrapState::InstallTrustBinding => {
                let thumbprint = certificate_mut(state, run)?.thumbprint.clone();
                host.bind_certificate(&thumbprint).await?;
            }
            BootstrapState::CreateConnectionAuthorization => {
                let suffix = profile_suffix(self.clock.now());
                let profile = AuthorizationProfile {
                    name: format!("RD-CAP-{}", suffix),
                    user_groups: self.settings.user_groups.clone(),
                    scope: ProfileScope::Connection {
                        auth_method: AUTH_METHOD_DEFAULT,
                    },
                };
                host.create_profile(&profile).await?;
                run.suffix = Some(suffix);
                run.connection_profile = Some(profile);
            }
            BootstrapState::CreateResourceAuthorization => {
                let suffix = run
                    .suffix
                    .clone()
                    .ok_or_else(|| RdGateError::step(state, "connection profile was never created"))?;
                let profile = AuthorizationProfile {
                    name: format!("RD-RAP-{}", suffix),
                    user_groups: self.settings.user_groups.clone(),
                    scope: ProfileScope::Resource {
                        computer_group_type: COMPUTER_GROUP_ANY,
                    },
                };
                host.create_profile(&profile).await?;
                run.resource_profile = Some(profile);
            }
            BootstrapState::ActivateConfiguration => {
                host.restart_service(GATEWAY_SERVICE).await?;
            }
        }
        Ok(())
    }
}

fn certificate_mut(state: BootstrapState, run: &mut RunState) -> Result<&mut GatewayCertificate> {
    run.certificate
        .as_mut()
        .ok_or_else(|| RdGateError::step(state, "no certificate was generated"))
}
