// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gateway hosts
//!
//! A [`GatewayHost`] performs the side effects of each bootstrap state.
//! [`PowerShellHost`] shells out to PowerShell on the gateway itself;
//! [`MemoryHost`] keeps everything in memory and can be told to fail.

use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use super::{AuthorizationProfile, BootstrapState, ProfileScope};
use crate::error::{RdGateError, Result};

/// Side effects of the bootstrap states
#[async_trait]
pub trait GatewayHost: Send + Sync {
    /// Create a self-signed certificate in `store` and return its thumbprint
    async fn create_certificate(&self, dns_name: &str, store: &str) -> Result<String>;

    async fn export_certificate(&self, thumbprint: &str, path: &str) -> Result<()>;

    /// Replace the gateway's TLS certificate binding
    async fn bind_certificate(&self, thumbprint: &str) -> Result<()>;

    /// Create a CAP or RAP; an existing profile with the same name is an error
    async fn create_profile(&self, profile: &AuthorizationProfile) -> Result<()>;

    async fn restart_service(&self, service: &str) -> Result<()>;
}

/// Runs each state as a PowerShell invocation on the local machine
pub struct PowerShellHost {
    program: String,
    timeout_secs: u64,
    dry_run: bool,
}

impl PowerShellHost {
    pub fn new(program: &str, timeout_secs: u64, dry_run: bool) -> Self {
        Self {
            program: program.to_string(),
            timeout_secs,
            dry_run,
        }
    }

    async fn run_script(&self, state: BootstrapState, script: &str) -> Result<String> {
        let script = format!("$ErrorActionPreference = 'Stop'; {}", script);
        info!(state = %state, "Executing PowerShell step");
        debug!(script = %script);

        if self.dry_run {
            return Ok(format!("[DRY RUN] Would execute: {}", script));
        }

        let mut command = Command::new(&self.program);
        command
            .arg("-NoProfile")
            .arg("-NonInteractive")
            .arg("-Command")
            .arg(&script);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        // A timed-out step must not finish its side effect after being reported failed
        command.kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| RdGateError::step(state, format!("failed to start {}: {}", self.program, e)))?;

        match timeout(Duration::from_secs(self.timeout_secs), child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();

                if output.status.success() {
                    Ok(stdout)
                } else {
                    Err(RdGateError::step(
                        state,
                        format!("PowerShell exited with {}: {}", output.status, stderr.trim()),
                    ))
                }
            }
            Ok(Err(e)) => Err(RdGateError::step(state, format!("failed to run PowerShell: {}", e))),
            Err(_) => Err(RdGateError::step(
                state,
                format!("timed out after {} seconds", self.timeout_secs),
            )),
        }
    }
}

#[async_trait]
impl GatewayHost for PowerShellHost {
    async fn create_certificate(&self, dns_name: &str, store: &str) -> Result<String> {
        let state = BootstrapState::GenerateCertificate;
        let output = self
            .run_script(
                state,
                &format!(
                    "(New-SelfSignedCertificate -CertStoreLocation {} -DnsName {}).Thumbprint",
                    ps_quote(store),
                    ps_quote(dns_name)
                ),
            )
            .await?;

        if self.dry_run {
            return Ok(placeholder_thumbprint(dns_name));
        }

        let thumbprint = output.trim().to_string();
        if thumbprint.len() != 40 || !thumbprint.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(RdGateError::step(
                state,
                format!("unexpected thumbprint output '{}'", thumbprint),
            ));
        }
        Ok(thumbprint)
    }

    async fn export_certificate(&self, thumbprint: &str, path: &str) -> Result<()> {
        self.run_script(
            BootstrapState::ExportCertificate,
            &format!(
                r#"Get-Item 'Cert:\LocalMachine\My\{}' | Export-Certificate -FilePath "{}" -Force -Type CERT | Out-Null"#,
                thumbprint, path
            ),
        )
        .await?;
        Ok(())
    }

    async fn bind_certificate(&self, thumbprint: &str) -> Result<()> {
        self.run_script(
            BootstrapState::InstallTrustBinding,
            &format!(
                r"Import-Module RemoteDesktopServices; Set-Item -Path RDS:\GatewayServer\SSLCertificate\Thumbprint -Value '{}'",
                thumbprint
            ),
        )
        .await?;
        Ok(())
    }

    async fn create_profile(&self, profile: &AuthorizationProfile) -> Result<()> {
        let (state, script) = profile_script(profile);
        self.run_script(state, &script).await?;
        Ok(())
    }

    async fn restart_service(&self, service: &str) -> Result<()> {
        self.run_script(
            BootstrapState::ActivateConfiguration,
            &format!("Restart-Service {}", ps_quote(service)),
        )
        .await?;
        Ok(())
    }
}

/// PowerShell single-quoted literal; nothing inside is expanded
fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// State and command creating `profile`
fn profile_script(profile: &AuthorizationProfile) -> (BootstrapState, String) {
    let groups = profile
        .user_groups
        .iter()
        .map(|g| ps_quote(g))
        .collect::<Vec<_>>()
        .join("; ");

    match profile.scope {
        ProfileScope::Connection { auth_method } => (
            BootstrapState::CreateConnectionAuthorization,
            format!(
                r"Import-Module RemoteDesktopServices; New-Item -Path RDS:\GatewayServer\CAP -Name {} -UserGroups @({}) -AuthMethod {} | Out-Null",
                ps_quote(&profile.name),
                groups,
                auth_method
            ),
        ),
        ProfileScope::Resource { computer_group_type } => (
            BootstrapState::CreateResourceAuthorization,
            format!(
                r"Import-Module RemoteDesktopServices; New-Item -Path RDS:\GatewayServer\RAP -Name {} -UserGroups @({}) -ComputerGroupType {} | Out-Null",
                ps_quote(&profile.name),
                groups,
                computer_group_type
            ),
        ),
    }
}

/// Stand-in thumbprint for dry runs
fn placeholder_thumbprint(dns_name: &str) -> String {
    let digest = Sha256::digest(dns_name.as_bytes());
    digest
        .iter()
        .take(20)
        .map(|b| format!("{:02X}", b))
        .collect()
}

/// A call made against a [`MemoryHost`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    CreateCertificate(String),
    ExportCertificate(String),
    BindCertificate(String),
    CreateProfile(String),
    RestartService(String),
}

impl HostCall {
    /// Bootstrap state the call belongs to
    pub fn state(&self) -> BootstrapState {
        match self {
            HostCall::CreateCertificate(_) => BootstrapState::GenerateCertificate,
            HostCall::ExportCertificate(_) => BootstrapState::ExportCertificate,
            HostCall::BindCertificate(_) => BootstrapState::InstallTrustBinding,
            HostCall::CreateProfile(name) if name.starts_with("RD-RAP") => {
                BootstrapState::CreateResourceAuthorization
            }
            HostCall::CreateProfile(_) => BootstrapState::CreateConnectionAuthorization,
            HostCall::RestartService(_) => BootstrapState::ActivateConfiguration,
        }
    }
}

#[derive(Default)]
struct MemoryState {
    calls: Vec<HostCall>,
    certificates: Vec<String>,
    exported: Vec<String>,
    binding: Option<String>,
    profiles: Vec<AuthorizationProfile>,
    restarts: usize,
}

/// In-memory gateway with optional fault injection
#[derive(Default)]
pub struct MemoryHost {
    fail_at: Option<BootstrapState>,
    state: Mutex<MemoryState>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the host reject the call belonging to `state`
    pub fn fail_at(mut self, state: BootstrapState) -> Self {
        self.fail_at = Some(state);
        self
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.lock().calls.clone()
    }

    pub fn profiles(&self) -> Vec<AuthorizationProfile> {
        self.lock().profiles.clone()
    }

    pub fn bound_thumbprint(&self) -> Option<String> {
        self.lock().binding.clone()
    }

    pub fn exported_paths(&self) -> Vec<String> {
        self.lock().exported.clone()
    }

    pub fn restarts(&self) -> usize {
        self.lock().restarts
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A panic while holding the lock only happens in a failing test
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: HostCall) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        let state = call.state();
        let mut guard = self.lock();
        guard.calls.push(call);
        if self.fail_at == Some(state) {
            return Err(RdGateError::step(state, "injected failure"));
        }
        Ok(guard)
    }
}

#[async_trait]
impl GatewayHost for MemoryHost {
    async fn create_certificate(&self, dns_name: &str, _store: &str) -> Result<String> {
        let mut guard = self.record(HostCall::CreateCertificate(dns_name.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(dns_name.as_bytes());
        hasher.update(guard.certificates.len().to_le_bytes());
        let thumbprint: String = hasher
            .finalize()
            .iter()
            .take(20)
            .map(|b| format!("{:02X}", b))
            .collect();
        guard.certificates.push(thumbprint.clone());
        Ok(thumbprint)
    }

    async fn export_certificate(&self, thumbprint: &str, path: &str) -> Result<()> {
        let mut guard = self.record(HostCall::ExportCertificate(path.to_string()))?;
        if !guard.certificates.iter().any(|t| t == thumbprint) {
            return Err(RdGateError::step(
                BootstrapState::ExportCertificate,
                format!("no certificate with thumbprint {}", thumbprint),
            ));
        }
        guard.exported.push(path.to_string());
        Ok(())
    }

    async fn bind_certificate(&self, thumbprint: &str) -> Result<()> {
        let mut guard = self.record(HostCall::BindCertificate(thumbprint.to_string()))?;
        guard.binding = Some(thumbprint.to_string());
        Ok(())
    }

    async fn create_profile(&self, profile: &AuthorizationProfile) -> Result<()> {
        let mut guard = self.record(HostCall::CreateProfile(profile.name.clone()))?;
        if guard.profiles.iter().any(|p| p.name == profile.name) {
            let state = match profile.scope {
                ProfileScope::Connection { .. } => BootstrapState::CreateConnectionAuthorization,
                ProfileScope::Resource { .. } => BootstrapState::CreateResourceAuthorization,
            };
            return Err(RdGateError::step(
                state,
                format!("profile '{}' already exists", profile.name),
            ));
        }
        guard.profiles.push(profile.clone());
        Ok(())
    }

    async fn restart_service(&self, service: &str) -> Result<()> {
        let mut guard = self.record(HostCall::RestartService(service.to_string()))?;
        guard.restarts += 1;
        Ok(())
    }
}
