// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance provisioner
//!
//! Combines topology, identity, security policy and bootstrap payload into
//! the gateway instance. Pure composition: nothing here talks to a provider.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bootstrap::{BootstrapPayload, ScriptDialect};
use crate::error::{RdGateError, Result};
use crate::identity::Identity;
use crate::network::NetworkTopology;
use crate::security::SecurityPolicy;

/// Operating system family of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Windows,
    Linux,
}

impl OsFamily {
    /// Whether first-boot scripts in `dialect` run on this family
    pub fn runs(&self, dialect: ScriptDialect) -> bool {
        matches!(
            (self, dialect),
            (OsFamily::Windows, ScriptDialect::PowerShell) | (OsFamily::Linux, ScriptDialect::Shell)
        )
    }
}

/// Image reference: family plus provider image name or alias
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineImage {
    pub family: OsFamily,
    pub name: String,
}

impl MachineImage {
    pub fn windows_server_2016() -> Self {
        Self {
            family: OsFamily::Windows,
            name: "WINDOWS_SERVER_2016_ENGLISH_FULL_BASE".to_string(),
        }
    }

    /// Public parameter path resolving the image to a concrete id
    pub fn parameter_path(&self) -> String {
        match self.family {
            OsFamily::Windows => format!(
                "/aws/service/ami-windows-latest/{}",
                windows_image_alias(&self.name)
            ),
            OsFamily::Linux => format!("/aws/service/ami-amazon-linux-latest/{}", self.name),
        }
    }
}

fn windows_image_alias(name: &str) -> String {
    // WINDOWS_SERVER_2016_ENGLISH_FULL_BASE -> Windows_Server-2016-English-Full-Base
    let words: Vec<String> = name
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                None => String::new(),
            }
        })
        .collect();
    match words.split_first() {
        Some((first, rest)) if !rest.is_empty() => {
            format!("{}_{}", first, rest.join("-"))
        }
        _ => words.join("-"),
    }
}

/// The gateway compute resource
#[derive(Debug, Clone)]
pub struct Instance {
    logical_id: String,
    machine_class: String,
    image: MachineImage,
    identity: Arc<Identity>,
    security_policy: Arc<SecurityPolicy>,
    network: Arc<NetworkTopology>,
    payload: Arc<BootstrapPayload>,
}

impl Instance {
    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    pub fn machine_class(&self) -> &str {
        &self.machine_class
    }

    pub fn image(&self) -> &MachineImage {
        &self.image
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub fn security_policy(&self) -> &Arc<SecurityPolicy> {
        &self.security_policy
    }

    pub fn network(&self) -> &Arc<NetworkTopology> {
        &self.network
    }

    pub fn payload(&self) -> &Arc<BootstrapPayload> {
        &self.payload
    }

    /// First-boot user data: fetch the payload via cfn-init, then run it
    pub fn user_data(&self) -> String {
        format!(
            "<powershell>\ncfn-init.exe -v --stack ${{AWS::StackName}} --resource {} --region ${{AWS::Region}}\n& \"{}\"\n</powershell>",
            self.logical_id,
            self.payload.target_path()
        )
    }
}

/// Collects the inputs of one instance and validates them together
#[derive(Debug, Clone)]
pub struct InstanceBuilder {
    logical_id: String,
    machine_class: String,
    image: MachineImage,
    identity: Option<Arc<Identity>>,
    security_policy: Option<Arc<SecurityPolicy>>,
    network: Option<Arc<NetworkTopology>>,
    payload: Option<Arc<BootstrapPayload>>,
}

impl InstanceBuilder {
    pub fn new(logical_id: &str) -> Self {
        Self {
            logical_id: logical_id.to_string(),
            machine_class: "t3.small".to_string(),
            image: MachineImage::windows_server_2016(),
            identity: None,
            security_policy: None,
            network: None,
            payload: None,
        }
    }

    pub fn machine_class(mut self, machine_class: &str) -> Self {
        self.machine_class = machine_class.to_string();
        self
    }

    pub fn image(mut self, image: MachineImage) -> Self {
        self.image = image;
        self
    }

    pub fn identity(mut self, identity: Arc<Identity>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn security_policy(mut self, policy: Arc<SecurityPolicy>) -> Self {
        self.security_policy = Some(policy);
        self
    }

    pub fn network(mut self, network: Arc<NetworkTopology>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn payload(mut self, payload: Arc<BootstrapPayload>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn build(self) -> Result<Instance> {
        if self.logical_id.is_empty() || !self.logical_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(RdGateError::composition(format!(
                "logical id '{}' must be non-empty and alphanumeric",
                self.logical_id
            )));
        }

        if self.machine_class.trim().is_empty() {
            return Err(RdGateError::composition("machine class cannot be empty"));
        }

        let network = self
            .network
            .ok_or_else(|| RdGateError::composition("missing network topology"))?;
        let identity = self
            .identity
            .ok_or_else(|| RdGateError::composition("missing identity"))?;
        let security_policy = self
            .security_policy
            .ok_or_else(|| RdGateError::composition("missing security policy"))?;
        let payload = self
            .payload
            .ok_or_else(|| RdGateError::composition("missing bootstrap payload"))?;

        if !self.image.family.runs(payload.dialect()) {
            return Err(RdGateError::composition(format!(
                "image {} ({:?}) cannot run a {} bootstrap payload",
                self.image.name,
                self.image.family,
                payload.dialect()
            )));
        }

        debug!(
            instance = %self.logical_id,
            machine_class = %self.machine_class,
            image = %self.image.name,
            subnet = %network.primary_subnet(),
            "Composed gateway instance"
        );

        Ok(Instance {
            logical_id: self.logical_id,
            machine_class: self.machine_class,
            image: self.image,
            identity,
            security_policy,
            network,
            payload,
        })
    }
}
