// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioning collaborator seam
//!
//! The synthesizer's descriptor is handed to a [`ProvisioningCollaborator`]
//! which creates the resources and reports their provider ids. This is the
//! only asynchronous boundary on the provisioning side.

use std::collections::BTreeMap;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::error::{RdGateError, Result};
use crate::synth::{DeploymentDescriptor, ResourceKind, INSTANCE_OUTPUT};

/// How a collaborator failure is classified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollaboratorErrorKind {
    /// The provider rejected a property value
    InvalidInput,
    /// The provider refused to combine the resources as described
    Rejected,
    /// The provider's response is missing resources or outputs
    IncompleteResponse,
}

/// Error reported by a provisioning collaborator
#[derive(Error, Debug)]
#[error("{resource}: {message}")]
pub struct CollaboratorError {
    pub kind: CollaboratorErrorKind,
    pub resource: String,
    pub message: String,
}

impl From<CollaboratorError> for RdGateError {
    fn from(err: CollaboratorError) -> Self {
        let message = err.to_string();
        match err.kind {
            CollaboratorErrorKind::InvalidInput => RdGateError::ConfigurationError {
                component: "provider",
                message,
            },
            CollaboratorErrorKind::Rejected => RdGateError::CompositionError { message },
            CollaboratorErrorKind::IncompleteResponse => RdGateError::SynthesisError {
                component: "provider",
                message,
            },
        }
    }
}

/// Provider ids assigned to a deployment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionedDeployment {
    /// Logical id to provider id
    pub physical_ids: BTreeMap<String, String>,
}

impl ProvisionedDeployment {
    pub fn physical_id(&self, logical_id: &str) -> Option<&str> {
        self.physical_ids.get(logical_id).map(String::as_str)
    }
}

/// Creates the resources of a descriptor against a remote API
#[async_trait]
pub trait ProvisioningCollaborator: Send + Sync {
    async fn apply(
        &self,
        descriptor: &DeploymentDescriptor,
    ) -> std::result::Result<ProvisionedDeployment, CollaboratorError>;
}

/// Result of a deployment: provider ids plus the exported outputs
#[derive(Debug, Clone)]
pub struct Deployment {
    pub provisioned: ProvisionedDeployment,
    pub outputs: BTreeMap<String, String>,
}

impl Deployment {
    /// Provider handle of the gateway instance
    pub fn instance_handle(&self) -> Option<&str> {
        self.outputs.get(INSTANCE_OUTPUT).map(String::as_str)
    }
}

/// Submit `descriptor` and resolve its outputs
pub async fn deploy(
    collaborator: &dyn ProvisioningCollaborator,
    descriptor: &DeploymentDescriptor,
) -> Result<Deployment> {
    info!(
        stack = %descriptor.stack_name,
        resources = descriptor.resources.len(),
        "Submitting deployment"
    );

    let provisioned = collaborator.apply(descriptor).await?;

    for resource in &descriptor.resources {
        if provisioned.physical_id(&resource.logical_id).is_none() {
            warn!(resource = %resource.logical_id, "Provider did not report resource");
            return Err(CollaboratorError {
                kind: CollaboratorErrorKind::IncompleteResponse,
                resource: resource.logical_id.clone(),
                message: "no provider id returned".to_string(),
            }
            .into());
        }
    }

    let mut outputs = BTreeMap::new();
    for output in &descriptor.outputs {
        let value = provisioned
            .physical_id(&output.references)
            .ok_or_else(|| RdGateError::SynthesisError {
                component: "provider",
                message: format!(
                    "output {} references unknown resource {}",
                    output.name, output.references
                ),
            })?;
        outputs.insert(output.name.clone(), value.to_string());
    }

    info!(stack = %descriptor.stack_name, outputs = outputs.len(), "Deployment applied");

    Ok(Deployment {
        provisioned,
        outputs,
    })
}

/// Assigns deterministic provider ids without contacting any provider
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunCollaborator;

impl DryRunCollaborator {
    fn physical_id(stack: &str, logical_id: &str, kind: ResourceKind) -> String {
        let mut hasher = Sha256::new();
        hasher.update(stack.as_bytes());
        hasher.update(b"/");
        hasher.update(logical_id.as_bytes());
        let digest: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();

        match kind {
            ResourceKind::NetworkTopology => format!("vpc-{}", &digest[..17]),
            ResourceKind::InternetGateway => format!("igw-{}", &digest[..17]),
            ResourceKind::Subnet => format!("subnet-{}", &digest[..17]),
            ResourceKind::RouteTable => format!("rtb-{}", &digest[..17]),
            ResourceKind::RouteTableAssociation => format!("rtbassoc-{}", &digest[..17]),
            ResourceKind::SecurityPolicy => format!("sg-{}", &digest[..17]),
            ResourceKind::Instance => format!("i-{}", &digest[..17]),
            ResourceKind::Identity | ResourceKind::InstanceProfile => {
                format!("{}-{}-{}", stack, logical_id, &digest[..12].to_uppercase())
            }
            // Attachments and routes are identified by the stack they belong to
            ResourceKind::GatewayAttachment | ResourceKind::Route => {
                format!("{}-{}-{}", stack, logical_id, &digest[..8])
            }
        }
    }
}

#[async_trait]
impl ProvisioningCollaborator for DryRunCollaborator {
    async fn apply(
        &self,
        descriptor: &DeploymentDescriptor,
    ) -> std::result::Result<ProvisionedDeployment, CollaboratorError> {
        let physical_ids = descriptor
            .resources
            .iter()
            .map(|r| {
                (
                    r.logical_id.clone(),
                    Self::physical_id(&descriptor.stack_name, &r.logical_id, r.kind),
                )
            })
            .collect();
        Ok(ProvisionedDeployment { physical_ids })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::synth::synthesize_from_config;

    /// Collaborator that drops one resource from its response
    struct ForgetfulCollaborator {
        forget: &'static str,
    }

    #[async_trait]
    impl ProvisioningCollaborator for ForgetfulCollaborator {
        async fn apply(
            &self,
            descriptor: &DeploymentDescriptor,
        ) -> std::result::Result<ProvisionedDeployment, CollaboratorError> {
            let mut provisioned = DryRunCollaborator.apply(descriptor).await?;
            provisioned.physical_ids.remove(self.forget);
            Ok(provisioned)
        }
    }

    struct RejectingCollaborator(CollaboratorErrorKind);

    #[async_trait]
    impl ProvisioningCollaborator for RejectingCollaborator {
        async fn apply(
            &self,
            _descriptor: &DeploymentDescriptor,
        ) -> std::result::Result<ProvisionedDeployment, CollaboratorError> {
            Err(CollaboratorError {
                kind: self.0,
                resource: "rdGateway".to_string(),
                message: "rejected".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_dry_run_exports_instance_handle() {
        let descriptor = synthesize_from_config(&Config::default()).unwrap();
        let deployment = deploy(&DryRunCollaborator, &descriptor).await.unwrap();

        assert_eq!(deployment.outputs.len(), 1);
        let handle = deployment.instance_handle().unwrap();
        assert!(handle.starts_with("i-"));
        assert_eq!(handle.len(), 19);
        assert_eq!(deployment.provisioned.physical_ids.len(), 11);
    }

    #[tokio::test]
    async fn test_dry_run_ids_are_deterministic() {
        let descriptor = synthesize_from_config(&Config::default()).unwrap();
        let first = deploy(&DryRunCollaborator, &descriptor).await.unwrap();
        let second = deploy(&DryRunCollaborator, &descriptor).await.unwrap();
        assert_eq!(first.provisioned, second.provisioned);
    }

    #[tokio::test]
    async fn test_incomplete_response_is_synthesis_error() {
        let descriptor = synthesize_from_config(&Config::default()).unwrap();
        let err = deploy(&ForgetfulCollaborator { forget: "rdGateway" }, &descriptor)
            .await
            .unwrap_err();
        assert!(matches!(err, RdGateError::SynthesisError { component: "provider", .. }));
    }

    #[tokio::test]
    async fn test_collaborator_errors_map_into_taxonomy() {
        let descriptor = synthesize_from_config(&Config::default()).unwrap();

        let err = deploy(&RejectingCollaborator(CollaboratorErrorKind::InvalidInput), &descriptor)
            .await
            .unwrap_err();
        assert!(matches!(err, RdGateError::ConfigurationError { .. }));

        let err = deploy(&RejectingCollaborator(CollaboratorErrorKind::Rejected), &descriptor)
            .await
            .unwrap_err();
        assert!(matches!(err, RdGateError::CompositionError { .. }));

        let err = deploy(
            &RejectingCollaborator(CollaboratorErrorKind::IncompleteResponse),
            &descriptor,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RdGateError::SynthesisError { .. }));
    }
}
