// SPDX-License-Identifier: AGPL-3.0-or-later
//! Identity binder
//!
//! Creates the execution role the gateway instance runs as and attaches the
//! single managed capability used for remote management after boot.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::error::{RdGateError, Result};

const COMPONENT: &str = "identity";

/// Service principal of the compute service; the only party trusted to assume the role
pub const COMPUTE_SERVICE_PRINCIPAL: &str = "ec2.amazonaws.com";

/// Capability granting remote session management (systems-manager agent access)
pub const REMOTE_MANAGEMENT_CAPABILITY: &str = "AmazonSSMManagedInstanceCore";

/// A provider-managed bundle of permissions
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagedCapability {
    pub name: String,
    pub arn: String,
}

/// Catalog of managed capabilities the provider knows about
#[derive(Debug, Clone)]
pub struct CapabilityCatalog {
    entries: BTreeMap<String, ManagedCapability>,
}

impl CapabilityCatalog {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Register a provider-managed policy by name
    pub fn with_managed(mut self, name: &str) -> Self {
        self.entries.insert(
            name.to_string(),
            ManagedCapability {
                name: name.to_string(),
                arn: format!("arn:aws:iam::aws:policy/{}", name),
            },
        );
        self
    }

    pub fn resolve(&self, name: &str) -> Option<&ManagedCapability> {
        self.entries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl Default for CapabilityCatalog {
    fn default() -> Self {
        Self::empty()
            .with_managed(REMOTE_MANAGEMENT_CAPABILITY)
            .with_managed("CloudWatchAgentServerPolicy")
            .with_managed("AmazonSSMReadOnlyAccess")
            .with_managed("AmazonEC2ReadOnlyAccess")
    }
}

/// Execution principal for the instance
///
/// Fields are private and there are no mutators: once an identity has been
/// handed to the instance provisioner its capability list cannot change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    name: String,
    trusted_principal: String,
    capabilities: Vec<ManagedCapability>,
}

impl Identity {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trusted_principal(&self) -> &str {
        &self.trusted_principal
    }

    pub fn capabilities(&self) -> &[ManagedCapability] {
        &self.capabilities
    }

    /// Trust policy document allowing only the trusted principal to assume the role
    pub fn trust_policy(&self) -> serde_json::Value {
        serde_json::json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": { "Service": self.trusted_principal },
                "Action": "sts:AssumeRole"
            }]
        })
    }
}

/// Create an identity trusted by `principal` carrying exactly `capability`
pub fn bind_identity(
    catalog: &CapabilityCatalog,
    name: &str,
    principal: &str,
    capability: &str,
) -> Result<Identity> {
    if name.is_empty() {
        return Err(RdGateError::configuration(COMPONENT, "role name cannot be empty"));
    }

    if principal.is_empty() {
        return Err(RdGateError::configuration(
            COMPONENT,
            "trusted principal cannot be empty",
        ));
    }

    let managed = catalog
        .resolve(capability)
        .ok_or_else(|| RdGateError::PolicyError {
            component: COMPONENT,
            message: format!("managed capability '{}' not found in catalog", capability),
        })?;

    debug!(role = %name, capability = %managed.name, "Bound execution identity");

    Ok(Identity {
        name: name.to_string(),
        trusted_principal: principal.to_string(),
        capabilities: vec![managed.clone()],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binds_exactly_one_capability() {
        let catalog = CapabilityCatalog::default();
        let identity = bind_identity(
            &catalog,
            "Role",
            COMPUTE_SERVICE_PRINCIPAL,
            REMOTE_MANAGEMENT_CAPABILITY,
        )
        .unwrap();

        assert_eq!(identity.capabilities().len(), 1);
        assert_eq!(identity.capabilities()[0].name, REMOTE_MANAGEMENT_CAPABILITY);
        assert_eq!(
            identity.capabilities()[0].arn,
            "arn:aws:iam::aws:policy/AmazonSSMManagedInstanceCore"
        );
        assert_eq!(identity.trusted_principal(), "ec2.amazonaws.com");
    }

    #[test]
    fn test_every_catalog_entry_binds_alone() {
        let catalog = CapabilityCatalog::default();
        for name in catalog.names() {
            let identity = bind_identity(&catalog, "Role", COMPUTE_SERVICE_PRINCIPAL, name).unwrap();
            let names: Vec<&str> = identity.capabilities().iter().map(|c| c.name.as_str()).collect();
            assert_eq!(names, vec![name]);
        }
    }

    #[test]
    fn test_unknown_capability_is_policy_error() {
        let catalog = CapabilityCatalog::default();
        let err = bind_identity(&catalog, "Role", COMPUTE_SERVICE_PRINCIPAL, "AdministratorAccess")
            .unwrap_err();
        assert!(matches!(err, RdGateError::PolicyError { .. }));
    }

    #[test]
    fn test_trust_policy_names_only_compute_principal() {
        let catalog = CapabilityCatalog::default();
        let identity = bind_identity(
            &catalog,
            "Role",
            COMPUTE_SERVICE_PRINCIPAL,
            REMOTE_MANAGEMENT_CAPABILITY,
        )
        .unwrap();
        let policy = identity.trust_policy();
        assert_eq!(
            policy["Statement"][0]["Principal"]["Service"],
            "ec2.amazonaws.com"
        );
        assert_eq!(policy["Statement"].as_array().unwrap().len(), 1);
    }
}
