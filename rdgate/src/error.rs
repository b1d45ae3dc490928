// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for rdgate

use thiserror::Error;

use crate::bootstrap::BootstrapState;

/// Result type alias for rdgate operations
pub type Result<T> = std::result::Result<T, RdGateError>;

/// Errors that can occur while provisioning or bootstrapping the gateway
#[derive(Error, Debug)]
pub enum RdGateError {
    /// Malformed input to a builder (bad CIDR, DNS name, peer descriptor)
    #[error("{component}: configuration error: {message}")]
    ConfigurationError {
        component: &'static str,
        message: String,
    },

    /// Requested capability or policy does not exist in the target catalog
    #[error("{component}: policy error: {message}")]
    PolicyError {
        component: &'static str,
        message: String,
    },

    /// The instance provisioner received missing or mismatched inputs
    #[error("instance: composition error: {message}")]
    CompositionError { message: String },

    /// Dependency graph incomplete at synthesis time
    #[error("{component}: synthesis error: {message}")]
    SynthesisError {
        component: &'static str,
        message: String,
    },

    /// A bootstrap state failed; later states were not attempted
    #[error("bootstrap step {state} failed: {message}")]
    BootstrapStepFailure {
        state: BootstrapState,
        message: String,
    },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Invalid configuration format
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Bootstrap template could not be rendered
    #[error("Template error: {0}")]
    TemplateError(#[from] tera::Error),

    /// IO error wrapper
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl RdGateError {
    pub(crate) fn configuration(component: &'static str, message: impl Into<String>) -> Self {
        Self::ConfigurationError {
            component,
            message: message.into(),
        }
    }

    pub(crate) fn composition(message: impl Into<String>) -> Self {
        Self::CompositionError {
            message: message.into(),
        }
    }

    pub(crate) fn step(state: BootstrapState, message: impl Into<String>) -> Self {
        Self::BootstrapStepFailure {
            state,
            message: message.into(),
        }
    }

    /// Name of the provisioning component that produced this error, if any
    pub fn component(&self) -> Option<&'static str> {
        match self {
            Self::ConfigurationError { component, .. }
            | Self::PolicyError { component, .. }
            | Self::SynthesisError { component, .. } => Some(*component),
            Self::CompositionError { .. } => Some("instance"),
            _ => None,
        }
    }
}
