// SPDX-License-Identifier: AGPL-3.0-or-later
//! rdgate: provisioning and first-boot bootstrap of a Remote Desktop Gateway bastion
//!
//! A single network-isolated Windows host brokers remote desktop sessions
//! into a private network. This crate builds the host's deployment and
//! configures its gateway service before it accepts traffic.
//!
//! # Features
//!
//! * **Typed dependency graph:** network, identity, security policy and
//!   bootstrap payload are immutable values wired into one instance
//! * **Declarative descriptor:** the synthesized deployment is handed to a
//!   provisioning collaborator; the instance handle is the only output
//! * **Bootstrap state machine:** certificate, trust binding and
//!   authorization profiles are installed in a fixed, fail-halt order

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod identity;
pub mod instance;
pub mod network;
pub mod provider;
pub mod security;
pub mod synth;

pub use config::Config;
pub use error::{RdGateError, Result};
pub use synth::{synthesize_from_config, DeploymentDescriptor, Synthesizer};
