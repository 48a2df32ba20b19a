//! Deploy a Basic-Auth protected container, fronted by Caddy, to
//! Azure Container Instances or to an Ubuntu host running Portainer.
//!
//! # Overview
//!
//! Configuration lives in dotenv files checked against a typed key
//! schema ([`env::schema`]):
//!
//! - `.env` holds runtime keys the container reads
//!   (`BASIC_AUTH_USER`, `BASIC_AUTH_HASH`, ...)
//! - `.env.deploy` holds deploy-time keys (resource group, domain,
//!   image, ...)
//! - `.env.deploy.secrets` holds Portainer and registry secrets for
//!   the Ubuntu target
//!
//! Unknown keys, missing mandatory keys and cross-field violations
//! are reported together and exit with code 2.
//!
//! A deploy run is a [`DeployPipeline`] driving a
//! [`Deployer`](deploy::Deployer):
//!
//! 1. **Validate** the env files and merge them with the process
//!    environment into one resolved map
//! 2. **Plan** the deployment ([`DeployPlan`]), optionally reading
//!    services from a compose file
//! 3. **Prepare** infrastructure, images and credentials
//! 4. **Render** the manifest: an ACI container-group YAML or a
//!    Portainer compose stack
//! 5. **Apply** it
//!
//! Eight hook points let a repository customize a run without
//! patching this crate; see [`hooks`].
//!
//! # Examples
//!
//! Render the ACI manifest without touching Azure:
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! use shieldlaunch::deploy::aci::{AciDeployer, AciOptions};
//! use shieldlaunch::{DeployContext, DeployPipeline, EnvMap};
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut ctx = DeployContext::new(Path::new("."), EnvMap::new());
//!     let mut pipeline =
//!         DeployPipeline::new(AciDeployer::new(AciOptions::default()));
//!     println!("{}", pipeline.render_only(&mut ctx)?);
//!     Ok(())
//! }
//! ```
//!
//! Memory requests are rounded up to what the platform accepts:
//!
//! ```rust
//! use shieldlaunch::manifest::quantize_memory_gb;
//!
//! assert_eq!(quantize_memory_gb(1.12).unwrap(), 1.2);
//! assert!(quantize_memory_gb(0.0).is_err());
//! ```

// Allow noisy pedantic lints that don't add value for a
// deployment tool crate.
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

pub mod auth;
pub mod azure;
pub mod caddyfile;
pub mod cli;
pub mod cmd;
pub mod compose;
pub mod deploy;
pub mod docker;
pub mod env;
pub mod error;
pub mod gh;
pub mod hooks;
pub mod manifest;
pub mod oidc;
pub mod pipeline;
pub mod plan;
pub mod portainer;
pub mod ssh;

pub use deploy::aci::AciDeployer;
pub use deploy::portainer::PortainerDeployer;
pub use env::EnvMap;
pub use error::{DeployError, DeployResult, ValidationError};
pub use hooks::{DeployHooks, HookPoint, HookRunner};
pub use pipeline::DeployPipeline;
pub use plan::{DeployContext, DeployOutcome, DeployPlan};
