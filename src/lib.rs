//! # vmtpl
//!
//! Captures running virtual machines into portable, self-describing
//! templates, distributes those templates through mirrors, and redeploys
//! them as new instances with resource limits fitted to the target host.
//!
//! Two hypervisors are supported: KVM guests managed by libvirt and
//! OpenVZ containers.
//!
//! ## Architecture Overview
//!
//! - **[`descriptor`]**: the neutral template descriptor and its OVF codec
//! - **[`hypervisor`]**: per-hypervisor adapters converting between native
//!   configuration and descriptors, plus lifecycle operations
//! - **[`reconcile`]**: fits declared `min`/`normal`/`max` bounds to host capacity
//! - **[`archive`]**: tar packaging and checksum-keyed unpacking
//! - **[`distribution`]**: integrity tokens, mirror selection, verified
//!   downloads and catalog diffing
//! - **[`orchestrator`]**: the capture and deploy state machines
//!
//! ## Pipelines
//!
//! ```text
//! capture: instance → adapter → descriptor → archive + sidecar → repository
//! deploy:  repository → archive → descriptor → reconcile → adapter → instance
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vmtpl::cli::{PipelineConfig, build_orchestrator};
//! use vmtpl::descriptor::DomainType;
//! use vmtpl::executor::HostExecutor;
//! use vmtpl::orchestrator::Overrides;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::default();
//!     let orchestrator = build_orchestrator(&config, Arc::new(HostExecutor::new()))?;
//!
//!     let report = orchestrator
//!         .deploy(DomainType::Openvz, "web", None, &Overrides::default())
//!         .await?;
//!     println!("deployed as {:?}", report.instance);
//!     Ok(())
//! }
//! ```

/// Tar packaging of templates and checksum-keyed unpacking.
pub mod archive;

/// Command-line surface and configuration discovery.
pub mod cli;

/// Template descriptor model and OVF codec.
pub mod descriptor;

/// Checksums, mirrors, remote catalogs and verified downloads.
pub mod distribution;

/// Environment constants and path utilities.
///
/// Centralizes the repository layout and configuration paths used
/// throughout the crate.
pub mod env;

/// External command execution behind a trait.
pub mod executor;

/// KVM and OpenVZ adapters.
pub mod hypervisor;

/// Capture and deploy pipelines.
pub mod orchestrator;

/// Host resource probing.
pub mod probe;

/// Resource bound reconciliation.
pub mod reconcile;

/// Local template repository layout and queries.
pub mod repository;

pub use descriptor::{Descriptor, DomainType, InstanceId, ResourceBounds, ValidationError};
pub use distribution::{Checksummer, DistributionClient};
pub use hypervisor::{HypervisorAdapter, KvmAdapter, OpenvzAdapter};
pub use orchestrator::{Adjuster, Orchestrator, OrchestratorConfig, Overrides, PipelineError};
pub use repository::Repository;
