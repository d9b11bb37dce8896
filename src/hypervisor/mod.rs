//! # Hypervisor Adapters
//!
//! KVM guests and OpenVZ containers package their payload in fundamentally
//! different ways (disk images versus a whole-filesystem archive). They share
//! only the [`Descriptor`] and the lifecycle shape captured by
//! [`HypervisorAdapter`]:
//!
//! - **capture**: [`capture_config`](HypervisorAdapter::capture_config) reads
//!   the live configuration, then
//!   [`prepare_filesystem_for_capture`](HypervisorAdapter::prepare_filesystem_for_capture)
//!   copies the payload into a staging directory
//! - **deploy**: [`prepare_filesystem_for_deploy`](HypervisorAdapter::prepare_filesystem_for_deploy)
//!   places the payload where the hypervisor expects it,
//!   [`generate_config`](HypervisorAdapter::generate_config) builds native
//!   configuration from `normal` values, and
//!   [`define`](HypervisorAdapter::define) registers the instance
//!
//! All host interaction goes through a [`CommandExecutor`](crate::executor::CommandExecutor).

pub mod kvm;
pub mod openvz;

pub use kvm::{KvmAdapter, KvmConfig};
pub use openvz::{OpenvzAdapter, OpenvzConfig, VeConf, next_ctid};

use crate::descriptor::{Descriptor, DescriptorError, DomainType, InstanceId};
use crate::executor::ExecutorError;
use async_trait::async_trait;
use std::path::Path;

/// Hypervisor adapter errors
#[derive(Debug, thiserror::Error)]
pub enum HypervisorError {
    #[error("Command error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("Native configuration error: {0}")]
    NativeConfig(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Invalid instance identifier '{0}'")]
    InvalidInstance(String),

    #[error("Target path already exists: {0}")]
    PathExists(String),

    #[error("Failed to parse {what}: {detail}")]
    Parse { what: String, detail: String },

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HypervisorError>;

/// Configuration artifact produced for one hypervisor
#[derive(Debug, Clone, PartialEq)]
pub enum NativeConfig {
    /// libvirt domain XML
    DomainXml(String),
    /// Resource and network keys merged into a container's conf file
    VeConf(VeConf),
}

impl NativeConfig {
    /// Text form, as written to disk
    pub fn render(&self) -> String {
        match self {
            NativeConfig::DomainXml(xml) => xml.clone(),
            NativeConfig::VeConf(conf) => conf.render(),
        }
    }
}

/// Capture, placement and lifecycle operations for one hypervisor family
#[async_trait]
pub trait HypervisorAdapter: Send + Sync {
    fn domain_type(&self) -> DomainType;

    /// Filesystem that deployed payload lands on, probed for free space
    fn storage_path(&self) -> &Path;

    /// Parse an operator-supplied instance handle
    fn parse_instance(&self, raw: &str) -> Result<InstanceId>;

    /// Every instance known to the control plane
    async fn list_instances(&self) -> Result<Vec<InstanceId>>;

    async fn instance_exists(&self, instance: &InstanceId) -> Result<bool> {
        Ok(self.list_instances().await?.contains(instance))
    }

    /// Identity for a new instance; `requested` may be absent where the
    /// hypervisor can allocate one
    async fn allocate_instance(&self, requested: Option<&str>) -> Result<InstanceId>;

    /// Descriptor with live values in the `normal` slot of each bound
    async fn capture_config(&self, instance: &InstanceId, template_name: &str)
    -> Result<Descriptor>;

    /// Copy the payload into `staging_dir`, rewriting the descriptor's
    /// payload references to the returned relative paths
    async fn prepare_filesystem_for_capture(
        &self,
        descriptor: &mut Descriptor,
        staging_dir: &Path,
    ) -> Result<Vec<String>>;

    /// Place payload from `staging_dir` where the hypervisor expects it,
    /// rewriting payload references to host paths
    async fn prepare_filesystem_for_deploy(
        &self,
        descriptor: &mut Descriptor,
        staging_dir: &Path,
    ) -> Result<()>;

    /// Native configuration built from `normal` values
    fn generate_config(&self, descriptor: &Descriptor) -> Result<NativeConfig>;

    /// Register the instance with the control plane
    async fn define(&self, descriptor: &Descriptor, config: &NativeConfig) -> Result<()>;

    async fn start(&self, descriptor: &Descriptor) -> Result<()>;

    /// Stop and unregister the instance
    async fn destroy(&self, descriptor: &Descriptor) -> Result<()>;

    /// Undo deploy-side placement and definition. Never fails; problems are
    /// logged.
    async fn cleanup(&self, descriptor: &Descriptor);
}

/// Instance a deploy-side descriptor targets
pub(crate) fn target_instance(descriptor: &Descriptor) -> Result<&InstanceId> {
    descriptor.instance.as_ref().ok_or_else(|| {
        HypervisorError::InvalidInstance(format!(
            "no target instance set for '{}'",
            descriptor.template_name
        ))
    })
}

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

pub(crate) fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GIB
}

pub(crate) fn gb_to_bytes(gb: f64) -> u64 {
    (gb * BYTES_PER_GIB).round() as u64
}
