//! CLI-specific functionality for vmtpl
//!
//! This module contains argument parsing, configuration discovery and the
//! wiring that turns a [`PipelineConfig`] into a ready [`Orchestrator`].

pub mod args;
pub mod config;

pub use args::{Args, CaptureConfig, DeployConfig, ExecutionMode, OverrideArgs};
pub use config::{ConfigDiscovery, ConfigError, PipelineConfig};

use crate::descriptor::DomainType;
use crate::distribution::{Checksummer, DistributionClient, DistributionError, HttpTransport};
use crate::executor::CommandExecutor;
use crate::hypervisor::{KvmAdapter, OpenvzAdapter};
use crate::orchestrator::Orchestrator;
use crate::probe::HostProbe;
use crate::repository::Repository;
use std::sync::Arc;
use tracing::{debug, warn};

/// Host tools each adapter shells out to
pub fn required_tools(domain: DomainType) -> &'static [&'static str] {
    match domain {
        DomainType::Kvm => &["virsh", "qemu-img", "blockdev"],
        DomainType::Openvz => &["vzctl", "vzlist"],
    }
}

/// Tools from [`required_tools`] that are not on `PATH`
pub fn missing_tools(domain: DomainType) -> Vec<&'static str> {
    let missing: Vec<_> = required_tools(domain)
        .iter()
        .copied()
        .filter(|tool| which::which(tool).is_err())
        .collect();
    for tool in &missing {
        warn!("{} tool '{}' not found on PATH", domain, tool);
    }
    missing
}

/// Build an orchestrator with both adapters, the host probe and, when a
/// mirror list is configured, the HTTP distribution client
pub fn build_orchestrator(
    config: &PipelineConfig,
    executor: Arc<dyn CommandExecutor>,
) -> Result<Orchestrator, DistributionError> {
    let checksummer = Checksummer::from_mode(&config.checksum, executor.clone());
    let mut orchestrator = Orchestrator::new(
        Repository::from_config(&config.repository),
        Arc::new(HostProbe::new(executor.clone())),
        checksummer.clone(),
        config.orchestrator.clone(),
    )
    .with_adapter(Arc::new(KvmAdapter::new(executor.clone(), config.kvm.clone())))
    .with_adapter(Arc::new(OpenvzAdapter::new(executor, config.openvz.clone())));

    if config.distribution.mirror_list_url.trim().is_empty() {
        debug!("No mirror list configured; fetch and sync are disabled");
    } else {
        let transport = HttpTransport::new(&config.distribution)?;
        orchestrator = orchestrator.with_distribution(DistributionClient::new(
            Arc::new(transport),
            checksummer,
            config.distribution.clone(),
        ));
    }
    Ok(orchestrator)
}
