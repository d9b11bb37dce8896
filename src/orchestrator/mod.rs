//! # Deployment Orchestrator
//!
//! Drives the two end-to-end pipelines, calling the adapters, reconciler,
//! archive manager and distribution client in sequence:
//!
//! - **capture**: running instance → descriptor + payload → archive + sidecar
//! - **deploy**: archive → descriptor + payload → reconciled, running instance
//!
//! Both pipelines check their hard preconditions (name collisions, missing
//! template or source) before touching the filesystem. Validation failures
//! loop back to the [`Adjuster`]; any other failure runs cleanup and is
//! surfaced with the step that triggered it.
//!
//! Catalog maintenance ([`Orchestrator::fetch`], [`Orchestrator::sync`])
//! lives in the `sync` submodule.

mod capture;
mod deploy;
pub mod state;
mod sync;

pub use state::{
    CaptureReport, CaptureState, DeployReport, DeployState, PipelineState, RunReport, StateLog,
};
pub use sync::SyncReport;

use crate::archive::ArchiveError;
use crate::descriptor::{Descriptor, DescriptorError, DomainType, InstanceId, ValidationError};
use crate::distribution::{Checksummer, DistributionClient, DistributionError};
use crate::hypervisor::{HypervisorAdapter, HypervisorError};
use crate::probe::{HostCapacity, ProbeError, ResourceProbe};
use crate::reconcile::reconcile;
use crate::repository::Repository;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// A hard precondition that makes the run pointless
#[derive(Debug, thiserror::Error)]
pub enum PreconditionError {
    #[error("No adapter configured for {0}")]
    NoAdapter(DomainType),

    #[error("Template '{name}' already exists in the {domain} repository")]
    TemplateExists { domain: DomainType, name: String },

    #[error("Template '{name}' not found in the {domain} repository")]
    TemplateMissing { domain: DomainType, name: String },

    #[error("Instance {0} already exists")]
    InstanceExists(InstanceId),

    #[error("Instance {0} does not exist")]
    InstanceMissing(InstanceId),

    #[error("Invalid instance: {0}")]
    InvalidInstance(String),

    #[error("Template is for {found}, expected {expected}")]
    DomainMismatch {
        expected: DomainType,
        found: DomainType,
    },

    #[error("Descriptor names template '{found}', expected '{expected}'")]
    NameMismatch { expected: String, found: String },

    #[error("No distribution mirror list configured")]
    DistributionDisabled,
}

/// Failure of one pipeline step
#[derive(Debug, thiserror::Error)]
pub enum StepFailure {
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Distribution(#[from] DistributionError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for StepFailure {
    fn from(e: tokio::task::JoinError) -> Self {
        StepFailure::Task(e.to_string())
    }
}

/// Errors surfaced by a pipeline run
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Precondition failed: {0}")]
    Precondition(#[from] PreconditionError),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    #[error("Transfer failed: {0}")]
    Transport(#[from] DistributionError),

    #[error("Step '{step}' failed: {source}")]
    Step {
        step: String,
        #[source]
        source: StepFailure,
    },

    #[error("Aborted by operator")]
    Aborted,
}

impl PipelineError {
    /// Validation errors carried by this failure, if any
    pub fn validation_errors(&self) -> &[ValidationError] {
        match self {
            PipelineError::Validation(errors) => errors,
            _ => &[],
        }
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Wrap an error as the failure of the step `state` was in
pub(crate) fn failed_in<S, E>(state: S) -> impl FnOnce(E) -> PipelineError
where
    S: fmt::Display,
    E: Into<StepFailure>,
{
    move |e| PipelineError::Step {
        step: state.to_string(),
        source: e.into(),
    }
}

/// Orchestrator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Times the adjuster is consulted before giving up
    pub max_adjustment_rounds: u32,
    /// Start the instance once it is defined
    pub start_after_deploy: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_adjustment_rounds: 3,
            start_after_deploy: true,
        }
    }
}

/// What the adjuster wants after looking at the descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Validate again
    Proceed,
    /// Give up on this run
    Abort,
}

/// Operator hook consulted in `AwaitingUserAdjustment`
///
/// `errors` is empty on the first round. `round` starts at 1.
#[async_trait]
pub trait Adjuster: Send + Sync {
    async fn adjust(
        &self,
        descriptor: &mut Descriptor,
        errors: &[ValidationError],
        round: u32,
    ) -> Decision;
}

/// Non-interactive adjuster: apply fixed values once, abort if the
/// result still does not validate
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Overrides {
    /// Memory in GB
    pub memory: Option<f64>,
    pub vcpu: Option<u32>,
    /// Disk in GB
    pub disk: Option<f64>,
    /// CPU usage limit in percent (OpenVZ)
    pub vcpu_limit: Option<u32>,
    pub hostname: Option<String>,
    pub ip_address: Option<String>,
    pub nameserver: Option<String>,
}

impl Overrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Write every set value into `descriptor`'s `normal` slots and settings
    pub fn apply(&self, descriptor: &mut Descriptor) {
        if let Some(memory) = self.memory {
            descriptor.bounds.memory.normal = memory;
        }
        if let Some(vcpu) = self.vcpu {
            descriptor.bounds.vcpu.normal = vcpu;
        }
        if let Some(disk) = self.disk {
            descriptor.bounds.disk.normal = disk;
        }
        if let Some(settings) = descriptor.openvz_mut() {
            if let Some(limit) = self.vcpu_limit {
                settings.vcpu_limit.normal = limit;
            }
            if let Some(hostname) = &self.hostname {
                settings.hostname = Some(hostname.clone());
            }
            if let Some(ip) = &self.ip_address {
                settings.ip_address = Some(ip.clone());
            }
            if let Some(nameserver) = &self.nameserver {
                settings.nameserver = Some(nameserver.clone());
            }
        }
    }
}

#[async_trait]
impl Adjuster for Overrides {
    async fn adjust(
        &self,
        descriptor: &mut Descriptor,
        errors: &[ValidationError],
        round: u32,
    ) -> Decision {
        if round > 1 {
            debug!("{} validation error(s) remain after overrides", errors.len());
            return Decision::Abort;
        }
        if !self.is_empty() {
            info!("Applying overrides to '{}'", descriptor.template_name);
            self.apply(descriptor);
        }
        Decision::Proceed
    }
}

/// Pipeline driver holding every collaborator explicitly
pub struct Orchestrator {
    adapters: BTreeMap<DomainType, Arc<dyn HypervisorAdapter>>,
    repository: Repository,
    probe: Arc<dyn ResourceProbe>,
    checksummer: Checksummer,
    distribution: Option<DistributionClient>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        repository: Repository,
        probe: Arc<dyn ResourceProbe>,
        checksummer: Checksummer,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            adapters: BTreeMap::new(),
            repository,
            probe,
            checksummer,
            distribution: None,
            config,
        }
    }

    /// Register the adapter for its domain type, replacing any previous one
    pub fn with_adapter(mut self, adapter: Arc<dyn HypervisorAdapter>) -> Self {
        self.adapters.insert(adapter.domain_type(), adapter);
        self
    }

    pub fn with_distribution(mut self, client: DistributionClient) -> Self {
        self.distribution = Some(client);
        self
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn adapter(&self, domain: DomainType) -> Result<Arc<dyn HypervisorAdapter>> {
        self.adapters
            .get(&domain)
            .cloned()
            .ok_or(PipelineError::Precondition(PreconditionError::NoAdapter(domain)))
    }

    /// Names of finalized templates in the local repository, sorted
    pub async fn list_local_templates(&self, domain: DomainType) -> Result<Vec<String>> {
        self.repository
            .list_local_templates(domain)
            .await
            .map_err(failed_in("list"))
    }

    fn distribution(&self) -> Result<&DistributionClient> {
        self.distribution
            .as_ref()
            .ok_or(PipelineError::Precondition(PreconditionError::DistributionDisabled))
    }

    /// Consult the adjuster until `validate` returns no errors
    ///
    /// Returns the validated descriptor and the number of rounds used.
    async fn adjustment_loop<S, F>(
        &self,
        log: &mut StateLog<S>,
        awaiting: S,
        descriptor: &mut Descriptor,
        adjuster: &dyn Adjuster,
        validate: F,
    ) -> Result<(Descriptor, u32)>
    where
        S: PipelineState,
        F: Fn(&Descriptor) -> std::result::Result<Descriptor, Vec<ValidationError>>,
    {
        let max_rounds = self.config.max_adjustment_rounds.max(1);
        let mut errors: Vec<ValidationError> = Vec::new();

        for round in 1..=max_rounds {
            log.enter(awaiting);
            match adjuster.adjust(descriptor, &errors, round).await {
                Decision::Proceed => {}
                Decision::Abort if errors.is_empty() => return Err(PipelineError::Aborted),
                Decision::Abort => return Err(PipelineError::Validation(errors)),
            }

            match validate(descriptor) {
                Ok(validated) => return Ok((validated, round)),
                Err(found) => {
                    info!(
                        "'{}' has {} validation error(s) (round {}/{})",
                        descriptor.template_name,
                        found.len(),
                        round,
                        max_rounds
                    );
                    for error in &found {
                        debug!("  {}", error);
                    }
                    errors = found;
                }
            }
        }

        Err(PipelineError::Validation(errors))
    }
}

/// Structural and bound checks on the declared values, then reconciliation
/// against `capacity`
///
/// On success the reconciled descriptor is returned; otherwise every error
/// found, at most one per dimension.
pub(crate) fn validate_against(
    descriptor: &Descriptor,
    capacity: &HostCapacity,
) -> std::result::Result<Descriptor, Vec<ValidationError>> {
    let mut errors = descriptor.validate();
    let reconciliation = reconcile(descriptor, capacity);
    for error in reconciliation.errors {
        let reported = error.dimension().is_some()
            && errors.iter().any(|e| e.dimension() == error.dimension());
        if !reported {
            errors.push(error);
        }
    }
    if errors.is_empty() {
        Ok(reconciliation.descriptor)
    } else {
        Err(errors)
    }
}

/// Combined capacity of the descriptor's disk images, in GB
pub(crate) fn payload_disk_gb(descriptor: &Descriptor) -> f64 {
    descriptor.disks.iter().map(|disk| disk.capacity_gb).sum()
}
