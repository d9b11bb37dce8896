//! Deploy pipeline: finalized archive to running instance.

use super::state::{DeployReport, DeployState, StateLog};
use super::{
    Adjuster, Orchestrator, PipelineError, PreconditionError, Result, failed_in, payload_disk_gb,
    validate_against,
};
use crate::archive::{self, ArchiveError, UnpackOutcome};
use crate::descriptor::{Descriptor, DomainType, InstanceId, read_ovf, validate_template_name};
use crate::distribution::DistributionError;
use crate::distribution::checksum::read_sidecar;
use crate::env;
use crate::hypervisor::{HypervisorAdapter, HypervisorError};
use crate::probe::HostCapacity;
use std::sync::Arc;
use tracing::{error, info, warn};

impl Orchestrator {
    /// Deploy `template_name` as a new instance
    ///
    /// `target` names the new instance; OpenVZ allocates the next free
    /// container ID when it is absent. The template must exist locally and
    /// the target must not; both are checked before anything is written.
    pub async fn deploy(
        &self,
        domain: DomainType,
        template_name: &str,
        target: Option<&str>,
        adjuster: &dyn Adjuster,
    ) -> Result<DeployReport> {
        validate_template_name(template_name).map_err(|e| PipelineError::Validation(vec![e]))?;
        let adapter = self.adapter(domain)?;

        if !self
            .repository
            .exists(domain, template_name)
            .await
            .map_err(failed_in(DeployState::CollisionChecked))?
        {
            return Err(PreconditionError::TemplateMissing {
                domain,
                name: template_name.to_string(),
            }
            .into());
        }
        let instance = adapter
            .allocate_instance(target)
            .await
            .map_err(|e| match e {
                HypervisorError::InvalidInstance(raw) => {
                    PipelineError::Precondition(PreconditionError::InvalidInstance(raw))
                }
                other => failed_in(DeployState::CollisionChecked)(other),
            })?;
        self.ensure_absent(adapter.as_ref(), &instance).await?;

        info!("Deploying '{}' as {} instance {}", template_name, domain, instance);
        let mut log = StateLog::new("deploy", template_name);
        let mut placed: Option<Descriptor> = None;
        match self
            .deploy_steps(&adapter, &instance, template_name, adjuster, &mut log, &mut placed)
            .await
        {
            Ok(rounds) => {
                log.enter(DeployState::Done);
                Ok(log.into_report(Some(instance), rounds))
            }
            Err(e) => {
                error!(
                    "Deploy of '{}' failed after {}: {}",
                    template_name,
                    log.current(),
                    e
                );
                log.begin_failure();
                if let Some(descriptor) = &placed {
                    adapter.cleanup(descriptor).await;
                }
                log.finish_failure();
                Err(e)
            }
        }
    }

    async fn ensure_absent(
        &self,
        adapter: &dyn HypervisorAdapter,
        instance: &InstanceId,
    ) -> Result<()> {
        if adapter
            .instance_exists(instance)
            .await
            .map_err(failed_in(DeployState::CollisionChecked))?
        {
            return Err(PreconditionError::InstanceExists(instance.clone()).into());
        }
        Ok(())
    }

    /// Runs every step after the preconditions. `placed` receives the
    /// descriptor as soon as payload placement starts, for cleanup.
    async fn deploy_steps(
        &self,
        adapter: &Arc<dyn HypervisorAdapter>,
        instance: &InstanceId,
        template_name: &str,
        adjuster: &dyn Adjuster,
        log: &mut StateLog<DeployState>,
        placed: &mut Option<Descriptor>,
    ) -> Result<u32> {
        let domain = adapter.domain_type();
        let archive_path = self.repository.archive_path(domain, template_name);
        let staging = self.repository.deploy_staging(domain, template_name);

        let checksum = self
            .checksummer
            .checksum_file(&archive_path)
            .await
            .map_err(failed_in(DeployState::Unarchived))?;
        match read_sidecar(&self.repository.sidecar_path(domain, template_name)).await {
            Ok(expected) if expected != checksum => {
                return Err(failed_in(DeployState::Unarchived)(
                    DistributionError::ChecksumMismatch {
                        template: template_name.to_string(),
                        expected,
                        actual: checksum,
                    },
                ));
            }
            Ok(_) => {}
            Err(e) => warn!("No usable sidecar for '{}': {}", template_name, e),
        }
        let outcome = {
            let archive_path = archive_path.clone();
            let staging = staging.clone();
            let checksum = checksum.clone();
            tokio::task::spawn_blocking(move || archive::unpack(&archive_path, &staging, &checksum))
                .await
                .map_err(failed_in(DeployState::Unarchived))?
                .map_err(failed_in(DeployState::Unarchived))?
        };
        if outcome == UnpackOutcome::Reused {
            info!("Reusing unpacked copy of '{}'", template_name);
        }
        log.enter(DeployState::Unarchived);

        let mut descriptor = read_ovf(&staging.join(env::descriptor_file_name(template_name)))
            .await
            .map_err(failed_in(DeployState::ConfigParsed))?;
        descriptor.instance = Some(instance.clone());
        log.enter(DeployState::ConfigParsed);

        if descriptor.domain_type() != domain {
            return Err(PreconditionError::DomainMismatch {
                expected: domain,
                found: descriptor.domain_type(),
            }
            .into());
        }
        if descriptor.template_name != template_name {
            return Err(PreconditionError::NameMismatch {
                expected: template_name.to_string(),
                found: descriptor.template_name,
            }
            .into());
        }
        self.ensure_absent(adapter.as_ref(), instance).await?;
        for file in descriptor.payload_files() {
            let path = staging.join(&file);
            if !path.exists() {
                return Err(failed_in(DeployState::CollisionChecked)(
                    ArchiveError::MissingPayload(path),
                ));
            }
        }
        log.enter(DeployState::CollisionChecked);

        let capacity = HostCapacity::gather(self.probe.as_ref(), adapter.storage_path())
            .await
            .map_err(failed_in(DeployState::Reconciled))?
            .with_disk_floor(payload_disk_gb(&descriptor));
        let (mut descriptor, rounds) = self
            .adjustment_loop(
                log,
                DeployState::AwaitingUserAdjustment,
                &mut descriptor,
                adjuster,
                |d| validate_against(d, &capacity),
            )
            .await?;
        descriptor.instance = Some(instance.clone());
        log.enter(DeployState::Reconciled);

        let descriptor = placed.insert(descriptor);
        adapter
            .prepare_filesystem_for_deploy(descriptor, &staging)
            .await
            .map_err(failed_in(DeployState::FilesystemPlaced))?;
        log.enter(DeployState::FilesystemPlaced);

        let native = adapter
            .generate_config(descriptor)
            .map_err(failed_in(DeployState::NativeConfigGenerated))?;
        log.enter(DeployState::NativeConfigGenerated);

        adapter
            .define(descriptor, &native)
            .await
            .map_err(failed_in(DeployState::Defined))?;
        if self.config.start_after_deploy {
            adapter
                .start(descriptor)
                .await
                .map_err(failed_in(DeployState::Defined))?;
        }
        log.enter(DeployState::Defined);

        info!(
            "Deployed '{}' as {} ({:.2} GB memory, {} vcpu, {:.2} GB disk)",
            template_name,
            instance,
            descriptor.bounds.memory.normal,
            descriptor.bounds.vcpu.normal,
            descriptor.bounds.disk.normal
        );
        Ok(rounds)
    }
}
