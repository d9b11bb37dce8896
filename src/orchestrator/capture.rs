//! Capture pipeline: running instance to finalized archive.

use super::state::{CaptureReport, CaptureState, StateLog};
use super::{
    Adjuster, Orchestrator, PipelineError, PreconditionError, Result, failed_in, payload_disk_gb,
    validate_against,
};
use crate::archive;
use crate::descriptor::{DomainType, InstanceId, validate_template_name, write_ovf};
use crate::distribution::checksum::sidecar_for;
use crate::env;
use crate::hypervisor::HypervisorAdapter;
use crate::probe::HostCapacity;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What a failed capture has to remove
#[derive(Debug, Default)]
struct CaptureScratch {
    staging: Option<PathBuf>,
    archive: Option<PathBuf>,
}

impl CaptureScratch {
    async fn clean(&mut self) {
        if let Some(archive) = self.archive.take() {
            for file in [sidecar_for(&archive), archive] {
                match tokio::fs::remove_file(&file).await {
                    Ok(()) => debug!("Cleanup: removed {}", file.display()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!("Cleanup: failed to remove {}: {}", file.display(), e),
                }
            }
        }
        if let Some(staging) = self.staging.take() {
            match tokio::fs::remove_dir_all(&staging).await {
                Ok(()) => debug!("Cleanup: removed {}", staging.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Cleanup: failed to remove {}: {}", staging.display(), e),
            }
        }
    }
}

impl Orchestrator {
    /// Capture `source` into a new template named `template_name`
    ///
    /// The source must exist and the name must be free in the repository;
    /// both are checked before anything is written.
    pub async fn capture(
        &self,
        domain: DomainType,
        source: &str,
        template_name: &str,
        adjuster: &dyn Adjuster,
    ) -> Result<CaptureReport> {
        validate_template_name(template_name).map_err(|e| PipelineError::Validation(vec![e]))?;
        let adapter = self.adapter(domain)?;
        let source = adapter
            .parse_instance(source)
            .map_err(|e| PreconditionError::InvalidInstance(e.to_string()))?;

        if !adapter
            .instance_exists(&source)
            .await
            .map_err(failed_in(CaptureState::SourceSelected))?
        {
            return Err(PreconditionError::InstanceMissing(source).into());
        }
        if self
            .repository
            .exists(domain, template_name)
            .await
            .map_err(failed_in(CaptureState::SourceSelected))?
        {
            return Err(PreconditionError::TemplateExists {
                domain,
                name: template_name.to_string(),
            }
            .into());
        }

        info!("Capturing {} instance {} as '{}'", domain, source, template_name);
        let mut log = StateLog::new("capture", template_name);
        let mut scratch = CaptureScratch::default();
        match self
            .capture_steps(&adapter, &source, template_name, adjuster, &mut log, &mut scratch)
            .await
        {
            Ok(rounds) => {
                log.enter(CaptureState::Done);
                Ok(log.into_report(Some(source), rounds))
            }
            Err(e) => {
                error!(
                    "Capture of '{}' failed after {}: {}",
                    template_name,
                    log.current(),
                    e
                );
                log.begin_failure();
                scratch.clean().await;
                log.finish_failure();
                Err(e)
            }
        }
    }

    async fn capture_steps(
        &self,
        adapter: &Arc<dyn HypervisorAdapter>,
        source: &InstanceId,
        template_name: &str,
        adjuster: &dyn Adjuster,
        log: &mut StateLog<CaptureState>,
        scratch: &mut CaptureScratch,
    ) -> Result<u32> {
        let domain = adapter.domain_type();

        let mut descriptor = adapter
            .capture_config(source, template_name)
            .await
            .map_err(failed_in(CaptureState::SourceSelected))?;
        log.enter(CaptureState::SourceSelected);

        log.enter(CaptureState::FilesystemCopying);
        let staging = self.repository.capture_staging(domain, template_name);
        let stale = tokio::fs::try_exists(&staging)
            .await
            .map_err(failed_in(CaptureState::FilesystemCopying))?;
        if stale {
            debug!("Removing leftover staging tree {}", staging.display());
            tokio::fs::remove_dir_all(&staging)
                .await
                .map_err(failed_in(CaptureState::FilesystemCopying))?;
        }
        scratch.staging = Some(staging.clone());
        let payload = adapter
            .prepare_filesystem_for_capture(&mut descriptor, &staging)
            .await
            .map_err(failed_in(CaptureState::FilesystemCopying))?;

        if descriptor.domain_type() != domain {
            return Err(PreconditionError::DomainMismatch {
                expected: domain,
                found: descriptor.domain_type(),
            }
            .into());
        }
        log.enter(CaptureState::ConfigParsed);

        // a template may never declare less disk than the source uses
        let quota = self
            .probe
            .quota_floor_gb(source)
            .await
            .map_err(failed_in(CaptureState::ConfigParsed))?;
        let capacity = HostCapacity::unbounded().with_disk_floor(payload_disk_gb(&descriptor).max(quota));

        let (descriptor, rounds) = self
            .adjustment_loop(
                log,
                CaptureState::AwaitingUserAdjustment,
                &mut descriptor,
                adjuster,
                |d| validate_against(d, &capacity),
            )
            .await?;
        if descriptor.template_name != template_name {
            return Err(PreconditionError::NameMismatch {
                expected: template_name.to_string(),
                found: descriptor.template_name,
            }
            .into());
        }
        log.enter(CaptureState::Validated);

        let descriptor_file = env::descriptor_file_name(template_name);
        write_ovf(&staging.join(&descriptor_file), &descriptor)
            .await
            .map_err(failed_in(CaptureState::Packaged))?;
        let dest_dir = self.repository.domain_dir(domain);
        tokio::fs::create_dir_all(&dest_dir)
            .await
            .map_err(failed_in(CaptureState::Packaged))?;
        let archive = {
            let name = template_name.to_string();
            let staging = staging.clone();
            tokio::task::spawn_blocking(move || {
                archive::pack(&name, &staging, &descriptor_file, &payload, &dest_dir)
            })
            .await
            .map_err(failed_in(CaptureState::Packaged))?
            .map_err(failed_in(CaptureState::Packaged))?
        };
        scratch.archive = Some(archive.clone());
        log.enter(CaptureState::Packaged);

        let token = self
            .checksummer
            .write_sidecar(&archive)
            .await
            .map_err(failed_in(CaptureState::Archived))?;
        log.enter(CaptureState::Archived);
        info!(
            "Template '{}' archived at {} (checksum {})",
            template_name,
            archive.display(),
            token
        );

        // finalized: nothing left for cleanup to undo
        scratch.archive = None;
        scratch.clean().await;
        Ok(rounds)
    }
}
