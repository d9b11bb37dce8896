//! Template fetch protocol.

use super::catalog::parse_remote_catalog;
use super::checksum::{Checksummer, parse_sidecar, sidecar_for};
use super::mirror::{MirrorList, resource_url};
use super::transport::{Progress, Transport};
use super::{DistributionConfig, DistributionError, Result};
use crate::descriptor::DomainType;
use crate::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// Result of fetching one template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The local archive already matched the remote sidecar
    UpToDate { archive: PathBuf },
    /// A verified archive was downloaded
    Downloaded { archive: PathBuf, attempts: u32 },
}

impl FetchOutcome {
    pub fn archive(&self) -> &Path {
        match self {
            FetchOutcome::UpToDate { archive } | FetchOutcome::Downloaded { archive, .. } => {
                archive
            }
        }
    }
}

/// Client for the remote template repository
#[derive(Clone)]
pub struct DistributionClient {
    transport: Arc<dyn Transport>,
    checksummer: Checksummer,
    config: DistributionConfig,
}

impl std::fmt::Debug for DistributionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributionClient")
            .field("checksummer", &self.checksummer)
            .field("config", &self.config)
            .finish()
    }
}

impl DistributionClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        checksummer: Checksummer,
        config: DistributionConfig,
    ) -> Self {
        Self {
            transport,
            checksummer,
            config,
        }
    }

    pub fn config(&self) -> &DistributionConfig {
        &self.config
    }

    /// Fetch the mirror list and pick one mirror for this session
    pub async fn select_mirror(&self) -> Result<Url> {
        let list = MirrorList::fetch(self.transport.as_ref(), &self.config.mirror_list_url).await?;
        list.choose()
            .cloned()
            .ok_or_else(|| DistributionError::NoMirrors(self.config.mirror_list_url.clone()))
    }

    /// Template names a mirror offers for `domain`
    pub async fn remote_catalog(&self, mirror: &Url, domain: DomainType) -> Result<Vec<String>> {
        let url = resource_url(
            mirror,
            domain.as_str(),
            env::template::REMOTE_CATALOG_FILE_NAME,
        )?;
        let text = self.transport.get_text(&url).await?;
        Ok(parse_remote_catalog(&text))
    }

    /// Fetch `<template_name>.tar` and its sidecar into `dest_dir`
    ///
    /// The archive only appears at its canonical path after its checksum
    /// matched the remote sidecar. After the configured number of failed
    /// attempts no archive or sidecar is left for this template.
    pub async fn fetch_template(
        &self,
        mirror: &Url,
        domain: DomainType,
        template_name: &str,
        dest_dir: &Path,
        progress: Progress<'_>,
    ) -> Result<FetchOutcome> {
        let archive_name = env::archive_file_name(template_name);
        let sidecar_name = env::sidecar_file_name(template_name);
        let archive_url = resource_url(mirror, domain.as_str(), &archive_name)?;
        let sidecar_url = resource_url(mirror, domain.as_str(), &sidecar_name)?;
        let archive_path = dest_dir.join(&archive_name);
        let attempts = self.config.retry_attempts.max(1);

        tokio::fs::create_dir_all(dest_dir).await?;

        let mut last_error = None;
        for attempt in 1..=attempts {
            info!(
                "Fetching '{}' from {} (attempt {}/{})",
                template_name, mirror, attempt, attempts
            );
            match self
                .try_fetch(&archive_url, &sidecar_url, &archive_path, template_name, progress)
                .await
            {
                Ok(true) => {
                    info!("'{}' is up to date", template_name);
                    return Ok(FetchOutcome::UpToDate {
                        archive: archive_path,
                    });
                }
                Ok(false) => {
                    info!("Downloaded '{}' after {} attempt(s)", template_name, attempt);
                    return Ok(FetchOutcome::Downloaded {
                        archive: archive_path,
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    warn!("Attempt {} for '{}' failed: {}", attempt, template_name, e);
                    if matches!(e, DistributionError::ChecksumMismatch { .. }) {
                        remove_if_exists(&archive_path).await;
                        remove_if_exists(&sidecar_for(&archive_path)).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(DistributionError::RetriesExhausted {
            template: template_name.to_string(),
            attempts,
            last: Box::new(
                last_error.unwrap_or_else(|| DistributionError::NotFound(archive_url.to_string())),
            ),
        })
    }

    /// One pass of the protocol; `true` when already up to date
    async fn try_fetch(
        &self,
        archive_url: &Url,
        sidecar_url: &Url,
        archive_path: &Path,
        template_name: &str,
        progress: Progress<'_>,
    ) -> Result<bool> {
        let sidecar_path = sidecar_for(archive_path);
        let sidecar_text = self.transport.get_text(sidecar_url).await?;
        let expected = parse_sidecar(&sidecar_text)
            .ok_or_else(|| DistributionError::InvalidSidecar(sidecar_path.clone()))?;

        if tokio::fs::try_exists(archive_path).await? {
            let local = self.checksummer.checksum_file(archive_path).await?;
            if local == expected {
                tokio::fs::write(&sidecar_path, format!("{}\n", expected)).await?;
                return Ok(true);
            }
            debug!("Local '{}' is stale ({} != {})", template_name, local, expected);
        }

        let dest_dir = archive_path.parent().unwrap_or_else(|| Path::new("."));
        let temp = tempfile::Builder::new()
            .prefix(&format!(".{}.", template_name))
            .suffix(".tar.download")
            .tempfile_in(dest_dir)?;
        let mut file = tokio::fs::File::from_std(temp.reopen()?);
        self.transport
            .download(archive_url, &mut file, progress)
            .await?;
        file.sync_all().await?;
        drop(file);

        let actual = self.checksummer.checksum_file(temp.path()).await?;
        if actual != expected {
            return Err(DistributionError::ChecksumMismatch {
                template: template_name.to_string(),
                expected,
                actual,
            });
        }

        temp.persist(archive_path).map_err(|e| DistributionError::IoError(e.error))?;
        tokio::fs::write(&sidecar_path, format!("{}\n", expected)).await?;
        Ok(false)
    }
}

async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}
