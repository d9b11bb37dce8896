//! Catalog maintenance against the remote repository.

use super::{Orchestrator, PipelineError, Result, failed_in};
use crate::descriptor::{DomainType, validate_template_name};
use crate::distribution::transport::Progress;
use crate::distribution::{CatalogDiff, FetchOutcome};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// What one [`Orchestrator::sync`] run changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub mirror: String,
    pub downloaded: Vec<String>,
    pub up_to_date: Vec<String>,
    pub deleted: Vec<String>,
    /// Selected names the mirror does not offer
    pub unavailable: Vec<String>,
}

impl Orchestrator {
    /// Fetch one template from a randomly chosen mirror
    pub async fn fetch(
        &self,
        domain: DomainType,
        template_name: &str,
        progress: Progress<'_>,
    ) -> Result<FetchOutcome> {
        validate_template_name(template_name).map_err(|e| PipelineError::Validation(vec![e]))?;
        let client = self.distribution()?;
        let mirror = client.select_mirror().await?;
        let outcome = client
            .fetch_template(
                &mirror,
                domain,
                template_name,
                &self.repository.domain_dir(domain),
                progress,
            )
            .await?;
        Ok(outcome)
    }

    /// Make the local catalog match `selected`
    ///
    /// Selected templates the mirror offers are fetched; local templates
    /// that are not selected are deleted together with their sidecar and
    /// unpacked copy. One mirror serves the whole session.
    pub async fn sync(
        &self,
        domain: DomainType,
        selected: &[String],
        progress: Progress<'_>,
    ) -> Result<SyncReport> {
        let client = self.distribution()?;
        let mirror = client.select_mirror().await?;
        let remote = client.remote_catalog(&mirror, domain).await?;
        let local = self.list_local_templates(domain).await?;
        let diff = CatalogDiff::compute(&local, &remote, selected);
        info!(
            "Sync {} from {}: {} to fetch, {} to delete",
            domain,
            mirror,
            diff.download.len(),
            diff.delete.len()
        );

        let mut report = SyncReport {
            mirror: mirror.to_string(),
            unavailable: diff.unavailable.iter().cloned().collect(),
            ..Default::default()
        };
        for name in &report.unavailable {
            warn!("'{}' is not offered by {}", name, mirror);
        }

        let dest_dir = self.repository.domain_dir(domain);
        for name in &diff.download {
            match client
                .fetch_template(&mirror, domain, name, &dest_dir, progress)
                .await?
            {
                FetchOutcome::UpToDate { .. } => report.up_to_date.push(name.clone()),
                FetchOutcome::Downloaded { .. } => report.downloaded.push(name.clone()),
            }
        }

        for name in &diff.delete {
            self.repository
                .delete_template(domain, name)
                .await
                .map_err(failed_in("delete"))?;
            report.deleted.push(name.clone());
        }

        Ok(report)
    }
}
