//! Local template repository.
//!
//! A [`Repository`] is an explicit handle on the repository root. Every
//! component that reads or writes the local catalog receives one, so tests
//! point it at a temporary directory.
//!
//! Layout under the root:
//!
//! ```text
//! <root>/<domain>/<name>.tar          finalized archive
//! <root>/<domain>/<name>.tar.pfff     checksum sidecar
//! <root>/<domain>/deploy/<name>/      last unpacked copy
//! <root>/<domain>/capture/<name>/     capture staging tree
//! ```

use crate::descriptor::DomainType;
use crate::distribution::checksum::{parse_sidecar, sidecar_for};
use crate::env;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Repository settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    pub root: PathBuf,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(env::DEFAULT_REPOSITORY_ROOT),
        }
    }
}

/// Metadata about a finalized template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateInfo {
    pub name: String,
    pub domain: DomainType,
    pub archive: PathBuf,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
    /// Token from the sidecar, if present
    pub checksum: Option<String>,
}

/// Handle on a local template repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    root: PathBuf,
}

impl Repository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &RepositoryConfig) -> Self {
        Self::new(config.root.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn domain_dir(&self, domain: DomainType) -> PathBuf {
        env::domain_dir_path(&self.root, domain.as_str())
    }

    pub fn archive_path(&self, domain: DomainType, name: &str) -> PathBuf {
        env::archive_path(&self.root, domain.as_str(), name)
    }

    pub fn sidecar_path(&self, domain: DomainType, name: &str) -> PathBuf {
        env::sidecar_path(&self.root, domain.as_str(), name)
    }

    pub fn deploy_staging(&self, domain: DomainType, name: &str) -> PathBuf {
        env::deploy_staging_path(&self.root, domain.as_str(), name)
    }

    pub fn capture_staging(&self, domain: DomainType, name: &str) -> PathBuf {
        env::capture_staging_path(&self.root, domain.as_str(), name)
    }

    /// Whether a finalized archive exists for `name`
    pub async fn exists(&self, domain: DomainType, name: &str) -> io::Result<bool> {
        tokio::fs::try_exists(self.archive_path(domain, name)).await
    }

    /// Sorted names of finalized archives for `domain`
    pub async fn list_local_templates(&self, domain: DomainType) -> io::Result<Vec<String>> {
        let dir = self.domain_dir(domain);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let suffix = format!(".{}", env::template::ARCHIVE_EXT);
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.starts_with('.') {
                continue;
            }
            if let Some(name) = file_name.strip_suffix(&suffix) {
                names.push(name.to_string());
            }
        }
        names.sort();
        debug!("{} template(s) in {}", names.len(), dir.display());
        Ok(names)
    }

    /// Size, modification time and sidecar token of a template
    pub async fn template_info(&self, domain: DomainType, name: &str) -> io::Result<TemplateInfo> {
        let archive = self.archive_path(domain, name);
        let metadata = tokio::fs::metadata(&archive).await?;
        let checksum = match tokio::fs::read_to_string(sidecar_for(&archive)).await {
            Ok(content) => parse_sidecar(&content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };

        Ok(TemplateInfo {
            name: name.to_string(),
            domain,
            size_bytes: metadata.len(),
            modified: DateTime::<Utc>::from(metadata.modified()?),
            archive,
            checksum,
        })
    }

    /// Remove a template's archive, sidecar and deploy staging tree
    pub async fn delete_template(&self, domain: DomainType, name: &str) -> io::Result<()> {
        for file in [self.archive_path(domain, name), self.sidecar_path(domain, name)] {
            match tokio::fs::remove_file(&file).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        let staging = self.deploy_staging(domain, name);
        match tokio::fs::remove_dir_all(&staging).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        info!("Deleted template '{}' ({})", name, domain);
        Ok(())
    }
}
