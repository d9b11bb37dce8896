//! Out-of-band bound metadata for KVM instances.
//!
//! libvirt has no notion of minimum or maximum resources, so declared bounds
//! live next to the instance in `<bounds_dir>/<instance>.toml`:
//!
//! ```toml
//! [memory]
//! min = 1.0
//! max = 8.0
//!
//! [vcpu]
//! max = 4
//! ```
//!
//! Missing keys fall back to the live `normal` value.

use crate::descriptor::{BoundTriple, ResourceBounds};
use crate::hypervisor::{HypervisorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Range<T> {
    pub min: Option<T>,
    pub max: Option<T>,
}

impl<T: Copy + PartialOrd> Range<T> {
    fn apply(&self, normal: T) -> BoundTriple<T> {
        BoundTriple::new(
            self.min.unwrap_or(normal),
            normal,
            self.max.unwrap_or(normal),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundsMetadata {
    #[serde(default)]
    pub memory: Range<f64>,
    #[serde(default)]
    pub vcpu: Range<u32>,
    #[serde(default)]
    pub disk: Range<f64>,
}

impl BoundsMetadata {
    /// Load `<bounds_dir>/<instance>.toml`; a missing file means no bounds
    pub async fn load(bounds_dir: &Path, instance: &str) -> Result<Self> {
        let path = bounds_dir.join(format!("{}.toml", instance));
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No bound metadata at {}", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&content).map_err(|e| HypervisorError::Parse {
            what: path.display().to_string(),
            detail: e.to_string(),
        })
    }

    /// Bounds around live values
    pub fn resolve(&self, memory_gb: f64, vcpu: u32, disk_gb: f64) -> ResourceBounds {
        ResourceBounds {
            memory: self.memory.apply(memory_gb),
            vcpu: self.vcpu.apply(vcpu),
            disk: self.disk.apply(disk_gb),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_pins_bounds_to_normal() {
        let dir = TempDir::new().unwrap();
        let metadata = BoundsMetadata::load(dir.path(), "web").await.unwrap();
        let bounds = metadata.resolve(2.0, 2, 10.0);
        assert_eq!(bounds.memory, BoundTriple::fixed(2.0));
        assert_eq!(bounds.vcpu, BoundTriple::fixed(2));
    }

    #[tokio::test]
    async fn test_partial_metadata() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(
            dir.path().join("web.toml"),
            "[memory]\nmin = 1.0\nmax = 8.0\n\n[vcpu]\nmax = 4\n",
        )
        .await
        .unwrap();

        let bounds = BoundsMetadata::load(dir.path(), "web")
            .await
            .unwrap()
            .resolve(2.0, 2, 10.0);
        assert_eq!(bounds.memory, BoundTriple::new(1.0, 2.0, 8.0));
        assert_eq!(bounds.vcpu, BoundTriple::new(2, 2, 4));
        assert_eq!(bounds.disk, BoundTriple::fixed(10.0));
    }

    #[tokio::test]
    async fn test_malformed_metadata_is_an_error() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("web.toml"), "[memory\n").await.unwrap();
        assert!(matches!(
            BoundsMetadata::load(dir.path(), "web").await,
            Err(HypervisorError::Parse { .. })
        ));
    }
}
