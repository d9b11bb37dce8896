//! Host capacity detection.
//!
//! The reconciler never queries the host itself; it consumes a
//! [`HostCapacity`] snapshot gathered through a [`ResourceProbe`].
//! [`HostProbe`] reads the real host, [`StaticProbe`] returns fixed values.

use crate::descriptor::InstanceId;
use crate::executor::{CommandExecutor, ExecutionCommand, ExecutorError};
use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const KIB_PER_GIB: f64 = 1024.0 * 1024.0;
const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Errors while probing the host
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Command error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Failed to parse {what}: {detail}")]
    Parse { what: String, detail: String },
}

/// Reports host capacity
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    /// Number of CPUs available to guests
    async fn cpu_count(&self) -> Result<u32, ProbeError>;

    /// Memory available for new guests, in GB
    async fn free_memory_gb(&self) -> Result<f64, ProbeError>;

    /// Free space on the filesystem holding `path`, in GB
    async fn free_disk_gb(&self, path: &Path) -> Result<f64, ProbeError>;

    /// Current disk usage of a container, in GB (0 for non-containers)
    async fn quota_floor_gb(&self, instance: &InstanceId) -> Result<f64, ProbeError>;
}

/// Snapshot of host capacity consumed by the reconciler
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostCapacity {
    pub cpu_count: u32,
    pub free_memory_gb: f64,
    pub free_disk_gb: f64,
    /// Disk size below which the instance may not shrink, in GB
    pub disk_floor_gb: f64,
}

impl HostCapacity {
    /// Capacity that never caps anything
    pub fn unbounded() -> Self {
        Self {
            cpu_count: u32::MAX,
            free_memory_gb: f64::INFINITY,
            free_disk_gb: f64::INFINITY,
            disk_floor_gb: 0.0,
        }
    }

    pub fn with_disk_floor(mut self, floor_gb: f64) -> Self {
        self.disk_floor_gb = floor_gb;
        self
    }

    /// Gather a snapshot from a probe for a target storage path
    pub async fn gather(probe: &dyn ResourceProbe, storage_path: &Path) -> Result<Self, ProbeError> {
        let capacity = Self {
            cpu_count: probe.cpu_count().await?,
            free_memory_gb: probe.free_memory_gb().await?,
            free_disk_gb: probe.free_disk_gb(storage_path).await?,
            disk_floor_gb: 0.0,
        };
        debug!("Host capacity: {:?}", capacity);
        Ok(capacity)
    }
}

/// Probe reading the local host
pub struct HostProbe {
    executor: Arc<dyn CommandExecutor>,
    vzlist: String,
}

impl HostProbe {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            vzlist: "vzlist".to_string(),
        }
    }

    #[cfg(target_os = "linux")]
    fn read_available_memory() -> io::Result<u64> {
        let meminfo = std::fs::read_to_string("/proc/meminfo")?;
        parse_meminfo_available(&meminfo).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "Failed to parse /proc/meminfo")
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn read_available_memory() -> io::Result<u64> {
        tracing::warn!("Memory detection not supported on this platform, using default 8GB");
        Ok(8 * 1024 * 1024 * 1024)
    }
}

/// Available memory in bytes from `/proc/meminfo`, preferring `MemAvailable`
pub fn parse_meminfo_available(meminfo: &str) -> Option<u64> {
    let field = |name: &str| {
        meminfo.lines().find_map(|line| {
            let rest = line.strip_prefix(name)?.strip_prefix(':')?;
            rest.split_whitespace().next()?.parse::<u64>().ok()
        })
    };
    field("MemAvailable")
        .or_else(|| field("MemFree"))
        .map(|kb| kb * 1024)
}

#[async_trait]
impl ResourceProbe for HostProbe {
    async fn cpu_count(&self) -> Result<u32, ProbeError> {
        Ok(std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1))
    }

    async fn free_memory_gb(&self) -> Result<f64, ProbeError> {
        let bytes = tokio::task::spawn_blocking(Self::read_available_memory)
            .await
            .map_err(|e| io::Error::other(e.to_string()))??;
        Ok(bytes as f64 / BYTES_PER_GIB)
    }

    async fn free_disk_gb(&self, path: &Path) -> Result<f64, ProbeError> {
        // The target directory may not exist yet; measure its closest ancestor.
        let existing = path
            .ancestors()
            .find(|p| p.exists())
            .unwrap_or_else(|| Path::new("/"))
            .to_path_buf();
        let bytes = tokio::task::spawn_blocking(move || fs2::available_space(&existing))
            .await
            .map_err(|e| io::Error::other(e.to_string()))??;
        Ok(bytes as f64 / BYTES_PER_GIB)
    }

    async fn quota_floor_gb(&self, instance: &InstanceId) -> Result<f64, ProbeError> {
        let InstanceId::CtId(ctid) = instance else {
            return Ok(0.0);
        };

        let result = self
            .executor
            .run(ExecutionCommand::new(
                &self.vzlist,
                vec![
                    "-H".to_string(),
                    "-o".to_string(),
                    "diskspace".to_string(),
                    ctid.to_string(),
                ],
            ))
            .await?;

        let used_kb: f64 = result.stdout.trim().parse().map_err(|_| ProbeError::Parse {
            what: "vzlist diskspace".to_string(),
            detail: result.stdout.trim().to_string(),
        })?;
        Ok(used_kb / KIB_PER_GIB)
    }
}

/// Probe returning fixed values
#[derive(Debug, Clone)]
pub struct StaticProbe {
    pub cpu_count: u32,
    pub free_memory_gb: f64,
    pub free_disk_gb: f64,
    pub quota_floor_gb: f64,
}

impl StaticProbe {
    pub fn new(cpu_count: u32, free_memory_gb: f64, free_disk_gb: f64) -> Self {
        Self {
            cpu_count,
            free_memory_gb,
            free_disk_gb,
            quota_floor_gb: 0.0,
        }
    }

    pub fn with_quota_floor(mut self, floor_gb: f64) -> Self {
        self.quota_floor_gb = floor_gb;
        self
    }
}

#[async_trait]
impl ResourceProbe for StaticProbe {
    async fn cpu_count(&self) -> Result<u32, ProbeError> {
        Ok(self.cpu_count)
    }

    async fn free_memory_gb(&self) -> Result<f64, ProbeError> {
        Ok(self.free_memory_gb)
    }

    async fn free_disk_gb(&self, _path: &Path) -> Result<f64, ProbeError> {
        Ok(self.free_disk_gb)
    }

    async fn quota_floor_gb(&self, instance: &InstanceId) -> Result<f64, ProbeError> {
        Ok(match instance {
            InstanceId::CtId(_) => self.quota_floor_gb,
            InstanceId::Name(_) => 0.0,
        })
    }
}
