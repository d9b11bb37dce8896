//! OpenVZ adapter backed by `vzctl`, `vzlist` and the container conf files.
//!
//! A container template is one gzip-compressed tar of the container's
//! private area. Resource values live in UBC keys of the conf file:
//!
//! | Key         | Format              | Descriptor value                  |
//! |-------------|---------------------|-----------------------------------|
//! | `PHYSPAGES` | `0:<pages>`         | memory normal (4 KiB pages)       |
//! | `KMEMSIZE`  | `<barrier>:<limit>` | memory min/max via the reference  |
//! | `DISKSPACE` | `<soft>:<hard>` KiB | disk normal/max                   |
//! | `CPUS`      | count               | vcpu                              |
//! | `CPULIMIT`  | percent of one CPU  | vcpu limit × CPUS                 |
//!
//! Generated configuration is a set of updates merged into the conf file
//! that `vzctl create` writes, so host-specific keys survive.

pub mod conf;

pub use conf::VeConf;

use self::conf::parse_pair;
use super::{HypervisorAdapter, HypervisorError, NativeConfig, Result, target_instance};
use crate::descriptor::{BoundTriple, Descriptor, DomainType, InstanceId, Interface};
use crate::executor::{CommandExecutor, ExecutionCommand};
use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lowest container ID handed out automatically
pub const MIN_CTID: u32 = 100;

const PAGES_PER_GIB: f64 = 262_144.0;
const KIB_PER_GIB: f64 = 1024.0 * 1024.0;
const LIMIT_HEADROOM: f64 = 1.1;
const FILESYSTEM_ARCHIVE_SUFFIX: &str = ".tar.gz";

/// OpenVZ adapter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenvzConfig {
    /// Directory of `<ctid>.conf` files
    pub conf_dir: PathBuf,
    /// Directory of container private areas
    pub private_dir: PathBuf,
    /// Template cache searched by `vzctl create --ostemplate`
    pub template_cache: PathBuf,
    /// `KMEMSIZE` barrier in bytes per GB of memory
    pub kmem_reference_bytes_per_gb: u64,
}

impl Default for OpenvzConfig {
    fn default() -> Self {
        Self {
            conf_dir: PathBuf::from("/etc/vz/conf"),
            private_dir: PathBuf::from("/vz/private"),
            template_cache: PathBuf::from("/vz/template/cache"),
            kmem_reference_bytes_per_gb: 64 * 1024 * 1024,
        }
    }
}

/// Next free container ID: one above the highest in use, never below 100
pub fn next_ctid(existing: &[u32]) -> u32 {
    existing
        .iter()
        .max()
        .map(|max| max.saturating_add(1))
        .unwrap_or(MIN_CTID)
        .max(MIN_CTID)
}

/// Adapter for OpenVZ containers
pub struct OpenvzAdapter {
    executor: Arc<dyn CommandExecutor>,
    config: OpenvzConfig,
}

impl OpenvzAdapter {
    pub fn new(executor: Arc<dyn CommandExecutor>, config: OpenvzConfig) -> Self {
        Self { executor, config }
    }

    pub fn config(&self) -> &OpenvzConfig {
        &self.config
    }

    fn ctid(&self, instance: &InstanceId) -> Result<u32> {
        match instance {
            InstanceId::CtId(id) => Ok(*id),
            InstanceId::Name(name) => Err(HypervisorError::InvalidInstance(name.clone())),
        }
    }

    fn conf_path(&self, ctid: u32) -> PathBuf {
        self.config.conf_dir.join(format!("{}.conf", ctid))
    }

    async fn read_conf(&self, ctid: u32) -> Result<Option<VeConf>> {
        match tokio::fs::read_to_string(self.conf_path(ctid)).await {
            Ok(text) => Ok(Some(VeConf::parse(&text))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn vzctl(&self, args: &[&str]) -> ExecutionCommand {
        ExecutionCommand::from_parts("vzctl", args)
    }

    fn kmem_reference(&self) -> f64 {
        self.config.kmem_reference_bytes_per_gb.max(1) as f64
    }

    /// Template cache entry name used for one deployment
    fn ostemplate_name(template_name: &str, ctid: u32) -> String {
        format!("{}-{}", template_name, ctid)
    }

    fn descriptor_from_conf(
        &self,
        conf: &VeConf,
        ctid: u32,
        template_name: &str,
    ) -> Result<Descriptor> {
        let pair = |key: &str| -> Result<Option<(u64, u64)>> {
            conf.get(key)
                .map(|raw| {
                    parse_pair(raw).ok_or_else(|| HypervisorError::Parse {
                        what: key.to_string(),
                        detail: raw.to_string(),
                    })
                })
                .transpose()
        };
        let missing = |key: &str| HypervisorError::Parse {
            what: format!("{}.conf", ctid),
            detail: format!("{} is not set", key),
        };
        let unlimited = |key: &str| HypervisorError::Parse {
            what: key.to_string(),
            detail: "unlimited values cannot be templated".to_string(),
        };

        let (_, pages) = pair("PHYSPAGES")?.ok_or_else(|| missing("PHYSPAGES"))?;
        if pages == u64::MAX {
            return Err(unlimited("PHYSPAGES"));
        }
        let memory_gb = pages as f64 / PAGES_PER_GIB;
        let memory = match pair("KMEMSIZE")? {
            Some((barrier, limit)) if limit != u64::MAX => BoundTriple::new(
                memory_gb.min(barrier as f64 / self.kmem_reference()),
                memory_gb,
                memory_gb.max(limit as f64 / self.kmem_reference()),
            ),
            _ => BoundTriple::fixed(memory_gb),
        };

        let (soft, hard) = pair("DISKSPACE")?.ok_or_else(|| missing("DISKSPACE"))?;
        if soft == u64::MAX {
            return Err(unlimited("DISKSPACE"));
        }
        let disk_gb = soft as f64 / KIB_PER_GIB;
        let disk_max = if hard == u64::MAX {
            disk_gb
        } else {
            disk_gb.max(hard as f64 / KIB_PER_GIB)
        };

        let cpus = match conf.get("CPUS") {
            Some(raw) => raw.trim().parse::<u32>().map_err(|e| HypervisorError::Parse {
                what: "CPUS".to_string(),
                detail: e.to_string(),
            })?,
            None => 1,
        }
        .max(1);
        let cpu_limit = match conf.get("CPULIMIT") {
            Some(raw) => raw.trim().parse::<u32>().map_err(|e| HypervisorError::Parse {
                what: "CPULIMIT".to_string(),
                detail: e.to_string(),
            })?,
            None => 0,
        };
        // 0 means unlimited
        let vcpu_limit = if cpu_limit == 0 {
            100
        } else {
            (cpu_limit / cpus).min(100)
        };

        let mut descriptor = Descriptor::new_openvz(template_name);
        descriptor.instance = Some(InstanceId::CtId(ctid));
        descriptor.bounds.memory = memory;
        descriptor.bounds.vcpu = BoundTriple::fixed(cpus);
        descriptor.bounds.disk = BoundTriple::new(disk_gb, disk_gb, disk_max);
        descriptor.interfaces = vec![Interface {
            bridge: String::new(),
            mac: None,
            nic_type: "venet".to_string(),
        }];
        if let Some(settings) = descriptor.openvz_mut() {
            settings.vcpu_limit = BoundTriple::fixed(vcpu_limit);
            settings.hostname = conf.get("HOSTNAME").map(String::from);
            settings.ip_address = conf
                .get("IP_ADDRESS")
                .and_then(|ips| ips.split_whitespace().next())
                .map(String::from);
            settings.nameserver = conf.get("NAMESERVER").map(String::from);
        }
        Ok(descriptor)
    }
}

/// Write a gzip-compressed tar of `source_dir` to `archive`
fn archive_private_area(source_dir: &Path, archive: &Path) -> std::io::Result<()> {
    let file = std::fs::File::create(archive)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", source_dir)?;
    let encoder = builder.into_inner()?;
    encoder.finish()?.sync_all()
}

#[async_trait]
impl HypervisorAdapter for OpenvzAdapter {
    fn domain_type(&self) -> DomainType {
        DomainType::Openvz
    }

    fn storage_path(&self) -> &Path {
        &self.config.private_dir
    }

    fn parse_instance(&self, raw: &str) -> Result<InstanceId> {
        match raw.trim().parse::<u32>() {
            Ok(id) if id >= MIN_CTID => Ok(InstanceId::CtId(id)),
            _ => Err(HypervisorError::InvalidInstance(raw.to_string())),
        }
    }

    async fn list_instances(&self) -> Result<Vec<InstanceId>> {
        let result = self
            .executor
            .run(ExecutionCommand::from_parts("vzlist", &["-H", "-a", "-o", "ctid"]))
            .await?;
        result
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                line.parse::<u32>()
                    .map(InstanceId::CtId)
                    .map_err(|e| HypervisorError::Parse {
                        what: "vzlist output".to_string(),
                        detail: format!("{}: {}", line, e),
                    })
            })
            .collect()
    }

    async fn allocate_instance(&self, requested: Option<&str>) -> Result<InstanceId> {
        if let Some(raw) = requested {
            return self.parse_instance(raw);
        }
        let existing: Vec<u32> = self
            .list_instances()
            .await?
            .iter()
            .filter_map(|id| match id {
                InstanceId::CtId(ctid) => Some(*ctid),
                InstanceId::Name(_) => None,
            })
            .collect();
        let ctid = next_ctid(&existing);
        info!("Allocated container ID {}", ctid);
        Ok(InstanceId::CtId(ctid))
    }

    async fn capture_config(
        &self,
        instance: &InstanceId,
        template_name: &str,
    ) -> Result<Descriptor> {
        let ctid = self.ctid(instance)?;
        let conf = self
            .read_conf(ctid)
            .await?
            .ok_or_else(|| HypervisorError::InstanceNotFound(ctid.to_string()))?;
        let descriptor = self.descriptor_from_conf(&conf, ctid, template_name)?;
        info!(
            "Captured configuration of CT {}: {:.2} GB memory, {} cpu(s), {:.2} GB disk",
            ctid,
            descriptor.bounds.memory.normal,
            descriptor.bounds.vcpu.normal,
            descriptor.bounds.disk.normal
        );
        Ok(descriptor)
    }

    async fn prepare_filesystem_for_capture(
        &self,
        descriptor: &mut Descriptor,
        staging_dir: &Path,
    ) -> Result<Vec<String>> {
        let ctid = self.ctid(target_instance(descriptor)?)?;
        let private = self.config.private_dir.join(ctid.to_string());
        if !tokio::fs::try_exists(&private).await? {
            return Err(HypervisorError::InstanceNotFound(format!(
                "{} (no private area at {})",
                ctid,
                private.display()
            )));
        }

        tokio::fs::create_dir_all(staging_dir).await?;
        let relative = format!("{}{}", descriptor.template_name, FILESYSTEM_ARCHIVE_SUFFIX);
        let archive = staging_dir.join(&relative);
        info!("Archiving {} into {}", private.display(), archive.display());
        tokio::task::spawn_blocking(move || archive_private_area(&private, &archive))
            .await
            .map_err(|e| HypervisorError::Task(e.to_string()))??;

        if let Some(settings) = descriptor.openvz_mut() {
            settings.filesystem_archive = Some(relative.clone());
        }
        Ok(vec![relative])
    }

    async fn prepare_filesystem_for_deploy(
        &self,
        descriptor: &mut Descriptor,
        staging_dir: &Path,
    ) -> Result<()> {
        let ctid = self.ctid(target_instance(descriptor)?)?;
        let template_name = descriptor.template_name.clone();
        let settings = descriptor.openvz_mut().ok_or_else(|| {
            HypervisorError::NativeConfig("descriptor is not an OpenVZ template".to_string())
        })?;
        let relative = settings.filesystem_archive.clone().ok_or_else(|| {
            HypervisorError::NativeConfig("template has no filesystem archive".to_string())
        })?;

        let archive = staging_dir.join(&relative);
        if !tokio::fs::try_exists(&archive).await? {
            return Err(HypervisorError::IoError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("payload {} missing", archive.display()),
            )));
        }

        tokio::fs::create_dir_all(&self.config.template_cache).await?;
        let link = self.config.template_cache.join(format!(
            "{}{}",
            Self::ostemplate_name(&template_name, ctid),
            FILESYSTEM_ARCHIVE_SUFFIX
        ));
        match tokio::fs::symlink_metadata(&link).await {
            Ok(meta) if meta.file_type().is_symlink() => {
                debug!("Replacing stale template link {}", link.display());
                tokio::fs::remove_file(&link).await?;
            }
            Ok(_) => return Err(HypervisorError::PathExists(link.display().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        tokio::fs::symlink(&archive, &link).await?;
        info!("Linked {} into template cache as {}", archive.display(), link.display());
        settings.filesystem_archive = Some(link.to_string_lossy().into_owned());
        Ok(())
    }

    fn generate_config(&self, descriptor: &Descriptor) -> Result<NativeConfig> {
        let settings = descriptor.openvz().ok_or_else(|| {
            HypervisorError::NativeConfig("descriptor is not an OpenVZ template".to_string())
        })?;
        let bounds = &descriptor.bounds;

        let pages = (bounds.memory.normal * PAGES_PER_GIB).round() as u64;
        let kmem_barrier = (bounds.memory.normal * self.kmem_reference()).round() as u64;
        let kmem_limit = (kmem_barrier as f64 * LIMIT_HEADROOM).round() as u64;
        let disk_soft = (bounds.disk.normal * KIB_PER_GIB).round() as u64;
        let disk_hard = (disk_soft as f64 * LIMIT_HEADROOM).round() as u64;
        let cpus = bounds.vcpu.normal.max(1);

        let mut conf = VeConf::new();
        conf.set("PHYSPAGES", format!("0:{}", pages));
        conf.set("KMEMSIZE", format!("{}:{}", kmem_barrier, kmem_limit));
        conf.set("DISKSPACE", format!("{}:{}", disk_soft, disk_hard));
        conf.set("CPUS", cpus.to_string());
        conf.set(
            "CPULIMIT",
            (settings.vcpu_limit.normal.min(100) * cpus).to_string(),
        );
        if let Some(hostname) = &settings.hostname {
            conf.set("HOSTNAME", hostname.clone());
        }
        if let Some(ip) = &settings.ip_address {
            conf.set("IP_ADDRESS", ip.clone());
        }
        if let Some(nameserver) = &settings.nameserver {
            conf.set("NAMESERVER", nameserver.clone());
        }
        Ok(NativeConfig::VeConf(conf))
    }

    async fn define(&self, descriptor: &Descriptor, config: &NativeConfig) -> Result<()> {
        let NativeConfig::VeConf(updates) = config else {
            return Err(HypervisorError::NativeConfig(
                "containers are defined from conf updates".to_string(),
            ));
        };
        let ctid = self.ctid(target_instance(descriptor)?)?;
        let ostemplate = Self::ostemplate_name(&descriptor.template_name, ctid);

        self.executor
            .run(self.vzctl(&[
                "create",
                &ctid.to_string(),
                "--ostemplate",
                &ostemplate,
            ]))
            .await?;

        let mut conf = self.read_conf(ctid).await?.unwrap_or_default();
        conf.merge(updates);
        conf.set_default("SWAPPAGES", "0:0");
        tokio::fs::create_dir_all(&self.config.conf_dir).await?;
        tokio::fs::write(self.conf_path(ctid), conf.render()).await?;

        info!("Defined container {} from '{}'", ctid, ostemplate);
        Ok(())
    }

    async fn start(&self, descriptor: &Descriptor) -> Result<()> {
        let ctid = self.ctid(target_instance(descriptor)?)?;
        self.executor
            .run(self.vzctl(&["start", &ctid.to_string()]))
            .await?;
        info!("Started container {}", ctid);
        Ok(())
    }

    async fn destroy(&self, descriptor: &Descriptor) -> Result<()> {
        let ctid = self.ctid(target_instance(descriptor)?)?.to_string();
        let stopped = self.executor.execute(self.vzctl(&["stop", &ctid])).await?;
        if !stopped.success() {
            debug!("vzctl stop {}: {}", ctid, stopped.stderr.trim());
        }
        self.executor.run(self.vzctl(&["destroy", &ctid])).await?;
        info!("Destroyed container {}", ctid);
        Ok(())
    }

    async fn cleanup(&self, descriptor: &Descriptor) {
        if let Some(instance) = &descriptor.instance {
            match self.instance_exists(instance).await {
                Ok(true) => {
                    if let Err(e) = self.destroy(descriptor).await {
                        warn!("Cleanup: failed to destroy container {}: {}", instance, e);
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("Cleanup: failed to list containers: {}", e),
            }
        }

        let link = descriptor
            .openvz()
            .and_then(|s| s.filesystem_archive.as_deref())
            .map(PathBuf::from)
            .filter(|path| path.starts_with(&self.config.template_cache));
        if let Some(link) = link {
            match tokio::fs::remove_file(&link).await {
                Ok(()) => debug!("Cleanup: removed {}", link.display()),
                Err(e) => warn!("Cleanup: failed to remove {}: {}", link.display(), e),
            }
        }
    }
}

#[cfg(test)]
mod tests;
