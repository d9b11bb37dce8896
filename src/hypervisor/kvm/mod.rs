//! KVM adapter backed by libvirt (`virsh`), `qemu-img` and LVM tools.
//!
//! Capture reads the domain XML, measures each disk and converts every disk
//! (file, raw block device or logical volume) into a `qcow2` image in the
//! staging directory. Deploy copies the images into the image directory, or
//! writes them back into fresh logical volumes when the template disk came
//! from LVM and a volume group is configured.

pub mod bounds;
pub mod domain_xml;

use self::bounds::BoundsMetadata;
use self::domain_xml::{
    DevicesXml, DiskSourceXml, DiskXml, DomainXml, DriverXml, FeaturesXml, InterfaceSourceXml,
    InterfaceXml, MacXml, MemoryXml, ModelXml, OsTypeXml, OsXml, TargetXml, VcpuXml,
    parse_domain, render_domain,
};
use super::{
    HypervisorAdapter, HypervisorError, NativeConfig, Result, bytes_to_gb, target_instance,
};
use crate::descriptor::{
    DeployType, Descriptor, DiskRecord, DomainSettings, DomainType, InstanceId, Interface,
    KvmSettings,
};
use crate::executor::{CommandExecutor, ExecutionCommand, ExecutorError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const KIB_PER_GIB: f64 = 1024.0 * 1024.0;
const TEMPLATE_IMAGE_FORMAT: &str = "qcow2";

/// KVM adapter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvmConfig {
    /// libvirt connection URI passed as `virsh -c`
    pub connect_uri: Option<String>,
    /// Directory receiving deployed disk images
    pub image_dir: PathBuf,
    /// Directory holding `<instance>.toml` bound metadata
    pub bounds_dir: PathBuf,
    /// Volume group for disks that were logical volumes at capture time
    pub volume_group: Option<String>,
}

impl Default for KvmConfig {
    fn default() -> Self {
        Self {
            connect_uri: None,
            image_dir: PathBuf::from("/var/lib/libvirt/images"),
            bounds_dir: PathBuf::from("/etc/vmtpl/bounds"),
            volume_group: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ImageInfo {
    #[serde(rename = "virtual-size")]
    virtual_size: u64,
}

/// Adapter for libvirt-managed KVM guests
pub struct KvmAdapter {
    executor: Arc<dyn CommandExecutor>,
    config: KvmConfig,
}

impl KvmAdapter {
    pub fn new(executor: Arc<dyn CommandExecutor>, config: KvmConfig) -> Self {
        Self { executor, config }
    }

    pub fn config(&self) -> &KvmConfig {
        &self.config
    }

    fn virsh(&self, args: &[&str]) -> ExecutionCommand {
        let mut argv = Vec::new();
        if let Some(uri) = &self.config.connect_uri {
            argv.push("-c".to_string());
            argv.push(uri.clone());
        }
        argv.extend(args.iter().map(|a| a.to_string()));
        ExecutionCommand::new("virsh", argv)
    }

    fn instance_name<'a>(&self, instance: &'a InstanceId) -> Result<&'a str> {
        match instance {
            InstanceId::Name(name) => Ok(name),
            InstanceId::CtId(id) => Err(HypervisorError::InvalidInstance(id.to_string())),
        }
    }

    async fn dump_domain(&self, name: &str) -> Result<DomainXml> {
        let result = self
            .executor
            .run(self.virsh(&["dumpxml", name]))
            .await
            .map_err(|e| match e {
                ExecutorError::NonZeroExit { .. } => {
                    HypervisorError::InstanceNotFound(name.to_string())
                }
                other => other.into(),
            })?;
        parse_domain(&result.stdout)
    }

    async fn block_deploy_type(&self, device: &str) -> Result<DeployType> {
        let lvs = ExecutionCommand::from_parts("lvs", &["--noheadings", "-o", "lv_name", device]);
        let result = self.executor.execute(lvs).await?;
        Ok(if result.success() {
            DeployType::LvmBlock
        } else {
            DeployType::PhysicalBlock
        })
    }

    async fn disk_capacity_gb(&self, deploy_type: DeployType, source: &str) -> Result<f64> {
        let bytes = if deploy_type.is_block() {
            let result = self
                .executor
                .run(ExecutionCommand::from_parts(
                    "blockdev",
                    &["--getsize64", source],
                ))
                .await?;
            result
                .stdout
                .trim()
                .parse::<u64>()
                .map_err(|e| HypervisorError::Parse {
                    what: format!("size of {}", source),
                    detail: e.to_string(),
                })?
        } else {
            let result = self
                .executor
                .run(ExecutionCommand::from_parts(
                    "qemu-img",
                    &["info", "--output=json", source],
                ))
                .await?;
            let info: ImageInfo =
                serde_json::from_str(&result.stdout).map_err(|e| HypervisorError::Parse {
                    what: format!("qemu-img info for {}", source),
                    detail: e.to_string(),
                })?;
            info.virtual_size
        };
        Ok(bytes_to_gb(bytes))
    }

    async fn convert(&self, source: &str, format: &str, dest: &str) -> Result<()> {
        info!("Converting {} to {} ({})", source, dest, format);
        self.executor
            .run(ExecutionCommand::from_parts(
                "qemu-img",
                &["convert", "-O", format, source, dest],
            ))
            .await?;
        Ok(())
    }

    fn lvm_device(&self, volume_group: &str, lv_name: &str) -> String {
        format!("/dev/{}/{}", volume_group, lv_name)
    }

    /// Whether `source` was placed by this adapter on deploy
    fn placed_by_deploy(&self, disk: &DiskRecord) -> bool {
        let source = Path::new(&disk.source);
        if source.starts_with(&self.config.image_dir) {
            return true;
        }
        match &self.config.volume_group {
            Some(vg) => disk.deploy_type == DeployType::LvmBlock
                && source.starts_with(Path::new("/dev").join(vg)),
            None => false,
        }
    }
}

#[async_trait]
impl HypervisorAdapter for KvmAdapter {
    fn domain_type(&self) -> DomainType {
        DomainType::Kvm
    }

    fn storage_path(&self) -> &Path {
        &self.config.image_dir
    }

    fn parse_instance(&self, raw: &str) -> Result<InstanceId> {
        let name = raw.trim();
        if name.is_empty() || name.contains('/') || name.chars().any(char::is_whitespace) {
            return Err(HypervisorError::InvalidInstance(raw.to_string()));
        }
        Ok(InstanceId::Name(name.to_string()))
    }

    async fn list_instances(&self) -> Result<Vec<InstanceId>> {
        let result = self
            .executor
            .run(self.virsh(&["list", "--all", "--name"]))
            .await?;
        Ok(result
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| InstanceId::Name(line.to_string()))
            .collect())
    }

    async fn allocate_instance(&self, requested: Option<&str>) -> Result<InstanceId> {
        match requested {
            Some(raw) => self.parse_instance(raw),
            None => Err(HypervisorError::InvalidInstance(
                "KVM deployments need an explicit instance name".to_string(),
            )),
        }
    }

    async fn capture_config(
        &self,
        instance: &InstanceId,
        template_name: &str,
    ) -> Result<Descriptor> {
        let name = self.instance_name(instance)?;
        let domain = self.dump_domain(name).await?;

        let mut disks = Vec::new();
        for disk in domain.devices.disk.iter().filter(|d| d.device == "disk") {
            let Some(source) = disk.source_path() else {
                warn!("Skipping disk {} of {} without a source", disk.target.dev, name);
                continue;
            };
            let deploy_type = if disk.kind == "block" {
                self.block_deploy_type(source).await?
            } else {
                DeployType::File
            };
            let capacity_gb = self.disk_capacity_gb(deploy_type, source).await?;
            debug!(
                "Disk {} of {}: {} ({}, {:.2} GB)",
                disk.target.dev,
                name,
                source,
                deploy_type.as_str(),
                capacity_gb
            );
            disks.push(DiskRecord {
                deploy_type,
                source: source.to_string(),
                target: disk.target.dev.clone(),
                capacity_gb,
                format: disk.driver.as_ref().and_then(|d| d.format.clone()),
            });
        }

        let interfaces = domain
            .devices
            .interface
            .iter()
            .map(|iface| Interface {
                bridge: iface
                    .source
                    .as_ref()
                    .and_then(|s| s.bridge.clone())
                    .unwrap_or_default(),
                mac: iface.mac.as_ref().map(|m| m.address.clone()),
                nic_type: iface
                    .model
                    .as_ref()
                    .map(|m| m.kind.clone())
                    .unwrap_or_else(|| "virtio".to_string()),
            })
            .collect();

        let memory_gb = domain.memory.to_kib()? as f64 / KIB_PER_GIB;
        let disk_gb: f64 = disks.iter().map(|d| d.capacity_gb).sum();
        let metadata = BoundsMetadata::load(&self.config.bounds_dir, name).await?;

        let mut descriptor = Descriptor::new_kvm(template_name);
        descriptor.instance = Some(instance.clone());
        descriptor.bounds = metadata.resolve(memory_gb, domain.vcpu.count, disk_gb);
        descriptor.disks = disks;
        descriptor.interfaces = interfaces;
        descriptor.features = domain
            .features
            .as_ref()
            .map(|f| f.names().into_iter().map(String::from).collect())
            .unwrap_or_default();
        descriptor.settings = DomainSettings::Kvm(KvmSettings {
            arch: domain
                .os
                .os_type
                .arch
                .clone()
                .unwrap_or_else(|| KvmSettings::default().arch),
            machine: domain.os.os_type.machine.clone(),
        });

        info!(
            "Captured configuration of '{}': {:.2} GB memory, {} vcpu, {} disk(s)",
            name,
            memory_gb,
            domain.vcpu.count,
            descriptor.disks.len()
        );
        Ok(descriptor)
    }

    async fn prepare_filesystem_for_capture(
        &self,
        descriptor: &mut Descriptor,
        staging_dir: &Path,
    ) -> Result<Vec<String>> {
        tokio::fs::create_dir_all(staging_dir).await?;
        let template_name = descriptor.template_name.clone();

        let mut payload = Vec::with_capacity(descriptor.disks.len());
        for disk in &mut descriptor.disks {
            let relative = format!(
                "{}-{}.{}",
                template_name, disk.target, TEMPLATE_IMAGE_FORMAT
            );
            let dest = staging_dir.join(&relative);

            let already_qcow2 = disk.format.as_deref() == Some(TEMPLATE_IMAGE_FORMAT);
            if disk.deploy_type == DeployType::File && already_qcow2 {
                info!("Copying {} to {}", disk.source, dest.display());
                tokio::fs::copy(&disk.source, &dest).await?;
            } else {
                self.convert(&disk.source, TEMPLATE_IMAGE_FORMAT, &dest.to_string_lossy())
                    .await?;
            }

            disk.source = relative.clone();
            disk.format = Some(TEMPLATE_IMAGE_FORMAT.to_string());
            payload.push(relative);
        }
        Ok(payload)
    }

    async fn prepare_filesystem_for_deploy(
        &self,
        descriptor: &mut Descriptor,
        staging_dir: &Path,
    ) -> Result<()> {
        let name = self.instance_name(target_instance(descriptor)?)?.to_string();

        for disk in &mut descriptor.disks {
            let payload = staging_dir.join(&disk.source);
            if !tokio::fs::try_exists(&payload).await? {
                return Err(HypervisorError::IoError(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("payload {} missing", payload.display()),
                )));
            }
            let payload = payload.to_string_lossy().into_owned();
            let lv_name = format!("{}-{}", name, disk.target);

            match (&self.config.volume_group, disk.deploy_type) {
                (Some(vg), DeployType::LvmBlock) => {
                    let device = self.lvm_device(vg, &lv_name);
                    if tokio::fs::try_exists(&device).await? {
                        return Err(HypervisorError::PathExists(device));
                    }
                    let size = format!("{}G", disk.capacity_gb.ceil().max(1.0) as u64);
                    self.executor
                        .run(ExecutionCommand::from_parts(
                            "lvcreate",
                            &["-y", "-L", &size, "-n", &lv_name, vg],
                        ))
                        .await?;
                    // the volume exists from here on; record it for cleanup
                    disk.source = device.clone();
                    self.convert(&payload, "raw", &device).await?;
                    disk.format = Some("raw".to_string());
                }
                _ => {
                    let format = disk
                        .format
                        .clone()
                        .unwrap_or_else(|| TEMPLATE_IMAGE_FORMAT.to_string());
                    let dest = self
                        .config
                        .image_dir
                        .join(format!("{}.{}", lv_name, format));
                    if tokio::fs::try_exists(&dest).await? {
                        return Err(HypervisorError::PathExists(dest.display().to_string()));
                    }
                    tokio::fs::create_dir_all(&self.config.image_dir).await?;
                    // recorded before the copy so a partial image is cleaned up
                    disk.source = dest.to_string_lossy().into_owned();
                    disk.deploy_type = DeployType::File;
                    disk.format = Some(format);
                    info!("Placing {} at {}", payload, dest.display());
                    tokio::fs::copy(&payload, &dest).await?;
                }
            }
        }
        Ok(())
    }

    fn generate_config(&self, descriptor: &Descriptor) -> Result<NativeConfig> {
        let name = self.instance_name(target_instance(descriptor)?)?;
        let settings = descriptor.kvm().cloned().unwrap_or_default();
        let memory_kib = (descriptor.bounds.memory.normal * KIB_PER_GIB).round() as u64;

        let disks = descriptor
            .disks
            .iter()
            .map(|disk| {
                let block = disk.deploy_type.is_block();
                DiskXml {
                    kind: if block { "block" } else { "file" }.to_string(),
                    device: "disk".to_string(),
                    driver: Some(DriverXml {
                        name: "qemu".to_string(),
                        format: disk.format.clone(),
                    }),
                    source: Some(DiskSourceXml {
                        file: (!block).then(|| disk.source.clone()),
                        dev: block.then(|| disk.source.clone()),
                    }),
                    target: TargetXml {
                        dev: disk.target.clone(),
                        bus: Some("virtio".to_string()),
                    },
                }
            })
            .collect();

        let interfaces = descriptor
            .interfaces
            .iter()
            .map(|iface| InterfaceXml {
                kind: "bridge".to_string(),
                mac: iface.mac.clone().map(|address| MacXml { address }),
                source: Some(InterfaceSourceXml {
                    bridge: Some(iface.bridge.clone()),
                }),
                model: Some(ModelXml {
                    kind: iface.nic_type.clone(),
                }),
            })
            .collect();

        let domain = DomainXml {
            kind: "kvm".to_string(),
            name: name.to_string(),
            uuid: Some(uuid::Uuid::new_v4().to_string()),
            memory: MemoryXml::kib(memory_kib),
            current_memory: Some(MemoryXml::kib(memory_kib)),
            vcpu: VcpuXml {
                placement: Some("static".to_string()),
                count: descriptor.bounds.vcpu.normal,
            },
            os: OsXml {
                os_type: OsTypeXml {
                    arch: Some(settings.arch),
                    machine: settings.machine,
                    kind: "hvm".to_string(),
                },
            },
            features: Some(FeaturesXml::from_names(
                descriptor.features.iter().map(String::as_str),
            )),
            devices: DevicesXml {
                disk: disks,
                interface: interfaces,
            },
        };

        for feature in &descriptor.features {
            if !domain_xml::KNOWN_FEATURES.contains(&feature.as_str()) {
                warn!("Feature '{}' has no libvirt mapping, dropping it", feature);
            }
        }

        Ok(NativeConfig::DomainXml(render_domain(&domain)?))
    }

    async fn define(&self, descriptor: &Descriptor, config: &NativeConfig) -> Result<()> {
        let NativeConfig::DomainXml(xml) = config else {
            return Err(HypervisorError::NativeConfig(
                "KVM instances are defined from domain XML".to_string(),
            ));
        };
        let name = self.instance_name(target_instance(descriptor)?)?;

        let file = tempfile::Builder::new()
            .prefix(&format!("{}-", name))
            .suffix(".xml")
            .tempfile()?;
        tokio::fs::write(file.path(), xml).await?;

        self.executor
            .run(self.virsh(&["define", &file.path().to_string_lossy()]))
            .await?;
        info!("Defined KVM domain '{}'", name);
        Ok(())
    }

    async fn start(&self, descriptor: &Descriptor) -> Result<()> {
        let name = self.instance_name(target_instance(descriptor)?)?;
        self.executor.run(self.virsh(&["start", name])).await?;
        info!("Started KVM domain '{}'", name);
        Ok(())
    }

    async fn destroy(&self, descriptor: &Descriptor) -> Result<()> {
        let name = self.instance_name(target_instance(descriptor)?)?;
        // not running is fine
        let stopped = self.executor.execute(self.virsh(&["destroy", name])).await?;
        if !stopped.success() {
            debug!("virsh destroy {}: {}", name, stopped.stderr.trim());
        }
        self.executor.run(self.virsh(&["undefine", name])).await?;
        info!("Removed KVM domain '{}'", name);
        Ok(())
    }

    async fn cleanup(&self, descriptor: &Descriptor) {
        if let Some(instance) = &descriptor.instance {
            match self.instance_exists(instance).await {
                Ok(true) => {
                    if let Err(e) = self.destroy(descriptor).await {
                        warn!("Cleanup: failed to remove domain {}: {}", instance, e);
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("Cleanup: failed to list domains: {}", e),
            }
        }

        for disk in descriptor.disks.iter().filter(|d| self.placed_by_deploy(d)) {
            let result = if disk.deploy_type == DeployType::LvmBlock {
                self.executor
                    .run(ExecutionCommand::from_parts(
                        "lvremove",
                        &["-f", &disk.source],
                    ))
                    .await
                    .map(|_| ())
                    .map_err(HypervisorError::from)
            } else {
                tokio::fs::remove_file(&disk.source)
                    .await
                    .map_err(HypervisorError::from)
            };
            match result {
                Ok(()) => debug!("Cleanup: removed {}", disk.source),
                Err(e) => warn!("Cleanup: failed to remove {}: {}", disk.source, e),
            }
        }
    }
}
