//! `.ovf` descriptor codec.
//!
//! The descriptor file is a small XML envelope: a `References` list of
//! payload files, a `DiskSection`, a `NetworkSection` and one
//! `VirtualSystem` carrying the resource section (min/normal/max per
//! dimension), feature flags and domain-specific settings.
//!
//! ```xml
//! <Envelope version="1.0">
//!   <References><File id="vda" href="web-vda.qcow2" size="10"/></References>
//!   <DiskSection><Disk diskId="vda" fileRef="vda" capacity="10" deployType="file" format="qcow2"/></DiskSection>
//!   <NetworkSection><Network name="br0" mac="52:54:00:12:34:56" nicType="virtio"/></NetworkSection>
//!   <VirtualSystem id="web" domainType="kvm">
//!     <ResourceSection>
//!       <Memory min="0.5" normal="1" max="2" unit="GB"/>
//!       <Vcpu min="1" normal="1" max="4" unit="count"/>
//!       <Disk min="5" normal="10" max="50" unit="GB"/>
//!     </ResourceSection>
//!     <Features><Feature name="acpi"/></Features>
//!     <Kvm arch="x86_64"/>
//!   </VirtualSystem>
//! </Envelope>
//! ```

use super::types::*;
use super::{DescriptorError, Result};
use crate::archive;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

const OVF_VERSION: &str = "1.0";
const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "Envelope")]
struct Envelope {
    #[serde(rename = "@version")]
    version: String,
    #[serde(rename = "References", default)]
    references: References,
    #[serde(rename = "DiskSection", default)]
    disk_section: DiskSection,
    #[serde(rename = "NetworkSection", default)]
    network_section: NetworkSection,
    #[serde(rename = "VirtualSystem")]
    system: VirtualSystem,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct References {
    #[serde(rename = "File", default)]
    files: Vec<FileRef>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileRef {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "@href")]
    href: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DiskSection {
    #[serde(rename = "Disk", default)]
    disks: Vec<OvfDisk>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OvfDisk {
    #[serde(rename = "@diskId")]
    disk_id: String,
    #[serde(rename = "@fileRef")]
    file_ref: String,
    #[serde(rename = "@capacity")]
    capacity: f64,
    #[serde(rename = "@deployType")]
    deploy_type: String,
    #[serde(rename = "@format", default, skip_serializing_if = "Option::is_none")]
    format: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NetworkSection {
    #[serde(rename = "Network", default)]
    networks: Vec<OvfNetwork>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OvfNetwork {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@mac", default, skip_serializing_if = "Option::is_none")]
    mac: Option<String>,
    #[serde(rename = "@nicType")]
    nic_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct VirtualSystem {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "@domainType")]
    domain_type: String,
    #[serde(rename = "ResourceSection")]
    resources: ResourceSection,
    #[serde(rename = "Features", default)]
    features: OvfFeatures,
    #[serde(rename = "Kvm", default, skip_serializing_if = "Option::is_none")]
    kvm: Option<OvfKvm>,
    #[serde(rename = "Container", default, skip_serializing_if = "Option::is_none")]
    container: Option<OvfContainer>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResourceSection {
    #[serde(rename = "Memory")]
    memory: OvfBound,
    #[serde(rename = "Vcpu")]
    vcpu: OvfBound,
    #[serde(rename = "Disk")]
    disk: OvfBound,
    #[serde(rename = "VcpuLimit", default, skip_serializing_if = "Option::is_none")]
    vcpu_limit: Option<OvfBound>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OvfBound {
    #[serde(rename = "@min")]
    min: f64,
    #[serde(rename = "@normal")]
    normal: f64,
    #[serde(rename = "@max")]
    max: f64,
    #[serde(rename = "@unit")]
    unit: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OvfFeatures {
    #[serde(rename = "Feature", default)]
    features: Vec<OvfFeature>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OvfFeature {
    #[serde(rename = "@name")]
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct OvfKvm {
    #[serde(rename = "@arch")]
    arch: String,
    #[serde(rename = "@machine", default, skip_serializing_if = "Option::is_none")]
    machine: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OvfContainer {
    #[serde(rename = "@fileRef", default, skip_serializing_if = "Option::is_none")]
    file_ref: Option<String>,
    #[serde(rename = "@hostname", default, skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,
    #[serde(rename = "@ipAddress", default, skip_serializing_if = "Option::is_none")]
    ip_address: Option<String>,
    #[serde(rename = "@nameserver", default, skip_serializing_if = "Option::is_none")]
    nameserver: Option<String>,
}

impl OvfBound {
    fn from_f64(dimension: Dimension, triple: &BoundTriple<f64>) -> Self {
        Self {
            min: triple.min,
            normal: triple.normal,
            max: triple.max,
            unit: dimension.unit().to_string(),
        }
    }

    fn from_u32(dimension: Dimension, triple: &BoundTriple<u32>) -> Self {
        Self {
            min: f64::from(triple.min),
            normal: f64::from(triple.normal),
            max: f64::from(triple.max),
            unit: dimension.unit().to_string(),
        }
    }

    fn check_unit(&self, dimension: Dimension) -> Result<()> {
        if self.unit.eq_ignore_ascii_case(dimension.unit()) {
            Ok(())
        } else {
            Err(DescriptorError::Invalid(format!(
                "{} is declared in '{}', expected '{}'",
                dimension,
                self.unit,
                dimension.unit()
            )))
        }
    }

    fn to_f64(&self, dimension: Dimension) -> Result<BoundTriple<f64>> {
        self.check_unit(dimension)?;
        Ok(BoundTriple::new(self.min, self.normal, self.max))
    }

    fn to_u32(&self, dimension: Dimension) -> Result<BoundTriple<u32>> {
        self.check_unit(dimension)?;
        let convert = |value: f64| -> Result<u32> {
            if value < 0.0 || value.fract() != 0.0 || value > f64::from(u32::MAX) {
                return Err(DescriptorError::Invalid(format!(
                    "{} bound {} is not a non-negative integer",
                    dimension, value
                )));
            }
            Ok(value as u32)
        };
        Ok(BoundTriple::new(
            convert(self.min)?,
            convert(self.normal)?,
            convert(self.max)?,
        ))
    }
}

fn envelope_from(descriptor: &Descriptor) -> Envelope {
    let mut references = References::default();
    let mut disks = Vec::new();

    for disk in &descriptor.disks {
        references.files.push(FileRef {
            id: disk.target.clone(),
            href: disk.source.clone(),
        });
        disks.push(OvfDisk {
            disk_id: disk.target.clone(),
            file_ref: disk.target.clone(),
            capacity: disk.capacity_gb,
            deploy_type: disk.deploy_type.as_str().to_string(),
            format: disk.format.clone(),
        });
    }

    let networks = descriptor
        .interfaces
        .iter()
        .map(|iface| OvfNetwork {
            name: iface.bridge.clone(),
            mac: iface.mac.clone(),
            nic_type: iface.nic_type.clone(),
        })
        .collect();

    let (kvm, container, vcpu_limit) = match &descriptor.settings {
        DomainSettings::Kvm(settings) => (
            Some(OvfKvm {
                arch: settings.arch.clone(),
                machine: settings.machine.clone(),
            }),
            None,
            None,
        ),
        DomainSettings::Openvz(settings) => {
            if let Some(archive) = &settings.filesystem_archive {
                references.files.push(FileRef {
                    id: "filesystem".to_string(),
                    href: archive.clone(),
                });
            }
            (
                None,
                Some(OvfContainer {
                    file_ref: settings
                        .filesystem_archive
                        .as_ref()
                        .map(|_| "filesystem".to_string()),
                    hostname: settings.hostname.clone(),
                    ip_address: settings.ip_address.clone(),
                    nameserver: settings.nameserver.clone(),
                }),
                Some(OvfBound::from_u32(
                    Dimension::VcpuLimit,
                    &settings.vcpu_limit,
                )),
            )
        }
    };

    Envelope {
        version: OVF_VERSION.to_string(),
        references,
        disk_section: DiskSection { disks },
        network_section: NetworkSection { networks },
        system: VirtualSystem {
            id: descriptor.template_name.clone(),
            domain_type: descriptor.domain_type().to_string(),
            resources: ResourceSection {
                memory: OvfBound::from_f64(Dimension::Memory, &descriptor.bounds.memory),
                vcpu: OvfBound::from_u32(Dimension::Vcpu, &descriptor.bounds.vcpu),
                disk: OvfBound::from_f64(Dimension::Disk, &descriptor.bounds.disk),
                vcpu_limit,
            },
            features: OvfFeatures {
                features: descriptor
                    .features
                    .iter()
                    .map(|name| OvfFeature { name: name.clone() })
                    .collect(),
            },
            kvm,
            container,
        },
    }
}

fn descriptor_from(envelope: Envelope) -> Result<Descriptor> {
    let domain: DomainType = envelope.system.domain_type.parse()?;
    let href_for = |id: &str| -> Result<String> {
        envelope
            .references
            .files
            .iter()
            .find(|file| file.id == id)
            .ok_or_else(|| DescriptorError::Invalid(format!("unresolved file reference '{}'", id)))
            .and_then(|file| {
                // payload paths resolve inside the unpacked template
                archive::normalize_entry(&file.href)
                    .map_err(|e| DescriptorError::Invalid(e.to_string()))
            })
    };

    let mut disks = Vec::with_capacity(envelope.disk_section.disks.len());
    for disk in &envelope.disk_section.disks {
        disks.push(DiskRecord {
            deploy_type: disk.deploy_type.parse()?,
            source: href_for(&disk.file_ref)?,
            target: disk.disk_id.clone(),
            capacity_gb: disk.capacity,
            format: disk.format.clone(),
        });
    }

    let resources = &envelope.system.resources;
    let bounds = ResourceBounds {
        memory: resources.memory.to_f64(Dimension::Memory)?,
        vcpu: resources.vcpu.to_u32(Dimension::Vcpu)?,
        disk: resources.disk.to_f64(Dimension::Disk)?,
    };

    let settings = match domain {
        DomainType::Kvm => {
            let kvm = envelope.system.kvm.as_ref();
            DomainSettings::Kvm(KvmSettings {
                arch: kvm
                    .map(|k| k.arch.clone())
                    .unwrap_or_else(|| KvmSettings::default().arch),
                machine: kvm.and_then(|k| k.machine.clone()),
            })
        }
        DomainType::Openvz => {
            let container = envelope.system.container.as_ref();
            let vcpu_limit = match &resources.vcpu_limit {
                Some(bound) => bound.to_u32(Dimension::VcpuLimit)?,
                None => OpenvzSettings::default().vcpu_limit,
            };
            let filesystem_archive = match container.and_then(|c| c.file_ref.as_deref()) {
                Some(id) => Some(href_for(id)?),
                None => None,
            };
            DomainSettings::Openvz(OpenvzSettings {
                vcpu_limit,
                filesystem_archive,
                hostname: container.and_then(|c| c.hostname.clone()),
                ip_address: container.and_then(|c| c.ip_address.clone()),
                nameserver: container.and_then(|c| c.nameserver.clone()),
            })
        }
    };

    Ok(Descriptor {
        template_name: envelope.system.id.clone(),
        instance: None,
        bounds,
        disks,
        interfaces: envelope
            .network_section
            .networks
            .iter()
            .map(|net| Interface {
                bridge: net.name.clone(),
                mac: net.mac.clone(),
                nic_type: net.nic_type.clone(),
            })
            .collect(),
        features: envelope
            .system
            .features
            .features
            .iter()
            .map(|f| f.name.clone())
            .collect(),
        settings,
    })
}

/// Render a descriptor as an `.ovf` document
pub fn to_ovf_string(descriptor: &Descriptor) -> Result<String> {
    let body = quick_xml::se::to_string(&envelope_from(descriptor))
        .map_err(|e| DescriptorError::Encode(e.to_string()))?;
    Ok(format!("{}{}\n", XML_DECLARATION, body))
}

/// Parse an `.ovf` document
pub fn from_ovf_str(xml: &str) -> Result<Descriptor> {
    let envelope: Envelope = quick_xml::de::from_str(xml)?;
    descriptor_from(envelope)
}

/// Read and parse an `.ovf` file
pub async fn read_ovf(path: &Path) -> Result<Descriptor> {
    debug!("Reading descriptor {}", path.display());
    let xml = tokio::fs::read_to_string(path).await?;
    from_ovf_str(&xml)
}

/// Render and write an `.ovf` file
pub async fn write_ovf(path: &Path, descriptor: &Descriptor) -> Result<()> {
    debug!("Writing descriptor {}", path.display());
    tokio::fs::write(path, to_ovf_string(descriptor)?).await?;
    Ok(())
}
