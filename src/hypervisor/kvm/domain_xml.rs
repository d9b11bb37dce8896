//! Subset of the libvirt domain XML schema the adapter reads and writes.
//!
//! Elements outside this model (controllers, consoles, graphics...) are
//! ignored on read and omitted on write; libvirt fills in its defaults.

use crate::hypervisor::{HypervisorError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "domain")]
pub struct DomainXml {
    #[serde(rename = "@type")]
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub memory: MemoryXml,
    #[serde(
        rename = "currentMemory",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub current_memory: Option<MemoryXml>,
    pub vcpu: VcpuXml,
    pub os: OsXml,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<FeaturesXml>,
    pub devices: DevicesXml,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryXml {
    #[serde(rename = "@unit", default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(rename = "$text")]
    pub value: u64,
}

impl MemoryXml {
    pub fn kib(value: u64) -> Self {
        Self {
            unit: Some("KiB".to_string()),
            value,
        }
    }

    /// Value in KiB, honouring libvirt's unit suffixes (KiB is the default)
    pub fn to_kib(&self) -> Result<u64> {
        let unit = self.unit.as_deref().unwrap_or("KiB");
        let kib = match unit {
            "b" | "bytes" => self.value / 1024,
            "KB" => self.value * 1000 / 1024,
            "k" | "KiB" => self.value,
            "MB" => self.value * 1000 * 1000 / 1024,
            "M" | "MiB" => self.value * 1024,
            "GB" => self.value * 1000 * 1000 * 1000 / 1024,
            "G" | "GiB" => self.value * 1024 * 1024,
            "T" | "TiB" => self.value * 1024 * 1024 * 1024,
            other => {
                return Err(HypervisorError::Parse {
                    what: "memory unit".to_string(),
                    detail: other.to_string(),
                });
            }
        };
        Ok(kib)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VcpuXml {
    #[serde(rename = "@placement", default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<String>,
    #[serde(rename = "$text")]
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsXml {
    #[serde(rename = "type")]
    pub os_type: OsTypeXml,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsTypeXml {
    #[serde(rename = "@arch", default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(rename = "@machine", default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,
    #[serde(rename = "$text")]
    pub kind: String,
}

/// Presence-only element such as `<acpi/>`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Flag {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeaturesXml {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acpi: Option<Flag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apic: Option<Flag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pae: Option<Flag>,
}

/// Feature names the model understands
pub const KNOWN_FEATURES: [&str; 3] = ["acpi", "apic", "pae"];

impl FeaturesXml {
    pub fn names(&self) -> Vec<&'static str> {
        [
            ("acpi", &self.acpi),
            ("apic", &self.apic),
            ("pae", &self.pae),
        ]
        .into_iter()
        .filter(|(_, flag)| flag.is_some())
        .map(|(name, _)| name)
        .collect()
    }

    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut features = Self::default();
        for name in names {
            match name {
                "acpi" => features.acpi = Some(Flag {}),
                "apic" => features.apic = Some(Flag {}),
                "pae" => features.pae = Some(Flag {}),
                _ => {}
            }
        }
        features
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DevicesXml {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disk: Vec<DiskXml>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interface: Vec<InterfaceXml>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskXml {
    /// `file` or `block`
    #[serde(rename = "@type")]
    pub kind: String,
    /// `disk`, `cdrom` or `floppy`
    #[serde(rename = "@device", default = "default_disk_device")]
    pub device: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<DriverXml>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<DiskSourceXml>,
    pub target: TargetXml,
}

fn default_disk_device() -> String {
    "disk".to_string()
}

impl DiskXml {
    /// File path or block device path of the disk
    pub fn source_path(&self) -> Option<&str> {
        let source = self.source.as_ref()?;
        source.file.as_deref().or(source.dev.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverXml {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskSourceXml {
    #[serde(rename = "@file", default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(rename = "@dev", default, skip_serializing_if = "Option::is_none")]
    pub dev: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetXml {
    #[serde(rename = "@dev")]
    pub dev: String,
    #[serde(rename = "@bus", default, skip_serializing_if = "Option::is_none")]
    pub bus: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceXml {
    #[serde(rename = "@type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<MacXml>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<InterfaceSourceXml>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelXml>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacXml {
    #[serde(rename = "@address")]
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceSourceXml {
    #[serde(rename = "@bridge", default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelXml {
    #[serde(rename = "@type")]
    pub kind: String,
}

pub fn parse_domain(xml: &str) -> Result<DomainXml> {
    quick_xml::de::from_str(xml).map_err(|e| HypervisorError::Parse {
        what: "domain XML".to_string(),
        detail: e.to_string(),
    })
}

pub fn render_domain(domain: &DomainXml) -> Result<String> {
    quick_xml::se::to_string(domain).map_err(|e| HypervisorError::NativeConfig(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIBVIRT_DUMP: &str = r#"<domain type='kvm' id='3'>
  <name>web</name>
  <uuid>8f2b3c7e-1111-4a2b-9c3d-000000000001</uuid>
  <memory unit='KiB'>2097152</memory>
  <currentMemory unit='KiB'>2097152</currentMemory>
  <vcpu placement='static'>2</vcpu>
  <os>
    <type arch='x86_64' machine='pc-i440fx-2.9'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
    <vmport state='off'/>
  </features>
  <devices>
    <emulator>/usr/bin/qemu-system-x86_64</emulator>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/var/lib/libvirt/images/web.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <controller type='usb' index='0'/>
    <disk type='block' device='disk'>
      <driver name='qemu' type='raw'/>
      <source dev='/dev/vg0/web-data'/>
      <target dev='vdb' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <target dev='hdc' bus='ide'/>
    </disk>
    <interface type='bridge'>
      <mac address='52:54:00:aa:bb:cc'/>
      <source bridge='br0'/>
      <model type='virtio'/>
    </interface>
    <console type='pty'/>
  </devices>
</domain>"#;

    #[test]
    fn test_parse_libvirt_dump() {
        let domain = parse_domain(LIBVIRT_DUMP).unwrap();

        assert_eq!(domain.name, "web");
        assert_eq!(domain.memory.to_kib().unwrap(), 2 * 1024 * 1024);
        assert_eq!(domain.vcpu.count, 2);
        assert_eq!(domain.os.os_type.arch.as_deref(), Some("x86_64"));
        assert_eq!(domain.features.as_ref().unwrap().names(), vec!["acpi", "apic"]);

        // overlapping lists: disks interleaved with other devices
        assert_eq!(domain.devices.disk.len(), 3);
        assert_eq!(
            domain.devices.disk[1].source_path(),
            Some("/dev/vg0/web-data")
        );
        assert_eq!(domain.devices.disk[2].device, "cdrom");
        assert_eq!(domain.devices.interface.len(), 1);
    }

    #[test]
    fn test_render_then_parse_is_stable() {
        let domain = parse_domain(LIBVIRT_DUMP).unwrap();
        let rendered = render_domain(&domain).unwrap();
        assert!(rendered.starts_with("<domain type=\"kvm\">"));
        assert_eq!(parse_domain(&rendered).unwrap(), domain);
    }

    #[test]
    fn test_memory_units() {
        let mem = |unit: &str, value| MemoryXml {
            unit: Some(unit.to_string()),
            value,
        };
        assert_eq!(mem("MiB", 512).to_kib().unwrap(), 512 * 1024);
        assert_eq!(mem("GiB", 2).to_kib().unwrap(), 2 * 1024 * 1024);
        assert_eq!(mem("bytes", 4096).to_kib().unwrap(), 4);
        assert!(mem("parsecs", 1).to_kib().is_err());
    }
}
