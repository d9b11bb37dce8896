use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use super::DescriptorError;

/// Hypervisor family a template targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainType {
    /// Hardware-virtualized guest managed through libvirt
    Kvm,
    /// OS-level container managed through vzctl
    Openvz,
}

impl DomainType {
    /// All supported domain types
    pub const ALL: [DomainType; 2] = [DomainType::Kvm, DomainType::Openvz];

    /// Lowercase name, also used as the repository subdirectory
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainType::Kvm => "kvm",
            DomainType::Openvz => "openvz",
        }
    }
}

impl fmt::Display for DomainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DomainType {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kvm" | "qemu" => Ok(DomainType::Kvm),
            "openvz" | "vz" => Ok(DomainType::Openvz),
            other => Err(DescriptorError::UnknownDomainType(other.to_string())),
        }
    }
}

/// Resource dimension tracked by a bound triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    /// Memory in GB
    Memory,
    /// Virtual CPU count
    Vcpu,
    /// Disk size in GB
    Disk,
    /// CPU usage limit in percent (OpenVZ only)
    VcpuLimit,
}

impl Dimension {
    /// Unit label used in descriptors and messages
    pub fn unit(&self) -> &'static str {
        match self {
            Dimension::Memory | Dimension::Disk => "GB",
            Dimension::Vcpu => "count",
            Dimension::VcpuLimit => "percent",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dimension::Memory => "memory",
            Dimension::Vcpu => "vcpu",
            Dimension::Disk => "disk",
            Dimension::VcpuLimit => "vcpu_limit",
        };
        f.write_str(name)
    }
}

/// (min, normal, max) values for one resource dimension
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundTriple<T> {
    pub min: T,
    pub normal: T,
    pub max: T,
}

impl<T: Copy + PartialOrd> BoundTriple<T> {
    pub fn new(min: T, normal: T, max: T) -> Self {
        Self { min, normal, max }
    }

    /// Triple with all three slots set to `value`
    pub fn fixed(value: T) -> Self {
        Self::new(value, value, value)
    }

    /// `min <= normal <= max`
    pub fn is_ordered(&self) -> bool {
        self.min <= self.normal && self.normal <= self.max
    }
}

/// Resource bounds shared by every domain type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceBounds {
    /// Memory in GB (fractional allowed)
    pub memory: BoundTriple<f64>,
    /// Virtual CPU count
    pub vcpu: BoundTriple<u32>,
    /// Disk size in GB (fractional allowed)
    pub disk: BoundTriple<f64>,
}

/// How a disk is backed on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployType {
    /// Image file
    File,
    /// Raw block device
    PhysicalBlock,
    /// LVM logical volume
    LvmBlock,
}

impl DeployType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployType::File => "file",
            DeployType::PhysicalBlock => "physical",
            DeployType::LvmBlock => "lvm",
        }
    }

    /// Whether the source is a block device on the host
    pub fn is_block(&self) -> bool {
        !matches!(self, DeployType::File)
    }
}

impl FromStr for DeployType {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(DeployType::File),
            "physical" | "block" => Ok(DeployType::PhysicalBlock),
            "lvm" => Ok(DeployType::LvmBlock),
            other => Err(DescriptorError::Invalid(format!(
                "unknown disk deploy type '{}'",
                other
            ))),
        }
    }
}

/// One disk of a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskRecord {
    pub deploy_type: DeployType,
    /// Relative payload path template-side, device or image path host-side
    pub source: String,
    /// Guest device name, e.g. `vda`
    pub target: String,
    /// Declared capacity in GB
    pub capacity_gb: f64,
    /// Image format of the payload, e.g. `qcow2`
    pub format: Option<String>,
}

/// One network interface of a template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub bridge: String,
    pub mac: Option<String>,
    pub nic_type: String,
}

/// KVM-only settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvmSettings {
    pub arch: String,
    pub machine: Option<String>,
}

impl Default for KvmSettings {
    fn default() -> Self {
        Self {
            arch: "x86_64".to_string(),
            machine: None,
        }
    }
}

/// OpenVZ-only settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenvzSettings {
    /// CPU usage limit in percent
    pub vcpu_limit: BoundTriple<u32>,
    /// Relative path of the filesystem archive inside the template
    pub filesystem_archive: Option<String>,
    pub hostname: Option<String>,
    pub ip_address: Option<String>,
    pub nameserver: Option<String>,
}

impl Default for OpenvzSettings {
    fn default() -> Self {
        Self {
            vcpu_limit: BoundTriple::new(0, 50, 100),
            filesystem_archive: None,
            hostname: None,
            ip_address: None,
            nameserver: None,
        }
    }
}

/// Domain-specific part of a descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DomainSettings {
    Kvm(KvmSettings),
    Openvz(OpenvzSettings),
}

/// Identity of the instance a descriptor was captured from or deploys to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceId {
    /// libvirt domain name
    Name(String),
    /// OpenVZ container ID
    CtId(u32),
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceId::Name(name) => f.write_str(name),
            InstanceId::CtId(id) => write!(f, "{}", id),
        }
    }
}

/// Neutral, hypervisor-independent record of a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub template_name: String,
    /// Source instance on capture, target instance on deploy
    pub instance: Option<InstanceId>,
    pub bounds: ResourceBounds,
    pub disks: Vec<DiskRecord>,
    pub interfaces: Vec<Interface>,
    pub features: BTreeSet<String>,
    pub settings: DomainSettings,
}

impl Descriptor {
    /// Empty descriptor with KVM defaults
    pub fn new_kvm(template_name: impl Into<String>) -> Self {
        Self {
            template_name: template_name.into(),
            instance: None,
            bounds: ResourceBounds {
                memory: BoundTriple::new(0.5, 1.0, 2.0),
                vcpu: BoundTriple::new(1, 1, 4),
                disk: BoundTriple::new(5.0, 10.0, 50.0),
            },
            disks: Vec::new(),
            interfaces: Vec::new(),
            features: ["acpi", "apic", "pae"]
                .into_iter()
                .map(String::from)
                .collect(),
            settings: DomainSettings::Kvm(KvmSettings::default()),
        }
    }

    /// Empty descriptor with OpenVZ defaults
    pub fn new_openvz(template_name: impl Into<String>) -> Self {
        Self {
            template_name: template_name.into(),
            instance: None,
            bounds: ResourceBounds {
                memory: BoundTriple::new(0.25, 0.5, 2.0),
                vcpu: BoundTriple::new(1, 1, 4),
                disk: BoundTriple::new(2.0, 10.0, 100.0),
            },
            disks: Vec::new(),
            interfaces: vec![Interface {
                bridge: String::new(),
                mac: None,
                nic_type: "venet".to_string(),
            }],
            features: BTreeSet::new(),
            settings: DomainSettings::Openvz(OpenvzSettings::default()),
        }
    }

    /// Empty descriptor with defaults for `domain`
    pub fn new(domain: DomainType, template_name: impl Into<String>) -> Self {
        match domain {
            DomainType::Kvm => Self::new_kvm(template_name),
            DomainType::Openvz => Self::new_openvz(template_name),
        }
    }

    pub fn domain_type(&self) -> DomainType {
        match self.settings {
            DomainSettings::Kvm(_) => DomainType::Kvm,
            DomainSettings::Openvz(_) => DomainType::Openvz,
        }
    }

    pub fn openvz(&self) -> Option<&OpenvzSettings> {
        match &self.settings {
            DomainSettings::Openvz(settings) => Some(settings),
            DomainSettings::Kvm(_) => None,
        }
    }

    pub fn openvz_mut(&mut self) -> Option<&mut OpenvzSettings> {
        match &mut self.settings {
            DomainSettings::Openvz(settings) => Some(settings),
            DomainSettings::Kvm(_) => None,
        }
    }

    pub fn kvm(&self) -> Option<&KvmSettings> {
        match &self.settings {
            DomainSettings::Kvm(settings) => Some(settings),
            DomainSettings::Openvz(_) => None,
        }
    }

    /// Relative payload paths the descriptor references
    pub fn payload_files(&self) -> Vec<String> {
        match &self.settings {
            DomainSettings::Kvm(_) => self.disks.iter().map(|d| d.source.clone()).collect(),
            DomainSettings::Openvz(settings) => {
                settings.filesystem_archive.iter().cloned().collect()
            }
        }
    }

    /// Bound ordering check, one error per violated dimension
    pub fn check_bounds(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        check_triple(Dimension::Memory, &self.bounds.memory, &mut errors);
        check_triple(Dimension::Vcpu, &as_f64(&self.bounds.vcpu), &mut errors);
        check_triple(Dimension::Disk, &self.bounds.disk, &mut errors);
        if let Some(settings) = self.openvz() {
            check_triple(
                Dimension::VcpuLimit,
                &as_f64(&settings.vcpu_limit),
                &mut errors,
            );
        }
        errors
    }

    /// Structural and format-specific checks (names, devices, minimums)
    pub fn check_structure(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Err(e) = validate_template_name(&self.template_name) {
            errors.push(e);
        }

        let mut targets = HashSet::new();
        for disk in &self.disks {
            if !targets.insert(disk.target.as_str()) {
                errors.push(ValidationError::DuplicateDiskTarget(disk.target.clone()));
            }
            if disk.source.is_empty() {
                errors.push(ValidationError::InvalidValue {
                    field: format!("disk {}", disk.target),
                    reason: "missing source".to_string(),
                });
            }
        }

        if self.bounds.vcpu.min == 0 {
            errors.push(ValidationError::InvalidValue {
                field: Dimension::Vcpu.to_string(),
                reason: "at least one vcpu is required".to_string(),
            });
        }
        if self.bounds.memory.min <= 0.0 {
            errors.push(ValidationError::InvalidValue {
                field: Dimension::Memory.to_string(),
                reason: "memory must be positive".to_string(),
            });
        }

        match &self.settings {
            DomainSettings::Kvm(_) => {}
            DomainSettings::Openvz(_) => {
                if self.interfaces.len() > 1 {
                    errors.push(ValidationError::InvalidValue {
                        field: "interfaces".to_string(),
                        reason: "OpenVZ templates model at most one interface".to_string(),
                    });
                }
            }
        }

        errors
    }

    /// Full validation: structure first, then bound ordering
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = self.check_structure();
        errors.extend(self.check_bounds());
        errors
    }
}

fn as_f64(triple: &BoundTriple<u32>) -> BoundTriple<f64> {
    BoundTriple::new(
        f64::from(triple.min),
        f64::from(triple.normal),
        f64::from(triple.max),
    )
}

fn check_triple(dimension: Dimension, triple: &BoundTriple<f64>, errors: &mut Vec<ValidationError>) {
    if triple.min > triple.max {
        errors.push(ValidationError::BoundOrder {
            dimension,
            min: triple.min,
            max: triple.max,
        });
    } else if !triple.is_ordered() {
        errors.push(ValidationError::NormalOutOfRange {
            dimension,
            min: triple.min,
            normal: triple.normal,
            max: triple.max,
        });
    }
}

/// Template names end up in file names and archive entries.
pub fn validate_template_name(name: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > 64 {
        return Err(invalid("name is longer than 64 characters"));
    }
    if name.starts_with('.') || name.starts_with('-') {
        return Err(invalid("name must start with a letter or digit"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(invalid("only letters, digits, '.', '_' and '-' are allowed"));
    }
    Ok(())
}

/// Recoverable validation failure, presented to the operator for correction
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("{dimension}: minimum {min} exceeds maximum {max}")]
    BoundOrder { dimension: Dimension, min: f64, max: f64 },

    #[error("{dimension}: value {normal} outside [{min}, {max}]")]
    NormalOutOfRange {
        dimension: Dimension,
        min: f64,
        normal: f64,
        max: f64,
    },

    #[error("duplicate disk target '{0}'")]
    DuplicateDiskTarget(String),

    #[error("invalid template name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("{field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ValidationError {
    /// Dimension the error is about, if it concerns a resource bound
    pub fn dimension(&self) -> Option<Dimension> {
        match self {
            ValidationError::BoundOrder { dimension, .. }
            | ValidationError::NormalOutOfRange { dimension, .. } => Some(*dimension),
            _ => None,
        }
    }
}
