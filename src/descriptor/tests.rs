use super::*;
use crate::env;
use tempfile::TempDir;

fn kvm_fixture() -> Descriptor {
    let mut descriptor = Descriptor::new_kvm(env::test::TEST_TEMPLATE_NAME);
    descriptor.bounds.memory = BoundTriple::new(1.0, 2.5, 4.0);
    descriptor.bounds.vcpu = BoundTriple::new(1, 2, 4);
    descriptor.bounds.disk = BoundTriple::new(8.0, 10.0, 20.0);
    descriptor.disks = vec![
        DiskRecord {
            deploy_type: DeployType::File,
            source: "web-vda.qcow2".to_string(),
            target: "vda".to_string(),
            capacity_gb: 10.0,
            format: Some("qcow2".to_string()),
        },
        DiskRecord {
            deploy_type: DeployType::LvmBlock,
            source: "web-vdb.qcow2".to_string(),
            target: "vdb".to_string(),
            capacity_gb: 2.0,
            format: Some("qcow2".to_string()),
        },
    ];
    descriptor.interfaces = vec![Interface {
        bridge: "br0".to_string(),
        mac: Some("52:54:00:12:34:56".to_string()),
        nic_type: "virtio".to_string(),
    }];
    descriptor
}

fn openvz_fixture() -> Descriptor {
    let mut descriptor = Descriptor::new_openvz("base-ct");
    if let Some(settings) = descriptor.openvz_mut() {
        settings.vcpu_limit = BoundTriple::new(10, 50, 100);
        settings.filesystem_archive = Some("base-ct.tar.gz".to_string());
        settings.hostname = Some("base.example.org".to_string());
        settings.nameserver = Some("8.8.8.8".to_string());
    }
    descriptor
}

#[test]
fn test_defaults_per_domain_type() {
    let kvm = Descriptor::new(DomainType::Kvm, "a");
    assert_eq!(kvm.domain_type(), DomainType::Kvm);
    assert!(kvm.features.contains("acpi"));
    assert!(kvm.openvz().is_none());
    assert!(kvm.validate().is_empty());

    let vz = Descriptor::new(DomainType::Openvz, "b");
    assert_eq!(vz.domain_type(), DomainType::Openvz);
    assert_eq!(vz.interfaces.len(), 1);
    assert_eq!(vz.interfaces[0].nic_type, "venet");
    assert!(vz.validate().is_empty());
}

#[test]
fn test_domain_type_parsing() {
    assert_eq!("KVM".parse::<DomainType>().unwrap(), DomainType::Kvm);
    assert_eq!("openvz".parse::<DomainType>().unwrap(), DomainType::Openvz);
    assert!(matches!(
        "xen".parse::<DomainType>(),
        Err(DescriptorError::UnknownDomainType(_))
    ));
}

#[test]
fn test_kvm_ovf_roundtrip_preserves_descriptor() {
    let descriptor = kvm_fixture();
    let xml = to_ovf_string(&descriptor).unwrap();

    assert!(xml.starts_with("<?xml"));
    assert!(xml.contains("<ResourceSection>"));
    assert!(xml.contains("domainType=\"kvm\""));

    let parsed = from_ovf_str(&xml).unwrap();
    assert_eq!(parsed, descriptor);
}

#[test]
fn test_openvz_ovf_roundtrip_keeps_vcpu_limit_and_archive() {
    let descriptor = openvz_fixture();
    let xml = to_ovf_string(&descriptor).unwrap();
    assert!(xml.contains("<VcpuLimit"));

    let parsed = from_ovf_str(&xml).unwrap();
    assert_eq!(parsed, descriptor);
    assert_eq!(parsed.payload_files(), vec!["base-ct.tar.gz".to_string()]);
}

#[test]
fn test_ovf_rejects_fractional_vcpu() {
    let xml = to_ovf_string(&kvm_fixture())
        .unwrap()
        .replace("<Vcpu min=\"1\"", "<Vcpu min=\"1.5\"");
    let result = from_ovf_str(&xml);
    assert!(matches!(result, Err(DescriptorError::Invalid(_))));
}

#[test]
fn test_ovf_rejects_unresolved_file_reference() {
    let xml = to_ovf_string(&kvm_fixture())
        .unwrap()
        .replace("fileRef=\"vdb\"", "fileRef=\"missing\"");
    assert!(matches!(from_ovf_str(&xml), Err(DescriptorError::Invalid(_))));
}

#[test]
fn test_ovf_rejects_payload_paths_outside_template() {
    for href in ["/etc/shadow", "../../../root/.ssh/id_rsa", "images/../../escape.qcow2"] {
        let xml = to_ovf_string(&kvm_fixture())
            .unwrap()
            .replace("href=\"web-vda.qcow2\"", &format!("href=\"{}\"", href));
        assert!(
            matches!(from_ovf_str(&xml), Err(DescriptorError::Invalid(_))),
            "{href}"
        );
    }

    let mut descriptor = openvz_fixture();
    descriptor.openvz_mut().unwrap().filesystem_archive = Some("/vz/private/101.tar.gz".to_string());
    let xml = to_ovf_string(&descriptor).unwrap();
    assert!(matches!(from_ovf_str(&xml), Err(DescriptorError::Invalid(_))));
}

#[test]
fn test_ovf_rejects_mismatched_units() {
    let xml = to_ovf_string(&kvm_fixture())
        .unwrap()
        .replacen("unit=\"GB\"", "unit=\"MB\"", 1);
    assert!(matches!(from_ovf_str(&xml), Err(DescriptorError::Invalid(_))));

    let xml = to_ovf_string(&openvz_fixture())
        .unwrap()
        .replace("unit=\"percent\"", "unit=\"count\"");
    assert!(matches!(from_ovf_str(&xml), Err(DescriptorError::Invalid(_))));
}

#[test]
fn test_check_bounds_reports_each_dimension() {
    let mut descriptor = openvz_fixture();
    descriptor.bounds.memory = BoundTriple::new(4.0, 2.0, 1.0);
    descriptor.bounds.vcpu = BoundTriple::new(1, 8, 4);
    if let Some(settings) = descriptor.openvz_mut() {
        settings.vcpu_limit = BoundTriple::new(90, 50, 80);
    }

    let errors = descriptor.check_bounds();
    let dims: Vec<_> = errors.iter().filter_map(|e| e.dimension()).collect();
    assert_eq!(
        dims,
        vec![Dimension::Memory, Dimension::Vcpu, Dimension::VcpuLimit]
    );
    assert!(matches!(errors[0], ValidationError::BoundOrder { .. }));
    assert!(matches!(errors[1], ValidationError::NormalOutOfRange { .. }));
}

#[test]
fn test_check_structure_flags_duplicate_targets() {
    let mut descriptor = kvm_fixture();
    descriptor.disks[1].target = "vda".to_string();

    let errors = descriptor.check_structure();
    assert_eq!(
        errors,
        vec![ValidationError::DuplicateDiskTarget("vda".to_string())]
    );
}

#[test]
fn test_check_structure_limits_openvz_interfaces() {
    let mut descriptor = openvz_fixture();
    descriptor.interfaces.push(descriptor.interfaces[0].clone());
    assert_eq!(descriptor.check_structure().len(), 1);
}

#[test]
fn test_template_name_validation() {
    assert!(validate_template_name("centos-7.9_base").is_ok());
    assert!(validate_template_name("").is_err());
    assert!(validate_template_name(".hidden").is_err());
    assert!(validate_template_name("a/b").is_err());
    assert!(validate_template_name(&"x".repeat(65)).is_err());
}

#[tokio::test]
async fn test_ovf_file_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join(env::descriptor_file_name("web"));

    let descriptor = kvm_fixture();
    write_ovf(&path, &descriptor).await.unwrap();
    let loaded = read_ovf(&path).await.unwrap();

    assert_eq!(loaded, descriptor);
}
