use super::*;
use crate::executor::{ExecutionResult, ScriptedExecutor};
use flate2::read::GzDecoder;
use tempfile::TempDir;

const CT101_CONF: &str = r#"# Managed by vzctl
ONBOOT="yes"
PHYSPAGES="0:262144"
SWAPPAGES="0:131072"
KMEMSIZE="67108864:73819750"
DISKSPACE="10485760:11534336"
CPUS="2"
CPULIMIT="100"
HOSTNAME="web.example.org"
IP_ADDRESS="10.0.0.5 10.0.0.6"
NAMESERVER="10.0.0.1"
OSTEMPLATE="centos-7-x86_64"
"#;

fn config(dir: &Path) -> OpenvzConfig {
    OpenvzConfig {
        conf_dir: dir.join("conf"),
        private_dir: dir.join("private"),
        template_cache: dir.join("cache"),
        ..Default::default()
    }
}

async fn host_with_ct101(dir: &Path) {
    let conf_dir = dir.join("conf");
    tokio::fs::create_dir_all(&conf_dir).await.unwrap();
    tokio::fs::write(conf_dir.join("101.conf"), CT101_CONF)
        .await
        .unwrap();
}

fn adapter(executor: Arc<ScriptedExecutor>, dir: &Path) -> OpenvzAdapter {
    OpenvzAdapter::new(executor, config(dir))
}

#[test]
fn test_next_ctid() {
    assert_eq!(next_ctid(&[101, 105, 99]), 106);
    assert_eq!(next_ctid(&[]), 100);
    assert_eq!(next_ctid(&[1, 2]), 100);
}

#[test]
fn test_parse_instance() {
    let adapter = adapter(Arc::new(ScriptedExecutor::new()), Path::new("/tmp"));
    assert_eq!(adapter.parse_instance("101").unwrap(), InstanceId::CtId(101));
    assert!(matches!(
        adapter.parse_instance("42"),
        Err(HypervisorError::InvalidInstance(_))
    ));
    assert!(adapter.parse_instance("web").is_err());
}

#[tokio::test]
async fn test_capture_config_reads_ubc_values() {
    let dir = TempDir::new().unwrap();
    host_with_ct101(dir.path()).await;
    let adapter = adapter(Arc::new(ScriptedExecutor::new()), dir.path());

    let descriptor = adapter
        .capture_config(&InstanceId::CtId(101), "web-ct")
        .await
        .unwrap();

    assert_eq!(descriptor.domain_type(), DomainType::Openvz);
    assert_eq!(descriptor.instance, Some(InstanceId::CtId(101)));
    assert_eq!(descriptor.bounds.memory.normal, 1.0);
    assert_eq!(descriptor.bounds.memory.min, 1.0);
    assert!(descriptor.bounds.memory.max > 1.09 && descriptor.bounds.memory.max < 1.11);
    assert_eq!(descriptor.bounds.disk, BoundTriple::new(10.0, 10.0, 11.0));
    assert_eq!(descriptor.bounds.vcpu, BoundTriple::fixed(2));

    let settings = descriptor.openvz().unwrap();
    assert_eq!(settings.vcpu_limit, BoundTriple::fixed(50));
    assert_eq!(settings.hostname.as_deref(), Some("web.example.org"));
    assert_eq!(settings.ip_address.as_deref(), Some("10.0.0.5"));
    assert_eq!(settings.nameserver.as_deref(), Some("10.0.0.1"));
    assert_eq!(descriptor.interfaces[0].nic_type, "venet");
}

#[tokio::test]
async fn test_capture_config_missing_container() {
    let dir = TempDir::new().unwrap();
    let adapter = adapter(Arc::new(ScriptedExecutor::new()), dir.path());
    assert!(matches!(
        adapter.capture_config(&InstanceId::CtId(202), "x").await,
        Err(HypervisorError::InstanceNotFound(_))
    ));
}

#[tokio::test]
async fn test_generated_config_reproduces_captured_values() {
    let dir = TempDir::new().unwrap();
    host_with_ct101(dir.path()).await;
    let adapter = adapter(Arc::new(ScriptedExecutor::new()), dir.path());

    let descriptor = adapter
        .capture_config(&InstanceId::CtId(101), "web-ct")
        .await
        .unwrap();
    let NativeConfig::VeConf(generated) = adapter.generate_config(&descriptor).unwrap() else {
        panic!("expected conf updates");
    };

    let original = VeConf::parse(CT101_CONF);
    for key in [
        "PHYSPAGES",
        "KMEMSIZE",
        "DISKSPACE",
        "CPUS",
        "CPULIMIT",
        "HOSTNAME",
        "NAMESERVER",
    ] {
        assert_eq!(generated.get(key), original.get(key), "{}", key);
    }
    assert_eq!(generated.get("IP_ADDRESS"), Some("10.0.0.5"));
    assert_eq!(generated.get("ONBOOT"), None);
}

#[tokio::test]
async fn test_generate_uses_normal_values_only() {
    let adapter = adapter(Arc::new(ScriptedExecutor::new()), Path::new("/tmp"));
    let mut descriptor = Descriptor::new_openvz("small");
    descriptor.bounds.memory = BoundTriple::new(0.25, 0.5, 4.0);
    descriptor.bounds.disk = BoundTriple::new(1.0, 2.0, 50.0);

    let NativeConfig::VeConf(conf) = adapter.generate_config(&descriptor).unwrap() else {
        panic!("expected conf updates");
    };
    assert_eq!(conf.get("PHYSPAGES"), Some("0:131072"));
    assert_eq!(conf.get("DISKSPACE"), Some("2097152:2306867"));
    assert_eq!(conf.get("CPULIMIT"), Some("50"));
}

#[tokio::test]
async fn test_capture_archives_private_area() {
    let dir = TempDir::new().unwrap();
    host_with_ct101(dir.path()).await;
    let private = dir.path().join("private/101/etc");
    tokio::fs::create_dir_all(&private).await.unwrap();
    tokio::fs::write(private.join("hostname"), "web\n").await.unwrap();

    let adapter = adapter(Arc::new(ScriptedExecutor::new()), dir.path());
    let mut descriptor = adapter
        .capture_config(&InstanceId::CtId(101), "web-ct")
        .await
        .unwrap();
    let staging = dir.path().join("staging");
    let payload = adapter
        .prepare_filesystem_for_capture(&mut descriptor, &staging)
        .await
        .unwrap();

    assert_eq!(payload, vec!["web-ct.tar.gz".to_string()]);
    assert_eq!(
        descriptor.openvz().unwrap().filesystem_archive.as_deref(),
        Some("web-ct.tar.gz")
    );

    let file = std::fs::File::open(staging.join("web-ct.tar.gz")).unwrap();
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let found = archive
        .entries()
        .unwrap()
        .filter_map(|entry| entry.ok())
        .any(|entry| entry.path().unwrap().ends_with("etc/hostname"));
    assert!(found);
}

#[tokio::test]
async fn test_capture_without_private_area() {
    let dir = TempDir::new().unwrap();
    host_with_ct101(dir.path()).await;
    let adapter = adapter(Arc::new(ScriptedExecutor::new()), dir.path());
    let mut descriptor = adapter
        .capture_config(&InstanceId::CtId(101), "web-ct")
        .await
        .unwrap();

    let result = adapter
        .prepare_filesystem_for_capture(&mut descriptor, &dir.path().join("staging"))
        .await;
    assert!(matches!(result, Err(HypervisorError::InstanceNotFound(_))));
}

fn deploy_descriptor(ctid: u32) -> Descriptor {
    let mut descriptor = Descriptor::new_openvz("web-ct");
    descriptor.instance = Some(InstanceId::CtId(ctid));
    if let Some(settings) = descriptor.openvz_mut() {
        settings.filesystem_archive = Some("web-ct.tar.gz".to_string());
        settings.hostname = Some("clone.example.org".to_string());
    }
    descriptor
}

#[tokio::test]
async fn test_deploy_links_define_merges_and_cleanup_reverts() {
    let dir = TempDir::new().unwrap();
    let staging = dir.path().join("staging");
    tokio::fs::create_dir_all(&staging).await.unwrap();
    tokio::fs::write(staging.join("web-ct.tar.gz"), b"payload")
        .await
        .unwrap();

    let conf_dir = dir.path().join("conf");
    let executor = Arc::new(
        ScriptedExecutor::new()
            .on_with(&["vzctl", "create", "150"], move |_| {
                std::fs::create_dir_all(&conf_dir).unwrap();
                std::fs::write(
                    conf_dir.join("150.conf"),
                    "ONBOOT=\"yes\"\nSWAPPAGES=\"0:131072\"\nVE_PRIVATE=\"/vz/private/$VEID\"\n",
                )
                .unwrap();
                ExecutionResult::ok("")
            })
            .on(&["vzlist"], "101\n150\n"),
    );
    let adapter = adapter(executor.clone(), dir.path());

    let mut descriptor = deploy_descriptor(150);
    adapter
        .prepare_filesystem_for_deploy(&mut descriptor, &staging)
        .await
        .unwrap();

    let link = dir.path().join("cache/web-ct-150.tar.gz");
    let meta = tokio::fs::symlink_metadata(&link).await.unwrap();
    assert!(meta.file_type().is_symlink());
    assert_eq!(
        descriptor.openvz().unwrap().filesystem_archive.as_deref(),
        Some(link.to_str().unwrap())
    );

    let native = adapter.generate_config(&descriptor).unwrap();
    adapter.define(&descriptor, &native).await.unwrap();

    let create = executor.calls_matching(&["vzctl", "create"]);
    assert_eq!(
        create[0].argv(),
        vec!["vzctl", "create", "150", "--ostemplate", "web-ct-150"]
    );
    let conf = VeConf::parse(
        &tokio::fs::read_to_string(dir.path().join("conf/150.conf"))
            .await
            .unwrap(),
    );
    assert_eq!(conf.get("ONBOOT"), Some("yes"));
    assert_eq!(conf.get("VE_PRIVATE"), Some("/vz/private/$VEID"));
    assert_eq!(conf.get("SWAPPAGES"), Some("0:131072"));
    assert_eq!(conf.get("PHYSPAGES"), Some("0:131072"));
    assert_eq!(conf.get("HOSTNAME"), Some("clone.example.org"));

    adapter.cleanup(&descriptor).await;
    assert_eq!(executor.calls_matching(&["vzctl", "stop", "150"]).len(), 1);
    assert_eq!(executor.calls_matching(&["vzctl", "destroy", "150"]).len(), 1);
    assert!(tokio::fs::symlink_metadata(&link).await.is_err());
}

#[tokio::test]
async fn test_deploy_refuses_to_replace_cached_template() {
    let dir = TempDir::new().unwrap();
    let staging = dir.path().join("staging");
    tokio::fs::create_dir_all(&staging).await.unwrap();
    tokio::fs::write(staging.join("web-ct.tar.gz"), b"payload")
        .await
        .unwrap();
    let cache = dir.path().join("cache");
    tokio::fs::create_dir_all(&cache).await.unwrap();
    tokio::fs::write(cache.join("web-ct-150.tar.gz"), b"someone else's")
        .await
        .unwrap();

    let adapter = adapter(Arc::new(ScriptedExecutor::new()), dir.path());
    let mut descriptor = deploy_descriptor(150);
    let result = adapter
        .prepare_filesystem_for_deploy(&mut descriptor, &staging)
        .await;

    assert!(matches!(result, Err(HypervisorError::PathExists(_))));
    assert_eq!(
        tokio::fs::read(cache.join("web-ct-150.tar.gz")).await.unwrap(),
        b"someone else's"
    );
}

#[tokio::test]
async fn test_allocate_instance() {
    let executor = Arc::new(ScriptedExecutor::new().on(&["vzlist"], "101\n105\n99\n"));
    let adapter = adapter(executor, Path::new("/tmp"));

    assert_eq!(
        adapter.allocate_instance(None).await.unwrap(),
        InstanceId::CtId(106)
    );
    assert_eq!(
        adapter.allocate_instance(Some("300")).await.unwrap(),
        InstanceId::CtId(300)
    );
    assert!(
        adapter
            .instance_exists(&InstanceId::CtId(105))
            .await
            .unwrap()
    );
}
