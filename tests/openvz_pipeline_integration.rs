use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use vmtpl::descriptor::{BoundTriple, Descriptor, DomainType, InstanceId, ValidationError};
use vmtpl::distribution::Checksummer;
use vmtpl::executor::{ExecutionResult, ScriptedExecutor};
use vmtpl::hypervisor::{OpenvzAdapter, OpenvzConfig, VeConf};
use vmtpl::orchestrator::{
    Adjuster, CaptureState, Decision, DeployState, Orchestrator, OrchestratorConfig, Overrides,
    PipelineError, PreconditionError,
};
use vmtpl::probe::StaticProbe;
use vmtpl::repository::Repository;

const CT101_CONF: &str = r#"ONBOOT="yes"
PHYSPAGES="0:262144"
SWAPPAGES="0:131072"
KMEMSIZE="67108864:73819750"
DISKSPACE="10485760:11534336"
CPUS="2"
CPULIMIT="100"
HOSTNAME="web.example.org"
IP_ADDRESS="10.0.0.5"
NAMESERVER="10.0.0.1"
"#;

/// Host with CT 101 running and `vzctl create 102` writing a stock conf
fn openvz_host(dir: &Path) -> ScriptedExecutor {
    std::fs::create_dir_all(dir.join("conf")).unwrap();
    std::fs::write(dir.join("conf/101.conf"), CT101_CONF).unwrap();
    std::fs::create_dir_all(dir.join("private/101/etc")).unwrap();
    std::fs::write(dir.join("private/101/etc/hostname"), "web\n").unwrap();

    let conf_dir = dir.join("conf");
    ScriptedExecutor::new()
        .on(&["vzlist"], "101\n")
        .on_with(&["vzctl", "create", "102"], move |_| {
            std::fs::write(
                conf_dir.join("102.conf"),
                "ONBOOT=\"yes\"\nVE_ROOT=\"/vz/root/$VEID\"\n",
            )
            .unwrap();
            ExecutionResult::ok("")
        })
}

fn orchestrator(dir: &Path, executor: Arc<ScriptedExecutor>) -> Orchestrator {
    let adapter = OpenvzAdapter::new(
        executor,
        OpenvzConfig {
            conf_dir: dir.join("conf"),
            private_dir: dir.join("private"),
            template_cache: dir.join("cache"),
            ..Default::default()
        },
    );
    Orchestrator::new(
        Repository::new(dir.join("repo")),
        Arc::new(StaticProbe::new(4, 8.0, 100.0)),
        Checksummer::native(),
        OrchestratorConfig::default(),
    )
    .with_adapter(Arc::new(adapter))
}

#[tokio::test]
async fn test_capture_then_deploy_reproduces_container_limits() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(openvz_host(dir.path()));
    let orchestrator = orchestrator(dir.path(), executor.clone());

    let capture = orchestrator
        .capture(DomainType::Openvz, "101", "web-ct", &Overrides::default())
        .await
        .unwrap();
    assert_eq!(
        capture.states,
        vec![
            CaptureState::Idle,
            CaptureState::SourceSelected,
            CaptureState::FilesystemCopying,
            CaptureState::ConfigParsed,
            CaptureState::AwaitingUserAdjustment,
            CaptureState::Validated,
            CaptureState::Packaged,
            CaptureState::Archived,
            CaptureState::Done,
        ]
    );
    let archive = orchestrator
        .repository()
        .archive_path(DomainType::Openvz, "web-ct");
    assert!(Checksummer::native().verify_file(&archive).await.unwrap());
    assert_eq!(
        orchestrator
            .list_local_templates(DomainType::Openvz)
            .await
            .unwrap(),
        vec!["web-ct"]
    );

    let overrides = Overrides {
        hostname: Some("web-2.example.org".to_string()),
        ..Default::default()
    };
    let deploy = orchestrator
        .deploy(DomainType::Openvz, "web-ct", None, &overrides)
        .await
        .unwrap();
    assert_eq!(deploy.instance, Some(InstanceId::CtId(102)));
    assert_eq!(deploy.states.last(), Some(&DeployState::Done));

    let conf = VeConf::parse(&std::fs::read_to_string(dir.path().join("conf/102.conf")).unwrap());
    assert_eq!(conf.get("ONBOOT"), Some("yes"));
    assert_eq!(conf.get("VE_ROOT"), Some("/vz/root/$VEID"));
    assert_eq!(conf.get("PHYSPAGES"), Some("0:262144"));
    assert_eq!(conf.get("KMEMSIZE"), Some("67108864:73819750"));
    assert_eq!(conf.get("DISKSPACE"), Some("10485760:11534336"));
    assert_eq!(conf.get("CPUS"), Some("2"));
    assert_eq!(conf.get("CPULIMIT"), Some("100"));
    assert_eq!(conf.get("HOSTNAME"), Some("web-2.example.org"));
    assert_eq!(conf.get("NAMESERVER"), Some("10.0.0.1"));

    let link = dir.path().join("cache/web-ct-102.tar.gz");
    assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
    assert_eq!(executor.calls_matching(&["vzctl", "start", "102"]).len(), 1);
}

#[tokio::test]
async fn test_deploy_onto_existing_container_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(openvz_host(dir.path()));
    let orchestrator = orchestrator(dir.path(), executor.clone());
    orchestrator
        .capture(DomainType::Openvz, "101", "web-ct", &Overrides::default())
        .await
        .unwrap();
    let conf_before = std::fs::read_to_string(dir.path().join("conf/101.conf")).unwrap();

    let err = orchestrator
        .deploy(DomainType::Openvz, "web-ct", Some("101"), &Overrides::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Precondition(PreconditionError::InstanceExists(InstanceId::CtId(101)))
    ));
    assert!(executor.calls_matching(&["vzctl"]).is_empty());
    assert!(
        !orchestrator
            .repository()
            .deploy_staging(DomainType::Openvz, "web-ct")
            .exists()
    );
    assert!(!dir.path().join("cache").exists());
    assert_eq!(
        std::fs::read_to_string(dir.path().join("conf/101.conf")).unwrap(),
        conf_before
    );
}

#[tokio::test]
async fn test_capture_under_taken_name_is_refused() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(openvz_host(dir.path()));
    let orchestrator = orchestrator(dir.path(), executor);
    orchestrator
        .capture(DomainType::Openvz, "101", "web-ct", &Overrides::default())
        .await
        .unwrap();
    let archive = orchestrator
        .repository()
        .archive_path(DomainType::Openvz, "web-ct");
    let original = std::fs::read(&archive).unwrap();

    let err = orchestrator
        .capture(DomainType::Openvz, "101", "web-ct", &Overrides::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Precondition(PreconditionError::TemplateExists { .. })
    ));
    assert_eq!(std::fs::read(&archive).unwrap(), original);
}

#[tokio::test]
async fn test_deploy_exceeding_host_memory_is_rejected_before_placement() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(openvz_host(dir.path()));
    let orchestrator = orchestrator(dir.path(), executor.clone());
    orchestrator
        .capture(DomainType::Openvz, "101", "web-ct", &Overrides::default())
        .await
        .unwrap();

    let overrides = Overrides {
        memory: Some(32.0),
        ..Default::default()
    };
    let err = orchestrator
        .deploy(DomainType::Openvz, "web-ct", None, &overrides)
        .await
        .unwrap_err();

    assert!(!err.validation_errors().is_empty());
    assert!(executor.calls_matching(&["vzctl", "create"]).is_empty());
    assert!(!dir.path().join("cache/web-ct-102.tar.gz").exists());
}

/// Declares a usage limit above 100 percent on the first round
struct WideCpuLimit;

#[async_trait]
impl Adjuster for WideCpuLimit {
    async fn adjust(
        &self,
        descriptor: &mut Descriptor,
        errors: &[ValidationError],
        round: u32,
    ) -> Decision {
        if round > 1 {
            assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
            return Decision::Abort;
        }
        if let Some(settings) = descriptor.openvz_mut() {
            settings.vcpu_limit = BoundTriple::new(10, 150, 400);
        }
        Decision::Proceed
    }
}

#[tokio::test]
async fn test_cpu_limit_above_hundred_is_clamped_on_deploy() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(openvz_host(dir.path()));
    let orchestrator = orchestrator(dir.path(), executor);
    orchestrator
        .capture(DomainType::Openvz, "101", "web-ct", &Overrides::default())
        .await
        .unwrap();

    let report = orchestrator
        .deploy(DomainType::Openvz, "web-ct", None, &WideCpuLimit)
        .await
        .unwrap();

    assert_eq!(report.adjustment_rounds, 1);
    let conf = VeConf::parse(&std::fs::read_to_string(dir.path().join("conf/102.conf")).unwrap());
    assert_eq!(conf.get("CPUS"), Some("2"));
    // 100 percent of each of the two CPUs
    assert_eq!(conf.get("CPULIMIT"), Some("200"));
}
