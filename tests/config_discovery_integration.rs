use clap::Parser;
use serial_test::serial;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use vmtpl::cli::{Args, ConfigDiscovery, ExecutionMode, PipelineConfig};
use vmtpl::distribution::ChecksumMode;

/// Run `f` with the process working directory set to `dir`
fn in_dir<T>(dir: &Path, f: impl FnOnce() -> T) -> T {
    let previous = std::env::current_dir().unwrap();
    std::env::set_current_dir(dir).unwrap();
    let result = f();
    std::env::set_current_dir(previous).unwrap();
    result
}

#[test]
#[serial]
fn test_local_file_is_discovered_first() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("vmtpl.toml"),
        "[repository]\nroot = \"/srv/vmtpl\"\n\n[checksum]\nmode = \"external\"\ntool = \"pfff\"\n",
    )
    .unwrap();
    std::fs::create_dir_all(dir.path().join(".vmtpl")).unwrap();
    std::fs::write(
        dir.path().join(".vmtpl/config.toml"),
        "[repository]\nroot = \"/ignored\"\n",
    )
    .unwrap();

    let (config, used) = in_dir(dir.path(), || ConfigDiscovery::load(None)).unwrap();

    assert_eq!(used.as_deref().and_then(Path::file_name).unwrap(), "vmtpl.toml");
    assert_eq!(config.repository.root, PathBuf::from("/srv/vmtpl"));
    assert_eq!(
        config.checksum,
        ChecksumMode::External {
            tool: "pfff".to_string()
        }
    );
}

#[test]
#[serial]
fn test_hidden_directory_config_is_discovered() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join(".vmtpl")).unwrap();
    std::fs::write(
        dir.path().join(".vmtpl/config.toml"),
        "[distribution]\nretry_attempts = 5\n",
    )
    .unwrap();

    let found = in_dir(dir.path(), ConfigDiscovery::find_config_file).unwrap();
    assert!(found.ends_with(".vmtpl/config.toml"));

    let info = in_dir(dir.path(), ConfigDiscovery::discovery_info);
    assert!(info.contains("Configuration Discovery Hierarchy"));
    assert!(info.contains("config.toml"));
}

#[test]
fn test_written_default_config_loads_back() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    PipelineConfig::default().to_toml_file(&path).unwrap();

    let (config, used) = ConfigDiscovery::load(Some(&path)).unwrap();
    assert_eq!(config, PipelineConfig::default());
    assert_eq!(used, Some(path));
}

#[test]
fn test_cli_config_flag_reaches_discovery() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("site.toml");
    std::fs::write(&path, "[orchestrator]\nmax_adjustment_rounds = 1\n").unwrap();

    let args = Args::try_parse_from([
        "vmtpl",
        "--config",
        path.to_str().unwrap(),
        "list",
        "--domain",
        "openvz",
    ])
    .unwrap();
    assert!(matches!(args.mode().unwrap(), ExecutionMode::List { .. }));

    let (config, _) = ConfigDiscovery::load(args.config.as_deref()).unwrap();
    assert_eq!(config.orchestrator.max_adjustment_rounds, 1);
}
