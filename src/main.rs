use anyhow::{Context, Result, bail};
use clap::Parser;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use vmtpl::cli::{
    Args, ConfigDiscovery, ExecutionMode, PipelineConfig, build_orchestrator, missing_tools,
};
use vmtpl::distribution::Checksummer;
use vmtpl::executor::{CommandExecutor, HostExecutor};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "vmtpl=debug" } else { "vmtpl=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => bail!(e),
    };

    if let ExecutionMode::ShowConfig { init } = mode {
        if init {
            let path = ConfigDiscovery::create_default_user_config()?;
            println!("Default configuration at {}", path.display());
        }
        print!("{}", ConfigDiscovery::discovery_info());
        return Ok(());
    }

    let (mut config, source) = ConfigDiscovery::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    match &source {
        Some(path) => debug!("Using configuration {}", path.display()),
        None => debug!("Using built-in configuration"),
    }

    let executor: Arc<dyn CommandExecutor> = Arc::new(HostExecutor::new());
    run(mode, &mut config, executor).await
}

async fn run(
    mode: ExecutionMode,
    config: &mut PipelineConfig,
    executor: Arc<dyn CommandExecutor>,
) -> Result<()> {
    match mode {
        ExecutionMode::Capture(request) => {
            missing_tools(request.domain);
            let orchestrator = build_orchestrator(config, executor)?;
            let report = orchestrator
                .capture(
                    request.domain,
                    &request.source,
                    &request.template_name,
                    &request.overrides,
                )
                .await?;
            info!("Capture visited {} states", report.states.len());
            println!(
                "{}",
                orchestrator
                    .repository()
                    .archive_path(request.domain, &report.template_name)
                    .display()
            );
        }
        ExecutionMode::Deploy(request) => {
            if request.no_start {
                config.orchestrator.start_after_deploy = false;
            }
            missing_tools(request.domain);
            let orchestrator = build_orchestrator(config, executor)?;
            let report = orchestrator
                .deploy(
                    request.domain,
                    &request.template_name,
                    request.target.as_deref(),
                    &request.overrides,
                )
                .await?;
            if let Some(instance) = report.instance {
                println!("{}", instance);
            }
        }
        ExecutionMode::List { domain, long } => {
            let orchestrator = build_orchestrator(config, executor)?;
            for name in orchestrator.list_local_templates(domain).await? {
                if long {
                    let info = orchestrator
                        .repository()
                        .template_info(domain, &name)
                        .await
                        .with_context(|| format!("Failed to inspect '{}'", name))?;
                    println!(
                        "{:<24} {:>12} {} {}",
                        info.name,
                        info.size_bytes,
                        info.modified.format("%Y-%m-%d %H:%M"),
                        info.checksum.as_deref().unwrap_or("-")
                    );
                } else {
                    println!("{}", name);
                }
            }
        }
        ExecutionMode::Fetch { domain, name } => {
            let orchestrator = build_orchestrator(config, executor)?;
            let outcome = orchestrator.fetch(domain, &name, &print_progress).await?;
            eprintln!();
            println!("{}", outcome.archive().display());
        }
        ExecutionMode::Sync { domain, selected } => {
            let orchestrator = build_orchestrator(config, executor)?;
            let report = orchestrator.sync(domain, &selected, &print_progress).await?;
            eprintln!();
            println!("mirror      {}", report.mirror);
            println!("downloaded  {}", report.downloaded.join(" "));
            println!("up to date  {}", report.up_to_date.join(" "));
            println!("deleted     {}", report.deleted.join(" "));
            if !report.unavailable.is_empty() {
                println!("unavailable {}", report.unavailable.join(" "));
            }
        }
        ExecutionMode::Checksum { file } => {
            let checksummer = Checksummer::from_mode(&config.checksum, executor);
            println!("{}", checksummer.checksum_file(&file).await?);
        }
        ExecutionMode::Verify { archive } => {
            let checksummer = Checksummer::from_mode(&config.checksum, executor);
            if !checksummer.verify_file(&archive).await? {
                bail!("{} does not match its sidecar", archive.display());
            }
            println!("{}: OK", archive.display());
        }
        ExecutionMode::ShowConfig { .. } => print!("{}", ConfigDiscovery::discovery_info()),
    }
    Ok(())
}

fn print_progress(downloaded: u64, total: Option<u64>) {
    let mut stderr = std::io::stderr();
    let _ = match total {
        Some(total) if total > 0 => write!(
            stderr,
            "\r{:>3}% {}/{} bytes",
            downloaded * 100 / total,
            downloaded,
            total
        ),
        _ => write!(stderr, "\r{} bytes", downloaded),
    };
    let _ = stderr.flush();
}
