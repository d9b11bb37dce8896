//! Command line argument parsing
//!
//! This module handles CLI argument parsing with subcommands:
//! - `capture`: Turn a running instance into a template archive
//! - `deploy`: Create a new instance from a local template
//! - `list`: List local templates
//! - `fetch`: Download one template from a mirror
//! - `sync`: Make the local catalog match a selection
//! - `checksum`: Print the integrity token of a file
//! - `verify`: Check an archive against its sidecar
//! - `show-config`: Show configuration discovery information

use crate::descriptor::DomainType;
use crate::orchestrator::Overrides;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, PartialEq)]
pub enum ExecutionMode {
    Capture(CaptureConfig),
    Deploy(DeployConfig),
    List { domain: DomainType, long: bool },
    Fetch { domain: DomainType, name: String },
    Sync { domain: DomainType, selected: Vec<String> },
    Checksum { file: PathBuf },
    Verify { archive: PathBuf },
    ShowConfig { init: bool },
}

#[derive(Debug, PartialEq)]
pub struct CaptureConfig {
    pub domain: DomainType,
    pub source: String,
    pub template_name: String,
    pub overrides: Overrides,
}

#[derive(Debug, PartialEq)]
pub struct DeployConfig {
    pub domain: DomainType,
    pub template_name: String,
    pub target: Option<String>,
    pub overrides: Overrides,
    pub no_start: bool,
}

#[derive(Debug, Parser)]
#[command(name = "vmtpl")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Capture, distribute and deploy KVM and OpenVZ instance templates")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    /// Configuration file path (skips discovery)
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Resource and identity values applied before validation
#[derive(Debug, Clone, Default, clap::Args)]
pub struct OverrideArgs {
    /// Memory in GB
    #[arg(long)]
    pub memory: Option<f64>,

    /// Number of virtual CPUs
    #[arg(long)]
    pub vcpu: Option<u32>,

    /// Disk in GB
    #[arg(long)]
    pub disk: Option<f64>,

    /// CPU usage limit per CPU in percent (OpenVZ)
    #[arg(long = "cpu-limit")]
    pub cpu_limit: Option<u32>,

    /// Hostname (OpenVZ)
    #[arg(long)]
    pub hostname: Option<String>,

    /// IP address (OpenVZ)
    #[arg(long = "ip")]
    pub ip_address: Option<String>,

    /// Nameserver (OpenVZ)
    #[arg(long)]
    pub nameserver: Option<String>,
}

impl From<&OverrideArgs> for Overrides {
    fn from(args: &OverrideArgs) -> Self {
        Overrides {
            memory: args.memory,
            vcpu: args.vcpu,
            disk: args.disk,
            vcpu_limit: args.cpu_limit,
            hostname: args.hostname.clone(),
            ip_address: args.ip_address.clone(),
            nameserver: args.nameserver.clone(),
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Capture a running instance as a new template
    Capture {
        /// Hypervisor type (kvm or openvz)
        #[arg(short = 'd', long = "domain", default_value = "kvm", value_parser = parse_domain)]
        domain: DomainType,
        /// Source instance (domain name or container ID)
        source: String,
        /// Name of the new template
        name: String,
        #[command(flatten)]
        overrides: OverrideArgs,
    },
    /// Deploy a local template as a new instance
    Deploy {
        #[arg(short = 'd', long = "domain", default_value = "kvm", value_parser = parse_domain)]
        domain: DomainType,
        /// Template name
        name: String,
        /// New instance name or container ID (OpenVZ allocates one if omitted)
        #[arg(short = 't', long = "target")]
        target: Option<String>,
        /// Leave the instance defined but stopped
        #[arg(long = "no-start")]
        no_start: bool,
        #[command(flatten)]
        overrides: OverrideArgs,
    },
    /// List local templates
    List {
        #[arg(short = 'd', long = "domain", default_value = "kvm", value_parser = parse_domain)]
        domain: DomainType,
        /// Show size, modification time and checksum
        #[arg(short = 'l', long = "long")]
        long: bool,
    },
    /// Download one template from a mirror
    Fetch {
        #[arg(short = 'd', long = "domain", default_value = "kvm", value_parser = parse_domain)]
        domain: DomainType,
        name: String,
    },
    /// Download the selected templates and delete every other local one
    Sync {
        #[arg(short = 'd', long = "domain", default_value = "kvm", value_parser = parse_domain)]
        domain: DomainType,
        /// Templates to keep
        names: Vec<String>,
    },
    /// Print the integrity token of a file
    Checksum { file: PathBuf },
    /// Check an archive against its sidecar
    Verify { archive: PathBuf },
    /// Show configuration discovery information
    ShowConfig {
        /// Write a default user configuration file
        #[arg(long)]
        init: bool,
    },
}

fn parse_domain(raw: &str) -> Result<DomainType, String> {
    raw.parse::<DomainType>().map_err(|e| e.to_string())
}

impl Args {
    pub fn mode(&self) -> Result<ExecutionMode, String> {
        match &self.command {
            Some(Commands::Capture {
                domain,
                source,
                name,
                overrides,
            }) => Ok(ExecutionMode::Capture(CaptureConfig {
                domain: *domain,
                source: source.clone(),
                template_name: name.clone(),
                overrides: overrides.into(),
            })),
            Some(Commands::Deploy {
                domain,
                name,
                target,
                no_start,
                overrides,
            }) => Ok(ExecutionMode::Deploy(DeployConfig {
                domain: *domain,
                template_name: name.clone(),
                target: target.clone(),
                overrides: overrides.into(),
                no_start: *no_start,
            })),
            Some(Commands::List { domain, long }) => Ok(ExecutionMode::List {
                domain: *domain,
                long: *long,
            }),
            Some(Commands::Fetch { domain, name }) => Ok(ExecutionMode::Fetch {
                domain: *domain,
                name: name.clone(),
            }),
            Some(Commands::Sync { domain, names }) => Ok(ExecutionMode::Sync {
                domain: *domain,
                selected: names.clone(),
            }),
            Some(Commands::Checksum { file }) => {
                Ok(ExecutionMode::Checksum { file: file.clone() })
            }
            Some(Commands::Verify { archive }) => Ok(ExecutionMode::Verify {
                archive: archive.clone(),
            }),
            Some(Commands::ShowConfig { init }) => Ok(ExecutionMode::ShowConfig { init: *init }),
            None => {
                Err("No command specified. Use 'vmtpl --help' to see available commands.".to_string())
            }
        }
    }
}
