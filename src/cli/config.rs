//! Configuration discovery and loading
//!
//! This module handles the configuration discovery hierarchy:
//! 1. Current directory: ./vmtpl.toml or ./.vmtpl/config.toml
//! 2. User config: ~/.vmtpl/config.toml
//! 3. System config: /etc/vmtpl/config.toml
//! 4. Built-in defaults

use crate::distribution::{ChecksumMode, DistributionConfig};
use crate::env;
use crate::hypervisor::kvm::KvmConfig;
use crate::hypervisor::openvz::OpenvzConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::repository::RepositoryConfig;
use serde::{Deserialize, Serialize};
use std::env as std_env;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not determine home directory")]
    NoHomeDir,
}

/// Every setting the pipelines read, one section per component
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub repository: RepositoryConfig,
    pub kvm: KvmConfig,
    pub openvz: OpenvzConfig,
    pub distribution: DistributionConfig,
    pub checksum: ChecksumMode,
    pub orchestrator: OrchestratorConfig,
}

impl PipelineConfig {
    /// Load from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save to TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

/// Configuration discovery system
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Load `explicit` if given, else the first file in the hierarchy, else
    /// defaults. Returns the file actually used.
    pub fn load(explicit: Option<&Path>) -> Result<(PipelineConfig, Option<PathBuf>), ConfigError> {
        if let Some(path) = explicit {
            info!("Loading configuration override from: {:?}", path);
            return Ok((PipelineConfig::from_toml_file(path)?, Some(path.to_path_buf())));
        }
        match Self::find_config_file() {
            Some(path) => {
                info!("Loading configuration from: {:?}", path);
                Ok((PipelineConfig::from_toml_file(&path)?, Some(path)))
            }
            None => {
                info!("No configuration file found, using defaults");
                Ok((PipelineConfig::default(), None))
            }
        }
    }

    /// Find configuration file using discovery hierarchy
    pub fn find_config_file() -> Option<PathBuf> {
        Self::first_existing(&Self::get_config_candidates())
    }

    fn first_existing(candidates: &[PathBuf]) -> Option<PathBuf> {
        for candidate in candidates {
            debug!("Checking for config file: {:?}", candidate);
            if candidate.is_file() {
                debug!("Found config file: {:?}", candidate);
                return Some(candidate.clone());
            }
        }

        debug!("No config file found in discovery hierarchy");
        None
    }

    /// Get list of configuration file candidates in priority order
    fn get_config_candidates() -> Vec<PathBuf> {
        let current_dir = std_env::current_dir().ok();
        let home_dir = Self::get_home_dir();
        Self::candidates_for(current_dir.as_deref(), home_dir.as_deref())
    }

    fn candidates_for(current_dir: Option<&Path>, home_dir: Option<&Path>) -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Some(current_dir) = current_dir {
            candidates.push(current_dir.join(env::LOCAL_CONFIG_FILE_NAME));
            candidates.push(env::local_config_file_path(current_dir));
        }

        if let Some(home_dir) = home_dir {
            candidates.push(env::user_config_file_path(home_dir));
        }

        candidates.push(PathBuf::from(env::SYSTEM_CONFIG_FILE_PATH));
        candidates
    }

    /// Get home directory path
    fn get_home_dir() -> Option<PathBuf> {
        std_env::var("HOME").ok().map(PathBuf::from)
    }

    /// Write the default configuration to the user's config file unless
    /// one exists already
    pub fn create_default_user_config() -> Result<PathBuf, ConfigError> {
        let home_dir = Self::get_home_dir().ok_or(ConfigError::NoHomeDir)?;

        let config_dir = env::user_config_dir_path(&home_dir);
        let config_path = env::user_config_file_path(&home_dir);

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)?;
            info!("Created configuration directory: {:?}", config_dir);
        }

        if !config_path.exists() {
            PipelineConfig::default().to_toml_file(&config_path)?;
            info!("Created default configuration file: {:?}", config_path);
        } else {
            warn!("Configuration file already exists: {:?}", config_path);
        }

        Ok(config_path)
    }

    /// Describe the discovery hierarchy and which file is active
    pub fn discovery_info() -> String {
        Self::describe(&Self::get_config_candidates())
    }

    fn describe(candidates: &[PathBuf]) -> String {
        let mut out = String::from("Configuration Discovery Hierarchy:\n\n");
        for (i, candidate) in candidates.iter().enumerate() {
            let status = if candidate.exists() {
                if candidate.is_file() {
                    "✓ EXISTS"
                } else {
                    "✗ NOT A FILE"
                }
            } else {
                "✗ NOT FOUND"
            };
            let _ = writeln!(out, "  {}. {:?} - {}", i + 1, candidate, status);
        }

        out.push('\n');
        match Self::first_existing(candidates) {
            Some(found) => {
                let _ = writeln!(out, "Active configuration: {:?}", found);
            }
            None => out.push_str("Active configuration: Built-in defaults\n"),
        }
        out
    }
}
