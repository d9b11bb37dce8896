//! # Integrity & Distribution Client
//!
//! Moves templates between a central repository (served over plain HTTP
//! from one of several mirrors) and the host's local cache.
//!
//! ## Components
//!
//! - **[`checksum`]**: XOR-fold integrity tokens and `.tar.pfff` sidecars
//! - **[`mirror`]**: operator-maintained mirror list and random selection
//! - **[`catalog`]**: local/remote/selected catalog diffing
//! - **[`transport`]**: [`Transport`] trait with HTTP and in-memory backends
//! - **[`client`]**: the fetch protocol (sidecar first, bounded retries,
//!   verified rename into place)
//!
//! ## Fetch protocol
//!
//! 1. Download the remote sidecar.
//! 2. If the local archive's checksum already matches, stop.
//! 3. Otherwise download the archive to a temporary file, recompute and
//!    compare.
//! 4. On mismatch delete the local archive and sidecar and retry from 1, up
//!    to the configured number of attempts (3 by default).

pub mod catalog;
pub mod checksum;
pub mod client;
pub mod mirror;
pub mod transport;

pub use catalog::CatalogDiff;
pub use checksum::{ChecksumMode, Checksummer};
pub use client::{DistributionClient, FetchOutcome};
pub use mirror::MirrorList;
pub use transport::{HttpTransport, MemoryTransport, Transport};

use crate::executor::ExecutorError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Distribution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// URL of the mirror list (one base URL per line)
    pub mirror_list_url: String,
    /// Download attempts per template before giving up
    pub retry_attempts: u32,
    /// Per-request HTTP timeout in seconds (0 disables it)
    pub http_timeout_secs: u64,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            mirror_list_url: "http://templates.example.org/mirrors.txt".to_string(),
            retry_attempts: 3,
            http_timeout_secs: 0,
        }
    }
}

/// Distribution errors
#[derive(Debug, thiserror::Error)]
pub enum DistributionError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Remote resource not found: {0}")]
    NotFound(String),

    #[error("Mirror list at {0} contains no mirrors")]
    NoMirrors(String),

    #[error("Invalid or empty checksum sidecar: {0}")]
    InvalidSidecar(PathBuf),

    #[error("Checksum mismatch for '{template}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        template: String,
        expected: String,
        actual: String,
    },

    #[error("Giving up on '{template}' after {attempts} attempts: {last}")]
    RetriesExhausted {
        template: String,
        attempts: u32,
        last: Box<DistributionError>,
    },

    #[error("Command error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DistributionError>;
