//! Archive integrity tokens.
//!
//! The native token is a rolling XOR-fold: the content is read as
//! little-endian 64-bit words (the tail zero-padded), each word is folded
//! into an accumulator rotated left by one bit, and the total length is
//! XORed in at the end. The token is the accumulator as 16 lowercase hex
//! digits.
//!
//! This detects truncated or corrupted transfers, not deliberate tampering.
//! Sites with sidecars produced by an external tool can select
//! [`ChecksumMode::External`] to run that tool instead.

use super::{DistributionError, Result};
use crate::env;
use crate::executor::{CommandExecutor, ExecutionCommand};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Streaming XOR-fold state
#[derive(Debug, Clone, Default)]
pub struct XorFold {
    acc: u64,
    len: u64,
    pending: [u8; 8],
    pending_len: usize,
}

impl XorFold {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, mut bytes: &[u8]) {
        self.len = self.len.wrapping_add(bytes.len() as u64);

        if self.pending_len > 0 {
            let take = (8 - self.pending_len).min(bytes.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&bytes[..take]);
            self.pending_len += take;
            bytes = &bytes[take..];
            if self.pending_len < 8 {
                return;
            }
            self.fold(self.pending);
            self.pending_len = 0;
        }

        let mut chunks = bytes.chunks_exact(8);
        for chunk in &mut chunks {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            self.fold(word);
        }

        let rest = chunks.remainder();
        self.pending[..rest.len()].copy_from_slice(rest);
        self.pending_len = rest.len();
    }

    fn fold(&mut self, word: [u8; 8]) {
        self.acc = self.acc.rotate_left(1) ^ u64::from_le_bytes(word);
    }

    pub fn finish(mut self) -> u64 {
        if self.pending_len > 0 {
            let mut word = [0u8; 8];
            word[..self.pending_len].copy_from_slice(&self.pending[..self.pending_len]);
            self.fold(word);
        }
        self.acc ^ self.len
    }

    /// Hex token of the folded value
    pub fn finish_token(self) -> String {
        format!("{:016x}", self.finish())
    }
}

/// Token for an in-memory byte string
pub fn checksum(bytes: &[u8]) -> String {
    let mut fold = XorFold::new();
    fold.update(bytes);
    fold.finish_token()
}

/// Whether `bytes` produce `token`
pub fn verify(bytes: &[u8], token: &str) -> bool {
    checksum(bytes) == token.trim()
}

/// How archive tokens are produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ChecksumMode {
    /// Built-in XOR-fold
    #[default]
    Native,
    /// External tool invoked as `<tool> <archive>`, token on stdout
    External { tool: String },
}

/// Computes, writes and verifies archive tokens
#[derive(Clone)]
pub struct Checksummer {
    mode: ChecksumMode,
    executor: Option<Arc<dyn CommandExecutor>>,
}

impl std::fmt::Debug for Checksummer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checksummer").field("mode", &self.mode).finish()
    }
}

impl Checksummer {
    pub fn native() -> Self {
        Self {
            mode: ChecksumMode::Native,
            executor: None,
        }
    }

    pub fn external(tool: impl Into<String>, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            mode: ChecksumMode::External { tool: tool.into() },
            executor: Some(executor),
        }
    }

    /// Build from a configured mode; external mode runs through `executor`
    pub fn from_mode(mode: &ChecksumMode, executor: Arc<dyn CommandExecutor>) -> Self {
        match mode {
            ChecksumMode::Native => Self::native(),
            ChecksumMode::External { tool } => Self::external(tool.clone(), executor),
        }
    }

    pub fn mode(&self) -> &ChecksumMode {
        &self.mode
    }

    /// Token of a file's content
    pub async fn checksum_file(&self, path: &Path) -> Result<String> {
        let token = match (&self.mode, &self.executor) {
            (ChecksumMode::External { tool }, Some(executor)) => {
                let command =
                    ExecutionCommand::new(tool, vec![path.to_string_lossy().into_owned()]);
                let result = executor.run(command).await?;
                result.stdout.trim().to_string()
            }
            _ => {
                let path = path.to_path_buf();
                tokio::task::spawn_blocking(move || native_file_token(&path))
                    .await
                    .map_err(|e| DistributionError::Task(e.to_string()))??
            }
        };
        if token.is_empty() {
            return Err(DistributionError::InvalidSidecar(path.to_path_buf()));
        }
        debug!("Checksum of {}: {}", path.display(), token);
        Ok(token)
    }

    /// Compute the token of `archive` and write it to its sidecar
    pub async fn write_sidecar(&self, archive: &Path) -> Result<String> {
        let token = self.checksum_file(archive).await?;
        tokio::fs::write(sidecar_for(archive), format!("{}\n", token)).await?;
        Ok(token)
    }

    /// Whether `archive` matches the token stored in its sidecar
    pub async fn verify_file(&self, archive: &Path) -> Result<bool> {
        let expected = read_sidecar(&sidecar_for(archive)).await?;
        let actual = self.checksum_file(archive).await?;
        Ok(actual == expected)
    }
}

fn native_file_token(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut fold = XorFold::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        fold.update(&buffer[..read]);
    }
    Ok(fold.finish_token())
}

/// Sidecar path of an archive: `<archive>.pfff`
pub fn sidecar_for(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_os_string();
    name.push(".");
    name.push(env::template::SIDECAR_SUFFIX);
    PathBuf::from(name)
}

/// Token stored in a sidecar file
pub async fn read_sidecar(path: &Path) -> Result<String> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_sidecar(&content).ok_or_else(|| DistributionError::InvalidSidecar(path.to_path_buf()))
}

/// First whitespace-delimited token of sidecar content
pub fn parse_sidecar(content: &str) -> Option<String> {
    content.split_whitespace().next().map(str::to_string)
}
