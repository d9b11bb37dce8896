//! # Archive Manager
//!
//! Packages a template's descriptor and payload files into a single
//! `<name>.tar` and unpacks one back into a staging directory.
//!
//! Both directions write to a temporary sibling first and rename into place
//! only on success, so a failure never leaves a partial tree or archive at
//! the canonical path.
//!
//! ## Unpack reuse
//!
//! A staging tree carries a `.source-checksum` stamp holding the checksum of
//! the archive it was extracted from. [`unpack`] reuses the tree only when
//! the stamp matches the checksum of the archive being unpacked; any other
//! state (no stamp, different stamp, missing tree) is cleared and extracted
//! again.

use crate::env;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::Builder as TempBuilder;
use tracing::{debug, info};

/// Archive packing and extraction errors
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Archive already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("Duplicate archive entry '{0}'")]
    DuplicateEntry(String),

    #[error("Invalid archive entry '{entry}': {reason}")]
    InvalidEntry { entry: String, reason: String },

    #[error("Payload file missing: {0}")]
    MissingPayload(PathBuf),

    #[error("Archive not found: {0}")]
    NotFound(PathBuf),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

/// What [`unpack`] did with the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpackOutcome {
    /// Destination already held this archive's content
    Reused,
    /// Destination was (re)extracted
    Extracted,
}

/// Pack `descriptor_file` and `payload_paths` (relative to `staging_dir`)
/// into `<dest_dir>/<template_name>.tar`.
///
/// Entry names are checked before anything is written. The archive is
/// built under a temporary name in `dest_dir` and renamed on success; an
/// existing archive is never replaced.
pub fn pack(
    template_name: &str,
    staging_dir: &Path,
    descriptor_file: &str,
    payload_paths: &[String],
    dest_dir: &Path,
) -> Result<PathBuf> {
    let archive_path = dest_dir.join(env::archive_file_name(template_name));
    if archive_path.exists() {
        return Err(ArchiveError::AlreadyExists(archive_path));
    }

    let entries = plan_entries(descriptor_file, payload_paths)?;
    for entry in &entries {
        let source = staging_dir.join(entry);
        if !source.exists() {
            return Err(ArchiveError::MissingPayload(source));
        }
    }

    fs::create_dir_all(dest_dir)?;
    let temp = TempBuilder::new()
        .prefix(&format!(".{}.", template_name))
        .suffix(".tar.partial")
        .tempfile_in(dest_dir)?;

    {
        let mut builder = tar::Builder::new(BufWriter::new(temp.as_file()));
        builder.follow_symlinks(false);
        for entry in &entries {
            let source = staging_dir.join(entry);
            if source.is_dir() {
                builder.append_dir_all(entry, &source)?;
            } else {
                builder.append_path_with_name(&source, entry)?;
            }
            debug!("Packed {}", entry);
        }
        let mut writer = builder.into_inner()?;
        writer.flush()?;
    }
    temp.as_file().sync_all()?;

    temp.persist_noclobber(&archive_path).map_err(|e| {
        if e.error.kind() == io::ErrorKind::AlreadyExists {
            ArchiveError::AlreadyExists(archive_path.clone())
        } else {
            ArchiveError::IoError(e.error)
        }
    })?;

    info!(
        "Packed template '{}' ({} entries) into {}",
        template_name,
        entries.len(),
        archive_path.display()
    );
    Ok(archive_path)
}

/// Validate and normalize archive entry names, descriptor first
fn plan_entries(descriptor_file: &str, payload_paths: &[String]) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(payload_paths.len() + 1);

    for raw in std::iter::once(descriptor_file).chain(payload_paths.iter().map(String::as_str)) {
        let entry = normalize_entry(raw)?;
        if !seen.insert(entry.clone()) {
            return Err(ArchiveError::DuplicateEntry(entry));
        }
        entries.push(entry);
    }
    Ok(entries)
}

/// Relative, `/`-joined form of `raw`, refusing absolute paths, `..`
/// components and the reserved stamp name
pub(crate) fn normalize_entry(raw: &str) -> Result<String> {
    let invalid = |reason: &str| ArchiveError::InvalidEntry {
        entry: raw.to_string(),
        reason: reason.to_string(),
    };

    let mut parts = Vec::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => return Err(invalid("parent directory references")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid("absolute paths"));
            }
        }
    }
    if parts.is_empty() {
        return Err(invalid("empty path"));
    }
    if parts[0] == env::template::SOURCE_STAMP_FILE_NAME {
        return Err(invalid("reserved name"));
    }
    Ok(parts.join("/"))
}

/// Entry names of an archive, in archive order
pub fn list_entries(archive_path: &Path) -> Result<Vec<String>> {
    let file = open_archive(archive_path)?;
    let mut archive = tar::Archive::new(file);
    let mut names = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        let path = entry.path()?.to_string_lossy().trim_end_matches('/').to_string();
        names.push(path);
    }
    Ok(names)
}

/// Extract `archive_path` into `dest_dir`, reusing an existing tree whose
/// stamp equals `source_checksum`.
pub fn unpack(archive_path: &Path, dest_dir: &Path, source_checksum: &str) -> Result<UnpackOutcome> {
    let file = open_archive(archive_path)?;

    if stamp_matches(dest_dir, source_checksum) {
        info!(
            "Reusing unpacked tree {} (checksum {})",
            dest_dir.display(),
            source_checksum
        );
        return Ok(UnpackOutcome::Reused);
    }

    let parent = dest_dir.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let temp = TempBuilder::new().prefix(".unpack.").tempdir_in(parent)?;

    let mut archive = tar::Archive::new(file);
    archive.set_preserve_permissions(true);
    archive.unpack(temp.path())?;
    fs::write(
        temp.path().join(env::template::SOURCE_STAMP_FILE_NAME),
        source_checksum,
    )?;

    if dest_dir.exists() {
        debug!("Clearing stale tree {}", dest_dir.display());
        fs::remove_dir_all(dest_dir)?;
    }
    let extracted = temp.keep();
    if let Err(e) = fs::rename(&extracted, dest_dir) {
        let _ = fs::remove_dir_all(&extracted);
        return Err(e.into());
    }

    info!(
        "Unpacked {} into {}",
        archive_path.display(),
        dest_dir.display()
    );
    Ok(UnpackOutcome::Extracted)
}

fn open_archive(archive_path: &Path) -> Result<File> {
    File::open(archive_path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ArchiveError::NotFound(archive_path.to_path_buf()),
        _ => ArchiveError::IoError(e),
    })
}

fn stamp_matches(dest_dir: &Path, source_checksum: &str) -> bool {
    fs::read_to_string(dest_dir.join(env::template::SOURCE_STAMP_FILE_NAME))
        .map(|stamp| stamp.trim() == source_checksum)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn staging(dir: &Path) -> PathBuf {
        let staging = dir.join("staging");
        fs::create_dir_all(staging.join("disks")).unwrap();
        fs::write(staging.join("web.ovf"), "<Envelope/>").unwrap();
        fs::write(staging.join("disks/vda.qcow2"), vec![7u8; 4096]).unwrap();
        fs::write(staging.join("vdb.img"), b"second disk").unwrap();
        staging
    }

    fn payload() -> Vec<String> {
        vec!["disks/vda.qcow2".to_string(), "vdb.img".to_string()]
    }

    #[test]
    fn test_pack_unpack_roundtrip_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let staging = staging(dir.path());
        let repo = dir.path().join("repo");

        let archive = pack("web", &staging, "web.ovf", &payload(), &repo).unwrap();
        assert_eq!(archive, repo.join("web.tar"));
        assert_eq!(
            list_entries(&archive).unwrap(),
            vec!["web.ovf", "disks/vda.qcow2", "vdb.img"]
        );

        let dest = dir.path().join("deploy/web");
        let outcome = unpack(&archive, &dest, "abc").unwrap();
        assert_eq!(outcome, UnpackOutcome::Extracted);

        for entry in ["web.ovf", "disks/vda.qcow2", "vdb.img"] {
            assert_eq!(
                fs::read(staging.join(entry)).unwrap(),
                fs::read(dest.join(entry)).unwrap()
            );
        }
    }

    #[test]
    fn test_pack_rejects_duplicates_before_writing() {
        let dir = TempDir::new().unwrap();
        let staging = staging(dir.path());
        let repo = dir.path().join("repo");

        let payload = vec!["vdb.img".to_string(), "./vdb.img".to_string()];
        let err = pack("web", &staging, "web.ovf", &payload, &repo).unwrap_err();

        assert!(matches!(err, ArchiveError::DuplicateEntry(ref e) if e == "vdb.img"));
        assert!(!repo.exists());
    }

    #[test]
    fn test_pack_rejects_escaping_entries() {
        let dir = TempDir::new().unwrap();
        let staging = staging(dir.path());

        for bad in ["../etc/passwd", "/etc/passwd", ".source-checksum"] {
            let err = pack("web", &staging, "web.ovf", &[bad.to_string()], dir.path()).unwrap_err();
            assert!(matches!(err, ArchiveError::InvalidEntry { .. }), "{bad}");
        }
    }

    #[test]
    fn test_pack_never_replaces_existing_archive() {
        let dir = TempDir::new().unwrap();
        let staging = staging(dir.path());
        let repo = dir.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        fs::write(repo.join("web.tar"), b"original").unwrap();

        let err = pack("web", &staging, "web.ovf", &payload(), &repo).unwrap_err();
        assert!(matches!(err, ArchiveError::AlreadyExists(_)));
        assert_eq!(fs::read(repo.join("web.tar")).unwrap(), b"original");
    }

    #[test]
    fn test_pack_missing_payload_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let staging = staging(dir.path());
        let repo = dir.path().join("repo");
        fs::create_dir_all(&repo).unwrap();

        let err = pack("web", &staging, "web.ovf", &["nope.img".to_string()], &repo).unwrap_err();
        assert!(matches!(err, ArchiveError::MissingPayload(_)));
        assert_eq!(fs::read_dir(&repo).unwrap().count(), 0);
    }

    #[test]
    fn test_unpack_reuses_tree_only_for_matching_stamp() {
        let dir = TempDir::new().unwrap();
        let staging = staging(dir.path());
        let archive = pack("web", &staging, "web.ovf", &payload(), dir.path()).unwrap();
        let dest = dir.path().join("deploy/web");

        assert_eq!(unpack(&archive, &dest, "aaaa").unwrap(), UnpackOutcome::Extracted);
        fs::write(dest.join("scratch"), b"left by a previous deploy").unwrap();

        assert_eq!(unpack(&archive, &dest, "aaaa").unwrap(), UnpackOutcome::Reused);
        assert!(dest.join("scratch").exists());

        assert_eq!(unpack(&archive, &dest, "bbbb").unwrap(), UnpackOutcome::Extracted);
        assert!(!dest.join("scratch").exists());
        assert_eq!(
            fs::read_to_string(dest.join(".source-checksum")).unwrap(),
            "bbbb"
        );
    }

    #[test]
    fn test_unpack_missing_archive() {
        let dir = TempDir::new().unwrap();
        let err = unpack(&dir.path().join("none.tar"), &dir.path().join("out"), "x").unwrap_err();
        assert!(matches!(err, ArchiveError::NotFound(_)));
        assert!(!dir.path().join("out").exists());
    }
}
