//! Environment constants and path utilities for the template repository.
//!
//! This module centralizes the on-disk layout of a template repository and
//! the configuration discovery paths, so every component builds paths the
//! same way.

use std::path::{Path, PathBuf};

/// Main application directory name (hidden directory like .git, .vscode)
pub const VMTPL_DIR_NAME: &str = ".vmtpl";

/// Configuration file name
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file name looked up in the current directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "vmtpl.toml";

/// System-wide configuration file
pub const SYSTEM_CONFIG_FILE_PATH: &str = "/etc/vmtpl/config.toml";

/// Default repository root
pub const DEFAULT_REPOSITORY_ROOT: &str = "/storage/local";

/// Template archive and descriptor naming
pub mod template {
    /// Archive extension
    pub const ARCHIVE_EXT: &str = "tar";

    /// Descriptor extension
    pub const DESCRIPTOR_EXT: &str = "ovf";

    /// Integrity sidecar suffix appended to the archive file name
    pub const SIDECAR_SUFFIX: &str = "pfff";

    /// Deploy staging subtree name inside a domain directory
    pub const DEPLOY_DIR_NAME: &str = "deploy";

    /// Capture scratch subtree name inside a domain directory
    pub const CAPTURE_DIR_NAME: &str = "capture";

    /// Stamp written into an unpacked tree recording the archive checksum
    pub const SOURCE_STAMP_FILE_NAME: &str = ".source-checksum";

    /// Remote catalog file served by each mirror per domain type
    pub const REMOTE_CATALOG_FILE_NAME: &str = "templatelist.txt";
}

/// Test-related constants
pub mod test {
    /// Template name used across fixtures
    pub const TEST_TEMPLATE_NAME: &str = "web";
}

/// Archive file name for a template
pub fn archive_file_name(template_name: &str) -> String {
    format!("{}.{}", template_name, template::ARCHIVE_EXT)
}

/// Descriptor file name for a template
pub fn descriptor_file_name(template_name: &str) -> String {
    format!("{}.{}", template_name, template::DESCRIPTOR_EXT)
}

/// Sidecar file name for a template
pub fn sidecar_file_name(template_name: &str) -> String {
    format!(
        "{}.{}",
        archive_file_name(template_name),
        template::SIDECAR_SUFFIX
    )
}

/// Build the directory holding finalized archives for one domain type
pub fn domain_dir_path(repository_root: &Path, domain: &str) -> PathBuf {
    repository_root.join(domain)
}

/// Build the archive path for a template
pub fn archive_path(repository_root: &Path, domain: &str, template_name: &str) -> PathBuf {
    domain_dir_path(repository_root, domain).join(archive_file_name(template_name))
}

/// Build the sidecar path for a template
pub fn sidecar_path(repository_root: &Path, domain: &str, template_name: &str) -> PathBuf {
    domain_dir_path(repository_root, domain).join(sidecar_file_name(template_name))
}

/// Build the deploy staging directory for a template
pub fn deploy_staging_path(repository_root: &Path, domain: &str, template_name: &str) -> PathBuf {
    domain_dir_path(repository_root, domain)
        .join(template::DEPLOY_DIR_NAME)
        .join(template_name)
}

/// Build the capture scratch directory for a template
pub fn capture_staging_path(repository_root: &Path, domain: &str, template_name: &str) -> PathBuf {
    domain_dir_path(repository_root, domain)
        .join(template::CAPTURE_DIR_NAME)
        .join(template_name)
}

/// Build config directory path in user's home directory
pub fn user_config_dir_path(home_dir: &Path) -> PathBuf {
    home_dir.join(VMTPL_DIR_NAME)
}

/// Build config file path in user's home directory
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    user_config_dir_path(home_dir).join(CONFIG_FILE_NAME)
}

/// Build local config file path in current directory
pub fn local_config_file_path(current_dir: &Path) -> PathBuf {
    current_dir.join(VMTPL_DIR_NAME).join(CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_file_names() {
        assert_eq!(archive_file_name("web"), "web.tar");
        assert_eq!(descriptor_file_name("web"), "web.ovf");
        assert_eq!(sidecar_file_name("web"), "web.tar.pfff");
    }

    #[test]
    fn test_repository_paths() {
        let root = Path::new("/storage/local");

        assert_eq!(
            archive_path(root, "kvm", "web"),
            Path::new("/storage/local/kvm/web.tar")
        );
        assert_eq!(
            sidecar_path(root, "openvz", "web"),
            Path::new("/storage/local/openvz/web.tar.pfff")
        );
        assert_eq!(
            deploy_staging_path(root, "kvm", "web"),
            Path::new("/storage/local/kvm/deploy/web")
        );
        assert_eq!(
            capture_staging_path(root, "kvm", "web"),
            Path::new("/storage/local/kvm/capture/web")
        );
    }

    #[test]
    fn test_config_paths() {
        let home_dir = Path::new("/home/user");
        let current_dir = Path::new("/current/project");

        assert_eq!(
            user_config_file_path(home_dir),
            Path::new("/home/user/.vmtpl/config.toml")
        );

        assert_eq!(
            local_config_file_path(current_dir),
            Path::new("/current/project/.vmtpl/config.toml")
        );
    }
}
