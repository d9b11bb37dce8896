//! # Template Descriptor
//!
//! The neutral, hypervisor-independent record passed between every pipeline
//! component: resource bounds, disks, interfaces, feature flags and the
//! domain-specific settings of a template.
//!
//! A [`Descriptor`] is created with hypervisor defaults, filled either from a
//! running instance (capture) or from an unpacked `.ovf` file (deploy),
//! adjusted by operator overrides and the reconciler, then consumed once to
//! generate native configuration.

pub mod ovf;
pub mod types;

#[cfg(test)]
mod tests;

pub use ovf::{from_ovf_str, read_ovf, to_ovf_string, write_ovf};
pub use types::*;

/// Descriptor parsing and encoding errors
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    /// Malformed descriptor XML
    #[error("Descriptor XML error: {0}")]
    Decode(#[from] quick_xml::DeError),

    /// Descriptor could not be rendered
    #[error("Descriptor encoding error: {0}")]
    Encode(String),

    /// Descriptor is well-formed but semantically invalid
    #[error("Invalid descriptor: {0}")]
    Invalid(String),

    /// Unknown domain type name
    #[error("Unknown domain type: {0}")]
    UnknownDomainType(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for descriptor operations.
pub type Result<T> = std::result::Result<T, DescriptorError>;
