//! Catalog diffing between the local cache, the remote repository and the
//! operator's selection.
//!
//! The selection always wins: selected templates available remotely are
//! downloaded, and local templates that are not selected are deleted, even
//! when they still exist remotely.

use crate::descriptor::validate_template_name;
use std::collections::BTreeSet;
use tracing::warn;

/// Work derived from comparing catalogs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogDiff {
    /// `selected ∩ remote`
    pub download: BTreeSet<String>,
    /// `local \ selected`
    pub delete: BTreeSet<String>,
    /// Selected names the remote does not offer
    pub unavailable: BTreeSet<String>,
}

impl CatalogDiff {
    pub fn compute<'a, L, R, S>(local: L, remote: R, selected: S) -> Self
    where
        L: IntoIterator<Item = &'a String>,
        R: IntoIterator<Item = &'a String>,
        S: IntoIterator<Item = &'a String>,
    {
        let local: BTreeSet<&String> = local.into_iter().collect();
        let remote: BTreeSet<&String> = remote.into_iter().collect();
        let selected: BTreeSet<&String> = selected.into_iter().collect();

        Self {
            download: selected.intersection(&remote).map(|s| (*s).clone()).collect(),
            delete: local.difference(&selected).map(|s| (*s).clone()).collect(),
            unavailable: selected.difference(&remote).map(|s| (*s).clone()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.download.is_empty() && self.delete.is_empty()
    }
}

/// Template names from a remote `templatelist.txt`, one per line
pub fn parse_remote_catalog(text: &str) -> Vec<String> {
    let mut names = BTreeSet::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match validate_template_name(line) {
            Ok(()) => {
                names.insert(line.to_string());
            }
            Err(e) => warn!("Ignoring remote catalog entry: {}", e),
        }
    }
    names.into_iter().collect()
}
