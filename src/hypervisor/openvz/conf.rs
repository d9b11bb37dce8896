//! OpenVZ container configuration files (`/etc/vz/conf/<ctid>.conf`).
//!
//! The format is shell-like `KEY="value"` assignments. [`VeConf`] keeps
//! every line it does not understand (comments, blank lines, odd syntax) and
//! the order of keys, so rewriting a file only touches the keys being set.

use regex::Regex;
use std::sync::LazyLock;

static ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s#]*))\s*(?:#.*)?$"#)
        .expect("entry pattern is valid")
});

#[derive(Debug, Clone, PartialEq)]
enum Line {
    Entry { key: String, value: String },
    Verbatim(String),
}

/// Parsed container configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VeConf {
    lines: Vec<Line>,
}

impl VeConf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Self {
        let lines = text
            .lines()
            .map(|line| match ENTRY.captures(line) {
                Some(caps) if !line.trim_start().starts_with('#') => {
                    let value = caps
                        .get(2)
                        .or_else(|| caps.get(3))
                        .or_else(|| caps.get(4))
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default();
                    Line::Entry {
                        key: caps[1].to_string(),
                        value,
                    }
                }
                _ => Line::Verbatim(line.to_string()),
            })
            .collect();
        Self { lines }
    }

    /// Value of the last assignment to `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().rev().find_map(|line| match line {
            Line::Entry { key: k, value } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// Set `key`, replacing its last assignment in place or appending
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        let existing = self.lines.iter_mut().rev().find_map(|line| match line {
            Line::Entry { key: k, value: v } if k == key => Some(v),
            _ => None,
        });
        match existing {
            Some(slot) => *slot = value,
            None => self.lines.push(Line::Entry {
                key: key.to_string(),
                value,
            }),
        }
    }

    /// Set `key` only when it is not present yet
    pub fn set_default(&mut self, key: &str, value: impl Into<String>) {
        if self.get(key).is_none() {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.lines
            .retain(|line| !matches!(line, Line::Entry { key: k, .. } if k == key));
    }

    /// Keys in file order, without duplicates
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::new();
        for line in &self.lines {
            if let Line::Entry { key, .. } = line {
                if !keys.contains(&key.as_str()) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    /// Apply every assignment of `updates`; keys absent from `updates` are
    /// left untouched
    pub fn merge(&mut self, updates: &VeConf) {
        for key in updates.keys() {
            if let Some(value) = updates.get(key) {
                self.set(key, value);
            }
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Entry { key, value } => {
                    out.push_str(key);
                    out.push_str("=\"");
                    out.push_str(value);
                    out.push('"');
                }
                Line::Verbatim(text) => out.push_str(text),
            }
            out.push('\n');
        }
        out
    }
}

/// Split a UBC `barrier:limit` pair; a single value is both
pub fn parse_pair(value: &str) -> Option<(u64, u64)> {
    let mut parts = value.split(':');
    let barrier = parse_ubc_number(parts.next()?)?;
    let limit = match parts.next() {
        Some(limit) => parse_ubc_number(limit)?,
        None => barrier,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((barrier, limit))
}

fn parse_ubc_number(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw == "unlimited" {
        return Some(u64::MAX);
    }
    raw.parse().ok()
}
