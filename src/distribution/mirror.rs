//! Mirror list handling.

use super::transport::Transport;
use super::{DistributionError, Result};
use rand::seq::IndexedRandom;
use tracing::{debug, info, warn};
use url::Url;

/// Mirror base URLs read from the operator-maintained list
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorList {
    mirrors: Vec<Url>,
}

impl MirrorList {
    /// Parse one base URL per line; blank lines and `#` comments are skipped
    pub fn parse(text: &str) -> Self {
        let mirrors = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| match Url::parse(&with_trailing_slash(line)) {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!("Skipping invalid mirror '{}': {}", line, e);
                    None
                }
            })
            .collect();
        Self { mirrors }
    }

    /// Download the list fresh; it is never cached between sessions
    pub async fn fetch(transport: &dyn Transport, list_url: &str) -> Result<Self> {
        let url = Url::parse(list_url)?;
        let text = transport.get_text(&url).await?;
        let list = Self::parse(&text);
        if list.is_empty() {
            return Err(DistributionError::NoMirrors(list_url.to_string()));
        }
        debug!("Mirror list has {} entries", list.len());
        Ok(list)
    }

    pub fn mirrors(&self) -> &[Url] {
        &self.mirrors
    }

    pub fn len(&self) -> usize {
        self.mirrors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mirrors.is_empty()
    }

    /// Pick a mirror uniformly at random
    pub fn choose(&self) -> Option<&Url> {
        let mirror = self.mirrors.choose(&mut rand::rng());
        if let Some(url) = mirror {
            info!("Using mirror {}", url);
        }
        mirror
    }
}

fn with_trailing_slash(base: &str) -> String {
    if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{}/", base)
    }
}

/// URL of `file_name` under `<mirror>/<domain>/`
pub fn resource_url(mirror: &Url, domain: &str, file_name: &str) -> Result<Url> {
    Ok(mirror.join(&format!("{}/", domain))?.join(file_name)?)
}
