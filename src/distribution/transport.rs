//! Plain file transfer backends.

use super::{DistributionConfig, DistributionError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;
use url::Url;

/// Progress callback receiving `(downloaded_bytes, total_bytes)`
pub type Progress<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

/// Retrieves remote resources
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch a small text resource (mirror list, catalog, sidecar)
    async fn get_text(&self, url: &Url) -> Result<String>;

    /// Stream a resource into `dest`, reporting progress, returning the
    /// number of bytes written
    async fn download(
        &self,
        url: &Url,
        dest: &mut (dyn AsyncWrite + Send + Unpin),
        progress: Progress<'_>,
    ) -> Result<u64>;
}

/// HTTP transport backed by `reqwest`
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &DistributionConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().user_agent(concat!(
            env!("CARGO_PKG_NAME"),
            "/",
            env!("CARGO_PKG_VERSION")
        ));
        if config.http_timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.http_timeout_secs));
        }
        Ok(Self {
            client: builder.build()?,
        })
    }

    async fn get(&self, url: &Url) -> Result<reqwest::Response> {
        debug!("GET {}", url);
        let response = self.client.get(url.clone()).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DistributionError::NotFound(url.to_string()));
        }
        Ok(response.error_for_status()?)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get_text(&self, url: &Url) -> Result<String> {
        Ok(self.get(url).await?.text().await?)
    }

    async fn download(
        &self,
        url: &Url,
        dest: &mut (dyn AsyncWrite + Send + Unpin),
        progress: Progress<'_>,
    ) -> Result<u64> {
        let mut response = self.get(url).await?;
        let total = response.content_length();
        let mut downloaded = 0u64;

        progress(0, total);
        while let Some(chunk) = response.chunk().await? {
            dest.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            progress(downloaded, total);
        }
        dest.flush().await?;
        Ok(downloaded)
    }
}

/// In-memory transport serving scripted resources
///
/// A resource may be given several bodies; successive requests receive them
/// in order and the last one repeats.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    resources: HashMap<String, Vec<Vec<u8>>>,
    requests: Mutex<HashMap<String, usize>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(self, url: &str, text: &str) -> Self {
        self.with_bytes(url, text.as_bytes().to_vec())
    }

    pub fn with_bytes(self, url: &str, body: Vec<u8>) -> Self {
        self.with_sequence(url, vec![body])
    }

    pub fn with_sequence(mut self, url: &str, bodies: Vec<Vec<u8>>) -> Self {
        self.resources.insert(url.to_string(), bodies);
        self
    }

    /// Number of requests made for `url`
    pub fn requests(&self, url: &str) -> usize {
        self.requests
            .lock()
            .map(|requests| requests.get(url).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn serve(&self, url: &Url) -> Result<Vec<u8>> {
        let key = url.as_str().to_string();
        let count = match self.requests.lock() {
            Ok(mut requests) => {
                let count = requests.entry(key.clone()).or_insert(0);
                *count += 1;
                *count
            }
            Err(_) => 1,
        };

        let bodies = self
            .resources
            .get(&key)
            .filter(|bodies| !bodies.is_empty())
            .ok_or_else(|| DistributionError::NotFound(key.clone()))?;
        let index = (count - 1).min(bodies.len() - 1);
        Ok(bodies[index].clone())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn get_text(&self, url: &Url) -> Result<String> {
        let body = self.serve(url)?;
        String::from_utf8(body).map_err(|e| {
            DistributionError::IoError(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }

    async fn download(
        &self,
        url: &Url,
        dest: &mut (dyn AsyncWrite + Send + Unpin),
        progress: Progress<'_>,
    ) -> Result<u64> {
        let body = self.serve(url)?;
        let total = body.len() as u64;
        let mut downloaded = 0u64;

        progress(0, Some(total));
        for chunk in body.chunks(8 * 1024) {
            dest.write_all(chunk).await?;
            downloaded += chunk.len() as u64;
            progress(downloaded, Some(total));
        }
        dest.flush().await?;
        Ok(downloaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn test_memory_transport_sequences_and_counts() {
        let transport = MemoryTransport::new()
            .with_sequence("http://m/a", vec![b"first".to_vec(), b"second".to_vec()]);
        let url = Url::parse("http://m/a").unwrap();

        assert_eq!(transport.get_text(&url).await.unwrap(), "first");
        assert_eq!(transport.get_text(&url).await.unwrap(), "second");
        assert_eq!(transport.get_text(&url).await.unwrap(), "second");
        assert_eq!(transport.requests("http://m/a"), 3);

        let missing = Url::parse("http://m/missing").unwrap();
        assert!(matches!(
            transport.get_text(&missing).await,
            Err(DistributionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_download_reports_progress() {
        let transport = MemoryTransport::new().with_bytes("http://m/big", vec![1u8; 20_000]);
        let url = Url::parse("http://m/big").unwrap();
        let last = AtomicU64::new(0);

        let mut sink: Vec<u8> = Vec::new();
        let written = transport
            .download(&url, &mut sink, &|done, total| {
                assert_eq!(total, Some(20_000));
                last.store(done, Ordering::SeqCst);
            })
            .await
            .unwrap();

        assert_eq!(written, 20_000);
        assert_eq!(sink.len(), 20_000);
        assert_eq!(last.load(Ordering::SeqCst), 20_000);
    }
}
