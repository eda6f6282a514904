//! File retrieval by URL.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Result, SpendsortError};

#[async_trait]
pub trait FileFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FileFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SpendsortError::Fetch(format!("{url}: {e}")))?;
        if !response.status().is_success() {
            return Err(SpendsortError::Fetch(format!("{url}: HTTP {}", response.status())));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SpendsortError::Fetch(format!("{url}: {e}")))?;
        debug!(url, bytes = bytes.len(), "Fetched file");
        Ok(bytes.to_vec())
    }
}

/// `file://` URLs and plain filesystem paths.
pub struct LocalFetcher;

pub fn local_path(url: &str) -> PathBuf {
    PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
}

#[async_trait]
impl FileFetcher for LocalFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let path = local_path(url);
        tokio::fs::read(&path)
            .await
            .map_err(|e| SpendsortError::Fetch(format!("{}: {e}", path.display())))
    }
}

/// Dispatches on the URL scheme.
pub struct AnyFetcher {
    http: HttpFetcher,
    local: LocalFetcher,
}

impl AnyFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            http: HttpFetcher::new(client),
            local: LocalFetcher,
        }
    }
}

pub fn is_remote(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

#[async_trait]
impl FileFetcher for AnyFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        if is_remote(url) {
            self.http.fetch(url).await
        } else {
            self.local.fetch(url).await
        }
    }
}
