// HTTP retrieval: the remote list, candidate files, the overlay font and the
// startup asset are all plain GETs.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Whole response body.
    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>>;

    /// Stream a response body to `dest`; returns bytes written.
    async fn download(&self, url: &str, dest: &Path) -> Result<u64>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .user_agent(concat!("reelqueue-engine/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        // Url::parse percent-encodes spaces and other unsafe characters that
        // show up in hand-maintained song lists.
        let parsed = reqwest::Url::parse(url).with_context(|| format!("invalid URL: {url}"))?;
        debug!("opening URL: {parsed}");
        let resp = self
            .client
            .get(parsed)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("{url} returned an error status"))?;
        Ok(resp)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self.get(url).await?;
        let body = resp
            .bytes()
            .await
            .with_context(|| format!("failed reading body of {url}"))?;
        Ok(body.to_vec())
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let mut resp = self.get(url).await?;
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("failed to create {}", dest.display()))?;

        let mut written = 0u64;
        while let Some(chunk) = resp
            .chunk()
            .await
            .with_context(|| format!("download of {url} interrupted"))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        info!("downloaded {url} -> {} ({written} bytes)", dest.display());
        Ok(written)
    }
}
