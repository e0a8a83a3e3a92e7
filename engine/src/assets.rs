// Files the feeder cannot run without: the overlay font and the startup
// video the bootstrap chain loops on. Failing to get either is fatal.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::fetch::Fetcher;

/// Download `url` to `dest` through a sibling temp file, so a half-finished
/// download is never mistaken for the real asset.
pub async fn fetch_asset(fetcher: &dyn Fetcher, url: &str, dest: &Path) -> Result<()> {
    if url.trim().is_empty() {
        bail!("no URL configured for {}", dest.display());
    }
    let file_name = dest
        .file_name()
        .with_context(|| format!("{} has no file name", dest.display()))?;
    let tmp = dest.with_file_name(format!(".{}.part", file_name.to_string_lossy()));

    let res = fetcher.download(url, &tmp).await;
    let written = match res {
        Ok(n) => n,
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.context(format!("failed to retrieve {}", dest.display())));
        }
    };
    if written == 0 {
        let _ = tokio::fs::remove_file(&tmp).await;
        bail!("{url} returned an empty body");
    }
    tokio::fs::rename(&tmp, dest)
        .await
        .with_context(|| format!("failed to install {}", dest.display()))?;
    info!("installed {} from {url}", dest.display());
    Ok(())
}

/// Make sure the overlay font exists, downloading it if it does not.
pub async fn ensure_font(fetcher: &dyn Fetcher, url: &str, dest: &Path) -> Result<()> {
    if dest.is_file() {
        return Ok(());
    }
    fetch_asset(fetcher, url, dest).await.context("overlay font unavailable")
}
