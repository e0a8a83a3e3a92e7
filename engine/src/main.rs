mod acquire;
mod assets;
mod candidates;
mod chain;
mod config;
mod controller;
mod eviction;
mod fetch;
mod gas_tank;
mod manifest;
mod media;
mod natural;
mod overlay;
mod production;
mod quality;
mod scratch;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::config::FeedConfig;
use crate::controller::BufferController;
use crate::eviction::{Evictor, SystemDiskUsage};
use crate::fetch::HttpFetcher;
use crate::manifest::Manifest;
use crate::media::Ffmpeg;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("reelqueue engine {version} starting");

    // Feeder config from SQLite (or defaults), with env overrides applied.
    let cfg = config::load_config_from_db_or_default().await;
    cfg.validate().context("invalid feed config")?;
    info!("effective config: {}", serde_json::to_string(&cfg)?);

    for dir in [&cfg.media_dir, &cfg.work_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let fetcher = Arc::new(HttpFetcher::new()?);
    assets::ensure_font(fetcher.as_ref(), &cfg.font_url, &cfg.font_path()).await?;

    let manifest = load_manifest(&cfg)?;
    info!(
        "manifest protects [{}] in {}",
        manifest.names().collect::<Vec<_>>().join(", "),
        cfg.work_dir.display()
    );

    let media = Arc::new(Ffmpeg::from_env(cfg.font_path()));
    let evictor = Evictor::new(cfg.eviction_policy(), Box::new(SystemDiskUsage::new()));
    let policy = evictor.policy();
    info!(
        "segments kept at most {:?}; disk usage threshold {:.0}%",
        policy.retention,
        policy.usage_threshold * 100.0
    );
    let mut controller = BufferController::new(cfg, fetcher, media, evictor, manifest);
    let mut state = controller.startup().await?;

    // Cancellation lands on an await point: child processes are killed on
    // drop and chain files are replaced by rename, so the queue stays valid.
    tokio::select! {
        res = controller.run(&mut state) => res?,
        _ = shutdown_signal() => {},
    }

    info!("stopped with segment counter at {}", state.chain.counter());
    Ok(())
}

/// The manifest file plus the names the feeder itself keeps in the work dir.
fn load_manifest(cfg: &FeedConfig) -> anyhow::Result<Manifest> {
    let mut manifest = Manifest::load(&cfg.manifest_path())?
        .with(cfg.font_file.clone())
        .with(cfg.manifest_file.clone());

    let db = config::db_path();
    let db = Path::new(&db);
    if db.parent() == Some(cfg.work_dir.as_path()) {
        if let Some(name) = db.file_name().map(|n| n.to_string_lossy().to_string()) {
            manifest = manifest
                .with(format!("{name}-wal"))
                .with(format!("{name}-shm"))
                .with(name);
        }
    }
    if let Some(exe) = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
    {
        manifest = manifest.with(exe);
    }
    Ok(manifest)
}

async fn shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.ok(); };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}
