// Feeder configuration.
//
// Stored as a single row in SQLite so an operator (or installer) can change it
// without rebuilding; environment variables override the stored URLs and
// directories for one run.
//
// DB location:
// - Can be overridden with REELQUEUE_DB_PATH
// - Defaults to /opt/reelqueue/shared/reelqueue.db (installer-managed persistent dir)
//
// Note: rusqlite is synchronous. We call it via spawn_blocking to avoid blocking tokio.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{info, warn};

use crate::candidates::{Extensions, ListFormat};
use crate::eviction::EvictionPolicy;
use crate::production::RetryPolicy;

pub const DEFAULT_EXTENSIONS: [&str; 15] = [
    "zip", "xm", "it", "s3m", "mod", "mp3", "mp4", "flac", "m4a", "aac", "flv", "3gp", "ogg", "ra",
    "rm",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedConfig {
    pub list_url: String,
    pub font_url: String,
    pub startup_url: String,
    /// Directory the stream player reads chain files and segments from.
    pub media_dir: PathBuf,
    /// Scratch area; everything in it not named by the manifest is swept.
    pub work_dir: PathBuf,
    pub startup_asset: String,
    pub font_file: String,
    pub manifest_file: String,
    pub extensions: Vec<String>,
    pub list_format: ListFormat,
    pub gas_limit_seconds: f64,
    pub target_speed: f64,
    pub min_quality: u32,
    pub max_quality: u32,
    pub retention_seconds: u64,
    pub usage_threshold: f64,
    pub max_attempts: u32,
    pub backoff_base_seconds: u64,
    pub backoff_max_seconds: u64,
    pub breaker_cooldown_seconds: u64,
    pub fetch_retry_seconds: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            list_url: String::new(),
            font_url: String::new(),
            startup_url: String::new(),
            media_dir: PathBuf::from("/media"),
            work_dir: PathBuf::from("/opt/reelqueue/work"),
            startup_asset: "startup.flv".into(),
            font_file: "font.ttf".into(),
            manifest_file: "manifest".into(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            list_format: ListFormat::Auto,
            gas_limit_seconds: 3600.0,
            target_speed: 2.0,
            min_quality: 17,
            max_quality: 28,
            retention_seconds: 5400,
            usage_threshold: 0.8,
            max_attempts: retry.max_attempts,
            backoff_base_seconds: retry.backoff_base.as_secs(),
            backoff_max_seconds: retry.backoff_max.as_secs(),
            breaker_cooldown_seconds: retry.breaker_cooldown.as_secs(),
            fetch_retry_seconds: retry.fetch_retry.as_secs(),
        }
    }
}

impl FeedConfig {
    pub fn allow_list(&self) -> Extensions {
        Extensions::new(&self.extensions)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff_base: Duration::from_secs(self.backoff_base_seconds),
            backoff_max: Duration::from_secs(self.backoff_max_seconds),
            breaker_cooldown: Duration::from_secs(self.breaker_cooldown_seconds),
            fetch_retry: Duration::from_secs(self.fetch_retry_seconds),
        }
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        EvictionPolicy {
            retention: Duration::from_secs(self.retention_seconds),
            usage_threshold: self.usage_threshold,
        }
    }

    pub fn font_path(&self) -> PathBuf {
        self.work_dir.join(&self.font_file)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.work_dir.join(&self.manifest_file)
    }

    /// Apply REELQUEUE_* overrides. Returns true if anything changed.
    pub fn apply_env(&mut self) -> bool {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> bool {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut changed = false;
        for (key, slot) in [
            ("REELQUEUE_LIST_URL", &mut self.list_url),
            ("REELQUEUE_FONT_URL", &mut self.font_url),
            ("REELQUEUE_STARTUP_URL", &mut self.startup_url),
        ] {
            if let Some(v) = get(key) {
                changed |= *slot != v;
                *slot = v;
            }
        }
        for (key, slot) in [
            ("REELQUEUE_MEDIA_DIR", &mut self.media_dir),
            ("REELQUEUE_WORK_DIR", &mut self.work_dir),
        ] {
            if let Some(v) = get(key) {
                let v = PathBuf::from(v);
                changed |= *slot != v;
                *slot = v;
            }
        }
        changed
    }

    pub fn validate(&self) -> Result<()> {
        if self.list_url.trim().is_empty() {
            bail!("no candidate list URL configured (set REELQUEUE_LIST_URL)");
        }
        if !(self.gas_limit_seconds.is_finite() && self.gas_limit_seconds > 0.0) {
            bail!("gas limit must be positive, got {}", self.gas_limit_seconds);
        }
        if self.min_quality > self.max_quality {
            bail!(
                "min quality {} is above max quality {}",
                self.min_quality,
                self.max_quality
            );
        }
        if !(self.usage_threshold > 0.0 && self.usage_threshold <= 1.0) {
            bail!("disk usage threshold must be in (0, 1], got {}", self.usage_threshold);
        }
        if self.extensions.is_empty() {
            bail!("extension allow-list is empty");
        }
        if self.work_dir == self.media_dir {
            bail!("work dir and media dir must differ; the stray sweep would eat the queue");
        }
        Ok(())
    }
}

pub fn db_path() -> String {
    std::env::var("REELQUEUE_DB_PATH")
        .unwrap_or_else(|_| "/opt/reelqueue/shared/reelqueue.db".to_string())
}

fn db_init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;

        CREATE TABLE IF NOT EXISTS feed_config (
            id                  INTEGER PRIMARY KEY CHECK (id = 1),
            list_url            TEXT NOT NULL,
            font_url            TEXT NOT NULL,
            startup_url         TEXT NOT NULL,
            media_dir           TEXT NOT NULL,
            work_dir            TEXT NOT NULL,
            startup_asset       TEXT NOT NULL,
            font_file           TEXT NOT NULL,
            manifest_file       TEXT NOT NULL,
            extensions          TEXT NOT NULL,
            list_format         TEXT NOT NULL,
            gas_limit_seconds   REAL NOT NULL,
            target_speed        REAL NOT NULL,
            min_quality         INTEGER NOT NULL,
            max_quality         INTEGER NOT NULL,
            retention_seconds   INTEGER NOT NULL,
            usage_threshold     REAL NOT NULL,
            max_attempts        INTEGER NOT NULL,
            backoff_base_secs   INTEGER NOT NULL,
            backoff_max_secs    INTEGER NOT NULL,
            breaker_cooldown_secs INTEGER NOT NULL,
            fetch_retry_secs    INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}

/// True if the stored row looks like a placeholder written before anything
/// was configured. Trusting it would leave the feeder idle forever.
///
/// URLs are not part of the check: they survive migration anyway and are
/// often supplied only through the environment.
fn config_needs_migration(cfg: &FeedConfig) -> bool {
    cfg.gas_limit_seconds <= 0.0
        || cfg.extensions.is_empty()
        || cfg.media_dir.as_os_str().is_empty()
}

fn db_load_config(conn: &Connection) -> Result<Option<FeedConfig>> {
    db_init(conn)?;

    let row = conn.query_row(
        "SELECT list_url, font_url, startup_url, media_dir, work_dir, startup_asset,
                font_file, manifest_file, extensions, list_format, gas_limit_seconds,
                target_speed, min_quality, max_quality, retention_seconds, usage_threshold,
                max_attempts, backoff_base_secs, backoff_max_secs, breaker_cooldown_secs,
                fetch_retry_secs
         FROM feed_config WHERE id = 1",
        [],
        |row| {
            Ok((
                (
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, String>(9)?,
                ),
                (
                    row.get::<_, f64>(10)?,
                    row.get::<_, f64>(11)?,
                    row.get::<_, i64>(12)?,
                    row.get::<_, i64>(13)?,
                    row.get::<_, i64>(14)?,
                    row.get::<_, f64>(15)?,
                    row.get::<_, i64>(16)?,
                    row.get::<_, i64>(17)?,
                    row.get::<_, i64>(18)?,
                    row.get::<_, i64>(19)?,
                    row.get::<_, i64>(20)?,
                ),
            ))
        },
    );

    let (text, num) = match row {
        Ok(r) => r,
        Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let (
        list_url,
        font_url,
        startup_url,
        media_dir,
        work_dir,
        startup_asset,
        font_file,
        manifest_file,
        extensions,
        list_format,
    ) = text;
    let (
        gas_limit_seconds,
        target_speed,
        min_q,
        max_q,
        retention,
        usage_threshold,
        attempts,
        base,
        max,
        cooldown,
        fetch_retry,
    ) = num;

    let extensions: Vec<String> = serde_json::from_str(&extensions)
        .context("feed_config.extensions is not a JSON array")?;
    let non_negative = |v: i64| v.max(0) as u64;

    Ok(Some(FeedConfig {
        list_url,
        font_url,
        startup_url,
        media_dir: PathBuf::from(media_dir),
        work_dir: PathBuf::from(work_dir),
        startup_asset,
        font_file,
        manifest_file,
        extensions,
        list_format: list_format.parse()?,
        gas_limit_seconds,
        target_speed,
        min_quality: non_negative(min_q) as u32,
        max_quality: non_negative(max_q) as u32,
        retention_seconds: non_negative(retention),
        usage_threshold,
        max_attempts: non_negative(attempts) as u32,
        backoff_base_seconds: non_negative(base),
        backoff_max_seconds: non_negative(max),
        breaker_cooldown_seconds: non_negative(cooldown),
        fetch_retry_seconds: non_negative(fetch_retry),
    }))
}

fn db_save_config(conn: &mut Connection, cfg: &FeedConfig) -> Result<()> {
    db_init(conn)?;
    conn.execute(
        "INSERT INTO feed_config (id, list_url, font_url, startup_url, media_dir, work_dir,
            startup_asset, font_file, manifest_file, extensions, list_format, gas_limit_seconds,
            target_speed, min_quality, max_quality, retention_seconds, usage_threshold,
            max_attempts, backoff_base_secs, backoff_max_secs, breaker_cooldown_secs,
            fetch_retry_secs)
         VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
            ?17, ?18, ?19, ?20, ?21)
         ON CONFLICT(id) DO UPDATE SET
           list_url=excluded.list_url,
           font_url=excluded.font_url,
           startup_url=excluded.startup_url,
           media_dir=excluded.media_dir,
           work_dir=excluded.work_dir,
           startup_asset=excluded.startup_asset,
           font_file=excluded.font_file,
           manifest_file=excluded.manifest_file,
           extensions=excluded.extensions,
           list_format=excluded.list_format,
           gas_limit_seconds=excluded.gas_limit_seconds,
           target_speed=excluded.target_speed,
           min_quality=excluded.min_quality,
           max_quality=excluded.max_quality,
           retention_seconds=excluded.retention_seconds,
           usage_threshold=excluded.usage_threshold,
           max_attempts=excluded.max_attempts,
           backoff_base_secs=excluded.backoff_base_secs,
           backoff_max_secs=excluded.backoff_max_secs,
           breaker_cooldown_secs=excluded.breaker_cooldown_secs,
           fetch_retry_secs=excluded.fetch_retry_secs",
        params![
            cfg.list_url,
            cfg.font_url,
            cfg.startup_url,
            cfg.media_dir.to_string_lossy().to_string(),
            cfg.work_dir.to_string_lossy().to_string(),
            cfg.startup_asset,
            cfg.font_file,
            cfg.manifest_file,
            serde_json::to_string(&cfg.extensions)?,
            cfg.list_format.to_string(),
            cfg.gas_limit_seconds,
            cfg.target_speed,
            cfg.min_quality as i64,
            cfg.max_quality as i64,
            cfg.retention_seconds as i64,
            cfg.usage_threshold,
            cfg.max_attempts as i64,
            cfg.backoff_base_seconds as i64,
            cfg.backoff_max_seconds as i64,
            cfg.breaker_cooldown_seconds as i64,
            cfg.fetch_retry_seconds as i64,
        ],
    )?;
    Ok(())
}

/// Stored row, or defaults when there is none, with placeholder rows migrated.
/// Returns the config and whether it differs from what is stored.
fn resolve_stored(conn: &Connection) -> Result<(FeedConfig, bool)> {
    match db_load_config(conn)? {
        Some(cfg) if config_needs_migration(&cfg) => {
            let migrated = FeedConfig {
                list_url: cfg.list_url,
                font_url: cfg.font_url,
                startup_url: cfg.startup_url,
                ..FeedConfig::default()
            };
            warn!(
                "feed config looked uninitialized; migrated to defaults (media_dir={})",
                migrated.media_dir.display()
            );
            Ok((migrated, true))
        }
        Some(cfg) => Ok((cfg, false)),
        None => Ok((FeedConfig::default(), true)),
    }
}

pub async fn load_config_from_db_or_default() -> FeedConfig {
    let path = db_path();
    let res = tokio::task::spawn_blocking(move || -> Result<(FeedConfig, bool)> {
        let conn = Connection::open(path)?;
        resolve_stored(&conn)
    })
    .await;

    let (mut cfg, mut dirty) = match res {
        Ok(Ok(loaded)) => loaded,
        Ok(Err(e)) => {
            warn!("failed to load feed config, using defaults: {e:#}");
            (FeedConfig::default(), false)
        }
        Err(e) => {
            warn!("failed to join feed config load task, using defaults: {e}");
            (FeedConfig::default(), false)
        }
    };

    if cfg.apply_env() {
        info!("feed config overridden from environment");
        dirty = true;
    }

    if dirty {
        // Best-effort persist; the run goes ahead with `cfg` either way.
        let to_save = cfg.clone();
        let path = db_path();
        let saved = tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = Connection::open(path)?;
            db_save_config(&mut conn, &to_save)
        })
        .await;
        match saved {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("failed to persist feed config: {e:#}"),
            Err(e) => warn!("failed to join feed config save task: {e}"),
        }
    }
    cfg
}
