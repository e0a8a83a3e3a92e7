// Buffer controller: the feeder's main loop.
//
// Every iteration re-checks the bootstrap chain, re-reads the remote list and
// then either produces one segment or sleeps. A changed list produces right
// away; otherwise the gas tank decides. After a production the entry pointer
// moves to the oldest node and the eviction passes run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::assets;
use crate::candidates::{CandidateList, Extensions};
use crate::chain::{BootstrapHealth, SegmentChain};
use crate::config::FeedConfig;
use crate::eviction::Evictor;
use crate::fetch::Fetcher;
use crate::gas_tank::{Admission, GasTank};
use crate::manifest::Manifest;
use crate::media::MediaTool;
use crate::production::{CycleOutcome, Production, RetryPolicy};
use crate::quality::QualityController;

/// Everything the loop mutates, threaded through each iteration.
#[derive(Debug)]
pub struct ControllerState {
    pub gas: GasTank,
    pub quality: QualityController,
    pub chain: SegmentChain,
    pub list_fingerprint: Option<String>,
}

impl ControllerState {
    pub fn new(config: &FeedConfig) -> Self {
        Self {
            gas: GasTank::new(config.gas_limit_seconds),
            quality: QualityController::new(
                config.min_quality,
                config.max_quality,
                config.target_speed,
            ),
            chain: SegmentChain::new(&config.media_dir, &config.startup_asset),
            list_fingerprint: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    /// A segment with this id was queued.
    Produced(u64),
    /// The tank was full; slept this long.
    Waited(Duration),
    FetchFailed,
    /// No candidate worked (or none was playable); slept the cooldown.
    CircuitOpen,
}

pub struct BufferController {
    config: FeedConfig,
    extensions: Extensions,
    retry: RetryPolicy,
    fetcher: Arc<dyn Fetcher>,
    media: Arc<dyn MediaTool>,
    evictor: Evictor,
    manifest: Manifest,
    rng: fastrand::Rng,
}

impl BufferController {
    pub fn new(
        config: FeedConfig,
        fetcher: Arc<dyn Fetcher>,
        media: Arc<dyn MediaTool>,
        evictor: Evictor,
        manifest: Manifest,
    ) -> Self {
        Self {
            extensions: config.allow_list(),
            retry: config.retry_policy(),
            config,
            fetcher,
            media,
            evictor,
            manifest,
            rng: fastrand::Rng::new(),
        }
    }

    #[cfg(test)]
    pub fn with_rng(mut self, rng: fastrand::Rng) -> Self {
        self.rng = rng;
        self
    }

    /// Fresh state for this process: bootstrap repaired if needed, otherwise
    /// numbering resumed from what is on disk.
    pub async fn startup(&self) -> Result<ControllerState> {
        let mut state = ControllerState::new(&self.config);
        if !self.sanity_check(&mut state).await? {
            state.chain.recover_counter()?;
        }
        info!(
            "feeding {} from {} (extensions: {}; target speed {:.1}x; gas limit {:.0}s)",
            state.chain.media_dir().display(),
            self.config.list_url,
            self.extensions.iter().collect::<Vec<_>>().join(","),
            state.quality.target(),
            state.gas.limit()
        );
        Ok(state)
    }

    /// Rebuild the bootstrap chain if it is broken. Returns true if it did.
    pub async fn sanity_check(&self, state: &mut ControllerState) -> Result<bool> {
        let health = state.chain.bootstrap_health();
        if health == BootstrapHealth::Healthy {
            return Ok(false);
        }
        warn!("playlist sanity check failed ({health:?}); fixing");

        let startup = state.chain.startup_path();
        if !startup.is_file() {
            let media_dir = state.chain.media_dir();
            tokio::fs::create_dir_all(media_dir)
                .await
                .with_context(|| format!("failed to create {}", media_dir.display()))?;
            assets::fetch_asset(&*self.fetcher, &self.config.startup_url, &startup)
                .await
                .context("startup asset unavailable")?;
        }
        state.chain.write_bootstrap()?;
        Ok(true)
    }

    pub async fn run(&mut self, state: &mut ControllerState) -> Result<()> {
        loop {
            let outcome = self.step(state).await?;
            debug!("iteration finished: {outcome:?}");
        }
    }

    pub async fn step(&mut self, state: &mut ControllerState) -> Result<StepOutcome> {
        self.sanity_check(state).await?;

        let body = match self.fetcher.get_bytes(&self.config.list_url).await {
            Ok(body) => body,
            Err(e) => {
                warn!(
                    "failed to fetch candidate list: {e:#}; retrying in {:?}",
                    self.retry.fetch_retry
                );
                tokio::time::sleep(self.retry.fetch_retry).await;
                return Ok(StepOutcome::FetchFailed);
            }
        };
        let list = CandidateList::from_body(&body, self.config.list_format, &self.extensions);

        if state.list_fingerprint.as_deref() != Some(list.fingerprint.as_str()) {
            info!(
                "remote list updated: {} entries, {} playable",
                list.total,
                list.playable.len()
            );
            state.list_fingerprint = Some(list.fingerprint.clone());
        } else {
            match state.gas.admit() {
                Admission::Wait { level, sleep } => {
                    info!(
                        "gas tank at {level:.1}s of {:.1}s; waiting {:.1}s",
                        state.gas.limit(),
                        sleep.as_secs_f64()
                    );
                    tokio::time::sleep(sleep).await;
                    return Ok(StepOutcome::Waited(sleep));
                }
                Admission::Produce { level } => {
                    info!(
                        "filling up gas tank ({level:.1} of {:.1} seconds ready)",
                        state.gas.limit()
                    );
                }
            }
        }

        if list.playable.is_empty() {
            warn!("candidate list has no playable entries ({} total)", list.total);
            return Ok(self.open_circuit().await);
        }

        let production = Production {
            fetcher: &*self.fetcher,
            media: &*self.media,
            extensions: &self.extensions,
            work_dir: &self.config.work_dir,
            retry: self.retry,
        };
        match production.run_cycle(&list, state, &mut self.rng).await? {
            CycleOutcome::Produced(segment) => {
                debug!(
                    "queued {} via {} at {:?}",
                    segment.video_file.display(),
                    segment.chain_file.display(),
                    segment.created_at
                );
                self.after_production(state)?;
                Ok(StepOutcome::Produced(segment.id))
            }
            CycleOutcome::Exhausted { attempts } => {
                warn!("no candidate worked after {attempts} attempts");
                Ok(self.open_circuit().await)
            }
        }
    }

    async fn open_circuit(&self) -> StepOutcome {
        info!("circuit open; retrying in {:?}", self.retry.breaker_cooldown);
        tokio::time::sleep(self.retry.breaker_cooldown).await;
        StepOutcome::CircuitOpen
    }

    fn after_production(&mut self, state: &mut ControllerState) -> Result<()> {
        state.chain.advance_entry()?;
        match self
            .evictor
            .run(&state.chain, &self.config.work_dir, &self.manifest)
        {
            Ok(report) => {
                if report.removed_segments() {
                    // The entry may name a node that just went away.
                    state.chain.advance_entry()?;
                }
                if !report.strays.is_empty() {
                    debug!("swept {} stray entries", report.strays.len());
                }
            }
            Err(e) => warn!("eviction failed: {e:#}"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ENTRY_ID;
    use crate::eviction::{DiskUsage, EvictionPolicy};
    use crate::fetch::testing::FakeFetcher;
    use crate::media::testing::FakeMediaTool;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    const LIST: &str = "http://x/list.txt";
    const STARTUP: &str = "http://x/startup.flv";

    /// Over the threshold whenever more than `keep` segment videos exist.
    struct CrowdedDisk {
        dir: PathBuf,
        keep: usize,
    }

    impl DiskUsage for CrowdedDisk {
        fn usage(&mut self, _path: &Path) -> Option<(u64, u64)> {
            let videos = std::fs::read_dir(&self.dir)
                .unwrap()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with("segment"))
                .count();
            Some(if videos > self.keep { (90, 100) } else { (10, 100) })
        }
    }

    struct Fixture {
        media_dir: TempDir,
        work_dir: TempDir,
        fetcher: Arc<FakeFetcher>,
        media: Arc<FakeMediaTool>,
    }

    impl Fixture {
        fn new() -> Self {
            let fx = Self {
                media_dir: TempDir::new().unwrap(),
                work_dir: TempDir::new().unwrap(),
                fetcher: Arc::new(FakeFetcher::new()),
                media: Arc::new(FakeMediaTool::new()),
            };
            fx.fetcher.serve(STARTUP, b"FLV startup".to_vec());
            fx
        }

        fn config(&self, gas_limit_seconds: f64) -> FeedConfig {
            FeedConfig {
                list_url: LIST.into(),
                startup_url: STARTUP.into(),
                media_dir: self.media_dir.path().to_path_buf(),
                work_dir: self.work_dir.path().to_path_buf(),
                extensions: vec!["mp3".into()],
                gas_limit_seconds,
                max_attempts: 3,
                ..FeedConfig::default()
            }
        }

        fn controller_with_disk(&self, gas_limit_seconds: f64, keep: usize) -> BufferController {
            let disk = CrowdedDisk {
                dir: self.media_dir.path().to_path_buf(),
                keep,
            };
            BufferController::new(
                self.config(gas_limit_seconds),
                self.fetcher.clone(),
                self.media.clone(),
                Evictor::new(EvictionPolicy::default(), Box::new(disk)),
                Manifest::default(),
            )
            .with_rng(fastrand::Rng::with_seed(42))
        }

        fn controller(&self, gas_limit_seconds: f64) -> BufferController {
            self.controller_with_disk(gas_limit_seconds, usize::MAX)
        }

        fn entry_next(&self) -> String {
            SegmentChain::new(self.media_dir.path(), "startup.flv")
                .read_chain(ENTRY_ID)
                .unwrap()
                .next
        }
    }

    #[tokio::test]
    async fn test_startup_builds_bootstrap() {
        let fx = Fixture::new();
        let ctl = fx.controller(3600.0);
        let state = ctl.startup().await.unwrap();

        assert_eq!(state.chain.counter(), 0);
        assert!(fx.media_dir.path().join("startup.flv").is_file());
        assert_eq!(fx.entry_next(), "playlist1.txt");
        assert_eq!(
            state.chain.read_chain(1).unwrap().next,
            "playlist0.txt"
        );
    }

    #[tokio::test]
    async fn test_startup_without_startup_asset_is_fatal() {
        let fx = Fixture::new();
        fx.fetcher.forget(STARTUP);
        let ctl = fx.controller(3600.0);
        assert!(ctl.startup().await.is_err());
    }

    #[tokio::test]
    async fn test_filtered_candidates_are_never_fetched() {
        let fx = Fixture::new();
        fx.fetcher.serve(LIST, "http://x/a.mp3\nhttp://x/b.exe");
        fx.fetcher.serve("http://x/a.mp3", b"ID3".to_vec());
        fx.media.knows("a.mp3", "Song A", 60.0);

        let mut ctl = fx.controller(3600.0);
        let mut state = ctl.startup().await.unwrap();
        for expected in 1..=4 {
            assert_eq!(ctl.step(&mut state).await.unwrap(), StepOutcome::Produced(expected));
        }

        assert!(!fx.fetcher.requested().iter().any(|u| u.ends_with("b.exe")));
        assert_eq!(fx.media.encoded_inputs(), vec!["a.mp3"; 4]);
        assert!(fx.media_dir.path().join("segment4.flv").is_file());
        assert_eq!(fx.entry_next(), "playlist1.txt");
        assert!(std::fs::read_dir(fx.work_dir.path()).unwrap().next().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_tank_waits_for_the_overage() {
        let fx = Fixture::new();
        fx.fetcher.serve(LIST, "http://x/a.mp3");
        fx.fetcher.serve("http://x/a.mp3", b"ID3".to_vec());
        fx.media.knows("a.mp3", "Song A", 25.0);

        let mut ctl = fx.controller(50.0);
        let mut state = ctl.startup().await.unwrap();
        assert_eq!(ctl.step(&mut state).await.unwrap(), StepOutcome::Produced(1));
        // The tank drains in wall time, so push it well past the limit.
        state.gas.add(49.0);

        let StepOutcome::Waited(sleep) = ctl.step(&mut state).await.unwrap() else {
            panic!("expected the controller to wait");
        };
        assert!(sleep > Duration::from_secs(23) && sleep <= Duration::from_secs(24));
        assert_eq!(fx.media.encoded_inputs().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_change_bypasses_gas_check() {
        let fx = Fixture::new();
        fx.fetcher.serve(LIST, "http://x/a.mp3");
        fx.fetcher.serve("http://x/a.mp3", b"ID3".to_vec());
        fx.media.knows("a.mp3", "Song A", 25.0);

        let mut ctl = fx.controller(50.0);
        let mut state = ctl.startup().await.unwrap();
        assert_eq!(ctl.step(&mut state).await.unwrap(), StepOutcome::Produced(1));
        state.gas.add(1000.0);
        assert!(matches!(ctl.step(&mut state).await.unwrap(), StepOutcome::Waited(_)));

        fx.fetcher.serve(LIST, "http://x/a.mp3\n");
        assert_eq!(ctl.step(&mut state).await.unwrap(), StepOutcome::Produced(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_without_playable_entries_opens_circuit() {
        let fx = Fixture::new();
        fx.fetcher.serve(LIST, "http://x/b.exe");

        let mut ctl = fx.controller(3600.0);
        let mut state = ctl.startup().await.unwrap();
        assert_eq!(ctl.step(&mut state).await.unwrap(), StepOutcome::CircuitOpen);
        assert!(fx.media.encoded_inputs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_opens_circuit() {
        let fx = Fixture::new();
        fx.fetcher.serve(LIST, "http://x/missing.mp3");

        let mut ctl = fx.controller(3600.0);
        let mut state = ctl.startup().await.unwrap();
        assert_eq!(ctl.step(&mut state).await.unwrap(), StepOutcome::CircuitOpen);
        let tries = fx
            .fetcher
            .requested()
            .iter()
            .filter(|u| u.ends_with("missing.mp3"))
            .count();
        assert_eq!(tries, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_fetch_failure_is_transient() {
        let fx = Fixture::new();
        let mut ctl = fx.controller(3600.0);
        let mut state = ctl.startup().await.unwrap();
        assert_eq!(ctl.step(&mut state).await.unwrap(), StepOutcome::FetchFailed);
        assert_eq!(state.list_fingerprint, None);
    }

    #[tokio::test]
    async fn test_missing_encoder_stops_the_loop() {
        let fx = Fixture::new();
        fx.fetcher.serve(LIST, "http://x/a.mp3");
        fx.fetcher.serve("http://x/a.mp3", b"ID3".to_vec());
        fx.media.break_launch();

        let mut ctl = fx.controller(3600.0);
        let mut state = ctl.startup().await.unwrap();
        assert!(ctl.step(&mut state).await.is_err());
        assert!(ctl.run(&mut state).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_chain_write_failure_keeps_running() {
        let fx = Fixture::new();
        fx.fetcher.serve(LIST, "http://x/a.mp3");
        fx.fetcher.serve("http://x/a.mp3", b"ID3".to_vec());
        fx.media.knows("a.mp3", "Song A", 60.0);

        let mut ctl = fx.controller(3600.0);
        let mut state = ctl.startup().await.unwrap();
        let blocker = fx.media_dir.path().join(".playlist1.txt.tmp");
        std::fs::create_dir(&blocker).unwrap();

        assert_eq!(ctl.step(&mut state).await.unwrap(), StepOutcome::CircuitOpen);
        assert_eq!(state.chain.counter(), 0);

        std::fs::remove_dir(&blocker).unwrap();
        assert_eq!(ctl.step(&mut state).await.unwrap(), StepOutcome::Produced(1));
    }

    #[tokio::test]
    async fn test_eviction_moves_entry_forward() {
        let fx = Fixture::new();
        fx.fetcher.serve(LIST, "http://x/a.mp3");
        fx.fetcher.serve("http://x/a.mp3", b"ID3".to_vec());
        fx.media.knows("a.mp3", "Song A", 60.0);

        let mut ctl = fx.controller_with_disk(3600.0, 1);
        let mut state = ctl.startup().await.unwrap();
        assert_eq!(ctl.step(&mut state).await.unwrap(), StepOutcome::Produced(1));
        assert_eq!(fx.entry_next(), "playlist1.txt");

        assert_eq!(ctl.step(&mut state).await.unwrap(), StepOutcome::Produced(2));
        assert!(!fx.media_dir.path().join("segment1.flv").exists());
        assert!(!fx.media_dir.path().join("playlist1.txt").exists());
        assert_eq!(fx.entry_next(), "playlist2.txt");
    }

    #[tokio::test]
    async fn test_restart_resumes_numbering() {
        let fx = Fixture::new();
        fx.fetcher.serve(LIST, "http://x/a.mp3");
        fx.fetcher.serve("http://x/a.mp3", b"ID3".to_vec());
        fx.media.knows("a.mp3", "Song A", 60.0);

        let mut ctl = fx.controller(3600.0);
        let mut state = ctl.startup().await.unwrap();
        ctl.step(&mut state).await.unwrap();
        ctl.step(&mut state).await.unwrap();

        let mut ctl = fx.controller(3600.0);
        let mut state = ctl.startup().await.unwrap();
        assert_eq!(state.chain.counter(), 2);
        assert_eq!(ctl.step(&mut state).await.unwrap(), StepOutcome::Produced(3));
    }
}
