// One production cycle: try random candidates until one becomes a queued
// segment, the attempt budget runs out, or something fatal happens.

use std::path::Path;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::acquire::acquire;
use crate::candidates::{CandidateList, Extensions};
use crate::chain::{AppendError, Segment};
use crate::controller::ControllerState;
use crate::fetch::Fetcher;
use crate::media::{EncodeRequest, MediaError, MediaTool};
use crate::overlay::{self, OverlayFields};
use crate::scratch::ScratchDir;

/// Why a candidate was discarded. None of these stop the feeder.
#[derive(Debug, Error)]
pub enum SkipReason {
    #[error("unsupported file extension")]
    UnsupportedExtension,
    #[error("download failed: {0:#}")]
    Download(anyhow::Error),
    #[error("unusable archive: {0}")]
    Archive(String),
    #[error("archive has no playable member")]
    EmptyArchive,
    #[error("probe rejected file")]
    Probe(#[source] MediaError),
    #[error("too long ({duration:.1}s, limit {limit:.1}s)")]
    TooLong { duration: f64, limit: f64 },
    #[error("encode failed")]
    Encode(#[source] MediaError),
    #[error("publish failed")]
    Publish(#[source] AppendError),
}

/// Outcome of a single candidate attempt.
#[derive(Debug)]
pub enum Attempt {
    Produced(Segment),
    Skip(SkipReason),
    Fatal(anyhow::Error),
}

/// Outcome of a whole cycle.
#[derive(Debug)]
pub enum CycleOutcome {
    Produced(Segment),
    /// Budget spent (or nothing to try); the caller opens the circuit.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub breaker_cooldown: Duration,
    pub fetch_retry: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 25,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            breaker_cooldown: Duration::from_secs(300),
            fetch_retry: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failures`-th consecutive failed attempt.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

/// Everything an attempt needs besides the mutable controller state.
pub struct Production<'a> {
    pub fetcher: &'a dyn Fetcher,
    pub media: &'a dyn MediaTool,
    pub extensions: &'a Extensions,
    pub work_dir: &'a Path,
    pub retry: RetryPolicy,
}

impl Production<'_> {
    pub async fn run_cycle(
        &self,
        list: &CandidateList,
        state: &mut ControllerState,
        rng: &mut fastrand::Rng,
    ) -> anyhow::Result<CycleOutcome> {
        let mut failures = 0;
        while failures < self.retry.max_attempts {
            let Some(url) = list.pick(rng).map(str::to_string) else {
                break;
            };
            info!("selected: {url}");
            match self.attempt(&url, state, rng).await {
                Attempt::Produced(seg) => return Ok(CycleOutcome::Produced(seg)),
                Attempt::Skip(reason) => {
                    failures += 1;
                    warn!(
                        "skipping {url}: {:#} ({failures}/{})",
                        anyhow::Error::from(reason),
                        self.retry.max_attempts
                    );
                    if failures < self.retry.max_attempts {
                        let delay = self.retry.backoff(failures);
                        debug!("backing off for {delay:?}");
                        tokio::time::sleep(delay).await;
                    }
                }
                Attempt::Fatal(e) => {
                    return Err(e.context(format!("fatal error while producing {url}")))
                }
            }
        }
        Ok(CycleOutcome::Exhausted { attempts: failures })
    }

    /// Acquire, probe, render and publish one candidate. Scratch files are
    /// gone by the time this returns, whatever the outcome.
    pub async fn attempt(
        &self,
        url: &str,
        state: &mut ControllerState,
        rng: &mut fastrand::Rng,
    ) -> Attempt {
        let started = Instant::now();
        let scratch = match ScratchDir::acquire(self.work_dir) {
            Ok(s) => s,
            Err(e) => return Attempt::Fatal(e),
        };

        let source = match acquire(self.fetcher, url, &scratch, self.extensions, rng).await {
            Ok(a) => a,
            Err(reason) => return Attempt::Skip(reason),
        };

        let info = match self.media.probe(&source.path).await {
            Ok(info) => info,
            Err(e @ MediaError::Launch { .. }) => return Attempt::Fatal(e.into()),
            Err(e) => return Attempt::Skip(SkipReason::Probe(e)),
        };
        let limit = state.gas.max_segment_seconds();
        if info.duration_seconds > limit {
            return Attempt::Skip(SkipReason::TooLong {
                duration: info.duration_seconds,
                limit,
            });
        }

        let overlay_text = overlay::compose(
            &OverlayFields {
                title: &info.title,
                artist: info.artist.as_deref(),
                file_name: &info.file_name,
                comment: info.comment.as_deref(),
            },
            overlay::LINE_WIDTH,
        );
        let req = EncodeRequest {
            input: source.path.clone(),
            overlay_text,
            quality: state.quality.state(),
            work_dir: scratch.path().to_path_buf(),
        };
        let encoded = match self.media.encode(&req).await {
            Ok(m) => m,
            Err(e @ MediaError::Launch { .. }) => return Attempt::Fatal(e.into()),
            Err(e) => return Attempt::Skip(SkipReason::Encode(e)),
        };

        let segment = match state
            .chain
            .append_segment(&encoded.output_file, encoded.duration_seconds)
            .await
        {
            Ok(seg) => seg,
            Err(e) => return Attempt::Skip(SkipReason::Publish(e)),
        };
        state.gas.add(segment.duration_seconds);

        let spent = started.elapsed();
        info!(
            "processing took {:.1}s for {:.1}s of video; gas tank at {:.1}s",
            spent.as_secs_f64(),
            segment.duration_seconds,
            state.gas.level()
        );
        if let Some(t) = state.quality.observe(segment.duration_seconds, spent) {
            if t.before == t.after {
                debug!("tuning unchanged at {:.2}x", t.ratio);
            }
        }

        Attempt::Produced(segment)
    }
}
