// Encoder tuning driven by render throughput.
//
// `ratio` is seconds of output rendered per wall-clock second. Two independent
// loops chase `target`:
//   - quality factor (x264 CRF): one step every cycle, fine tuning
//   - speed preset: one step only outside a +/-0.5 dead band, coarse tuning
// Nothing is persisted; every process starts fast (preset 0) at best quality.

use std::time::Duration;

use tracing::info;

/// x264 presets, fastest first.
pub const PRESETS: [&str; 9] = [
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
    "slower",
    "veryslow",
];

pub const MAX_PRESET: usize = PRESETS.len() - 1;

const PRESET_DEAD_BAND: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityState {
    pub quality_factor: u32,
    pub preset_index: usize,
}

impl QualityState {
    pub fn preset_name(&self) -> &'static str {
        PRESETS[self.preset_index.min(MAX_PRESET)]
    }
}

/// What one observation did to the tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tuning {
    pub ratio: f64,
    pub before: QualityState,
    pub after: QualityState,
}

#[derive(Debug, Clone)]
pub struct QualityController {
    state: QualityState,
    min_q: u32,
    max_q: u32,
    target: f64,
}

impl QualityController {
    pub fn new(min_q: u32, max_q: u32, target: f64) -> Self {
        let (min_q, max_q) = if min_q <= max_q { (min_q, max_q) } else { (max_q, min_q) };
        Self {
            state: QualityState {
                quality_factor: min_q,
                preset_index: 0,
            },
            min_q,
            max_q,
            target,
        }
    }

    pub fn state(&self) -> QualityState {
        self.state
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    /// Feed one production result. Returns `None` (and changes nothing) when the
    /// wall time is unusable.
    pub fn observe(&mut self, rendered_seconds: f64, spent: Duration) -> Option<Tuning> {
        let wall = spent.as_secs_f64();
        if wall <= 0.0 || !rendered_seconds.is_finite() {
            return None;
        }
        let ratio = rendered_seconds / wall;
        Some(self.apply_ratio(ratio))
    }

    pub fn apply_ratio(&mut self, ratio: f64) -> Tuning {
        let before = self.state;

        // Too slow -> cheaper encode (higher CRF); fast -> spend it on quality.
        let mut q = self.state.quality_factor;
        if ratio < self.target {
            q = q.saturating_add(1);
        } else if ratio > self.target {
            q = q.saturating_sub(1);
        }
        self.state.quality_factor = q.clamp(self.min_q, self.max_q);

        let p = self.state.preset_index;
        if ratio < self.target - PRESET_DEAD_BAND && p > 0 {
            self.state.preset_index = p - 1;
        } else if ratio > self.target + PRESET_DEAD_BAND && p < MAX_PRESET {
            self.state.preset_index = p + 1;
        }

        info!(
            "render ran at {:.2}x (target {:.2}x); preset {} -> {}, crf {} -> {}",
            ratio,
            self.target,
            before.preset_name(),
            self.state.preset_name(),
            before.quality_factor,
            self.state.quality_factor
        );

        Tuning {
            ratio,
            before,
            after: self.state,
        }
    }
}
