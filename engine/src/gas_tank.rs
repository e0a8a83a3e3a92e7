// Gas tank: seconds of rendered-but-unplayed video.
//
// The level drains 1:1 with elapsed time and refills by each produced
// segment's duration. It is deliberately never clamped; a stalled producer
// drives it negative and callers must cope with that.

use std::time::{Duration, Instant};

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    /// Below the limit: render another segment.
    Produce { level: f64 },
    /// At/above the limit: sleep for exactly the overage.
    Wait { level: f64, sleep: Duration },
}

#[derive(Debug, Clone)]
pub struct GasTank {
    level: f64,
    limit: f64,
    last_tick: Instant,
}

impl GasTank {
    pub fn new(limit: f64) -> Self {
        Self::starting_at(limit, Instant::now())
    }

    pub fn starting_at(limit: f64, now: Instant) -> Self {
        Self {
            level: 0.0,
            limit,
            last_tick: now,
        }
    }

    pub fn level(&self) -> f64 {
        self.level
    }

    pub fn limit(&self) -> f64 {
        self.limit
    }

    /// Longest segment we accept: half the tank.
    pub fn max_segment_seconds(&self) -> f64 {
        self.limit / 2.0
    }

    pub fn tick(&mut self) -> f64 {
        self.tick_at(Instant::now())
    }

    /// Drain the time elapsed since the previous tick and return the new level.
    pub fn tick_at(&mut self, now: Instant) -> f64 {
        let used = now.saturating_duration_since(self.last_tick).as_secs_f64();
        self.level -= used;
        self.last_tick = now;
        self.level
    }

    pub fn add(&mut self, seconds: f64) {
        self.level += seconds;
    }

    /// How far the current level sits above the limit. Decay is linear at the
    /// same rate as wall time, so sleeping this long lands back on the limit.
    pub fn overage(&self) -> Duration {
        let over = self.level - self.limit;
        if over.is_finite() && over > 0.0 {
            Duration::from_secs_f64(over)
        } else {
            Duration::ZERO
        }
    }

    pub fn admit(&mut self) -> Admission {
        let level = self.tick();
        self.decide(level)
    }

    #[cfg(test)]
    pub fn admit_at(&mut self, now: Instant) -> Admission {
        let level = self.tick_at(now);
        self.decide(level)
    }

    fn decide(&self, level: f64) -> Admission {
        if level < self.limit {
            Admission::Produce { level }
        } else {
            Admission::Wait {
                level,
                sleep: self.overage(),
            }
        }
    }
}
