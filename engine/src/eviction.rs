// Disk reclamation after each production cycle.
//
// Three passes, in order:
// 1. age: drop the oldest segments while their video is past the retention window
// 2. usage: while the served filesystem is too full, drop the oldest segment
// 3. sweep: delete anything in the working directory the manifest does not name
//
// Segments always go oldest id first through `SegmentChain::remove_segment`;
// the entry chain file and the startup asset are never candidates.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use sysinfo::Disks;
use tracing::{debug, info, warn};

use crate::chain::SegmentChain;
use crate::manifest::Manifest;

/// `(bytes_used, bytes_total)` for the filesystem holding a path.
pub trait DiskUsage: Send {
    fn usage(&mut self, path: &Path) -> Option<(u64, u64)>;
}

/// Disk usage from `sysinfo`, matched to the most specific mount point.
#[derive(Debug, Default)]
pub struct SystemDiskUsage;

impl SystemDiskUsage {
    pub fn new() -> Self {
        Self
    }
}

impl DiskUsage for SystemDiskUsage {
    fn usage(&mut self, path: &Path) -> Option<(u64, u64)> {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();

        // Longest matching mount point wins.
        let mut best: Option<(&sysinfo::Disk, usize)> = None;
        for disk in disks.list() {
            let mount = disk.mount_point();
            if path.starts_with(mount) {
                let len = mount.as_os_str().len();
                if best.is_none_or(|(_, l)| len > l) {
                    best = Some((disk, len));
                }
            }
        }

        let (disk, _) = best?;
        let total = disk.total_space();
        let used = total.saturating_sub(disk.available_space());
        Some((used, total))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvictionPolicy {
    pub retention: Duration,
    /// Used fraction of the served filesystem above which segments are dropped.
    pub usage_threshold: f64,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(90 * 60),
            usage_threshold: 0.8,
        }
    }
}

/// What a full eviction run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub aged_out: Vec<u64>,
    pub reclaimed: Vec<u64>,
    pub strays: Vec<String>,
}

impl EvictionReport {
    pub fn removed_segments(&self) -> bool {
        !self.aged_out.is_empty() || !self.reclaimed.is_empty()
    }
}

pub struct Evictor {
    policy: EvictionPolicy,
    disk: Box<dyn DiskUsage>,
}

impl Evictor {
    pub fn new(policy: EvictionPolicy, disk: Box<dyn DiskUsage>) -> Self {
        Self { policy, disk }
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    pub fn run(
        &mut self,
        chain: &SegmentChain,
        work_dir: &Path,
        manifest: &Manifest,
    ) -> Result<EvictionReport> {
        let aged_out = self.age_pass(chain, SystemTime::now())?;
        let reclaimed = self.usage_pass(chain)?;
        let strays = sweep_strays(work_dir, manifest)?;
        Ok(EvictionReport {
            aged_out,
            reclaimed,
            strays,
        })
    }

    pub fn age_pass(&self, chain: &SegmentChain, now: SystemTime) -> Result<Vec<u64>> {
        let Some(cutoff) = now.checked_sub(self.policy.retention) else {
            return Ok(Vec::new());
        };
        let mut removed = Vec::new();
        // Only a prefix of the chain may go: a fresh segment keeps every
        // later one alive, whatever their mtimes say.
        for seg in chain.segments()? {
            if seg.modified >= cutoff {
                break;
            }
            info!(
                "cleaning up {} (older than {:?})",
                seg.video_file.display(),
                self.policy.retention
            );
            chain.remove_segment(seg.id)?;
            removed.push(seg.id);
        }
        Ok(removed)
    }

    pub fn usage_pass(&mut self, chain: &SegmentChain) -> Result<Vec<u64>> {
        let mut queue = chain.segments()?.into_iter();
        let mut removed = Vec::new();

        loop {
            let dir = chain.media_dir();
            let Some((used, total)) = self.disk.usage(dir) else {
                warn!("disk usage unknown for {}; skipping usage pass", dir.display());
                break;
            };
            if total == 0 {
                warn!("filesystem for {} reports zero size; skipping usage pass", dir.display());
                break;
            }
            let fraction = used as f64 / total as f64;
            debug!("disk usage: {used} of {total} ({:.1}%)", fraction * 100.0);
            if fraction <= self.policy.usage_threshold {
                break;
            }
            // Nothing left to give back: stop quietly.
            let Some(seg) = queue.next() else {
                break;
            };
            info!(
                "removing {} to free disk ({:.1}% > {:.1}%)",
                seg.video_file.display(),
                fraction * 100.0,
                self.policy.usage_threshold * 100.0
            );
            chain.remove_segment(seg.id)?;
            removed.push(seg.id);
        }
        Ok(removed)
    }
}

/// Remove every entry of `work_dir` whose name the manifest does not list.
pub fn sweep_strays(work_dir: &Path, manifest: &Manifest) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    let rd = match fs::read_dir(work_dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read_dir({})", work_dir.display()))
        }
    };

    for ent in rd {
        let ent = ent.context("failed to read_dir entry")?;
        let name = ent.file_name().to_string_lossy().to_string();
        if manifest.contains(&name) {
            continue;
        }
        let path: PathBuf = ent.path();
        info!("removing errant temporary file: {name}");
        let res = if ent.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match res {
            Ok(()) => removed.push(name),
            Err(e) => warn!("failed to remove {}: {e}", path.display()),
        }
    }
    Ok(removed)
}
