// Scoped scratch space for one candidate attempt.
//
// Every download, extracted archive, intermediate AAC and render lives inside
// one of these; dropping it removes the lot, whichever way the attempt ended.
// The manifest sweep only has to catch what a crash left behind.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;
use tracing::debug;

pub const SCRATCH_PREFIX: &str = "scratch-";

#[derive(Debug)]
pub struct ScratchDir {
    dir: TempDir,
}

impl ScratchDir {
    pub fn acquire(work_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(work_dir)
            .with_context(|| format!("failed to create {}", work_dir.display()))?;
        let dir = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(work_dir)
            .with_context(|| format!("failed to create scratch dir in {}", work_dir.display()))?;
        debug!("scratch dir {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.dir.path().join(name)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        debug!("cleaning scratch dir {}", self.dir.path().display());
    }
}
