// Segment chain: the linked list of ffconcat playlists the stream player walks.
//
//   playlist0.txt (entry)  -> startup.flv, playlistK.txt
//   playlistK.txt          -> segmentK.flv, playlistK+1.txt
//   ...
//
// The newest playlist always names a successor that does not exist yet; the
// player stalls on it until the next append creates it. Slot 0 is the entry
// pointer. Slot 1 starts life as the other half of the bootstrap loop
// (startup.flv <-> playlist0.txt) and becomes a real segment on the first
// append.
//
// This is the only writer of the served directory.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::natural::{natural_cmp, sort_natural};

pub const FORMAT_MARKER: &str = "ffconcat version 1.0";
pub const ENTRY_ID: u64 = 0;
pub const BOOTSTRAP_ID: u64 = 1;

const CHAIN_PREFIX: &str = "playlist";
const CHAIN_SUFFIX: &str = ".txt";
const SEGMENT_PREFIX: &str = "segment";
const SEGMENT_SUFFIX: &str = ".flv";

pub fn chain_file_name(id: u64) -> String {
    format!("{CHAIN_PREFIX}{id}{CHAIN_SUFFIX}")
}

pub fn segment_file_name(id: u64) -> String {
    format!("{SEGMENT_PREFIX}{id}{SEGMENT_SUFFIX}")
}

fn parse_numbered(name: &str, prefix: &str, suffix: &str) -> Option<u64> {
    let digits = name.strip_prefix(prefix)?.strip_suffix(suffix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

pub fn parse_chain_file_name(name: &str) -> Option<u64> {
    parse_numbered(name, CHAIN_PREFIX, CHAIN_SUFFIX)
}

pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    parse_numbered(name, SEGMENT_PREFIX, SEGMENT_SUFFIX)
}

/// One node of the list: play `asset`, then continue with `next`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainFile {
    pub asset: String,
    pub next: String,
}

impl ChainFile {
    pub fn render(&self) -> String {
        format!("{FORMAT_MARKER}\nfile {}\nfile {}\n", self.asset, self.next)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        match lines.next() {
            Some(FORMAT_MARKER) => {}
            other => bail!("missing format marker (found {other:?})"),
        }
        let mut entry = || -> Result<String> {
            let line = lines.next().context("truncated chain file")?;
            let name = line
                .strip_prefix("file ")
                .with_context(|| format!("expected `file <name>`, got {line:?}"))?;
            Ok(name.trim().to_string())
        };
        let asset = entry()?;
        let next = entry()?;
        Ok(Self { asset, next })
    }
}

/// A freshly published segment.
#[derive(Debug, Clone)]
pub struct Segment {
    pub id: u64,
    pub video_file: PathBuf,
    pub chain_file: PathBuf,
    pub duration_seconds: f64,
    pub created_at: SystemTime,
}

/// A segment found on disk (duration unknown, age from mtime).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSegment {
    pub id: u64,
    pub video_file: PathBuf,
    pub chain_file: PathBuf,
    pub modified: SystemTime,
}

/// Why the bootstrap needs rebuilding, if it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapHealth {
    Healthy,
    MissingChain,
    MissingStartupAsset,
}

#[derive(Debug, thiserror::Error)]
pub enum AppendError {
    /// The video never made it into the served directory; nothing changed.
    #[error("copying {src} into the served directory failed")]
    Copy {
        src: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The served directory refused a chain write; the copied video is gone again.
    #[error("writing {path} failed")]
    Chain {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug)]
pub struct SegmentChain {
    media_dir: PathBuf,
    startup_asset: String,
    /// Last allocated segment id; 0 means none yet.
    counter: u64,
}

impl SegmentChain {
    pub fn new(media_dir: impl Into<PathBuf>, startup_asset: impl Into<String>) -> Self {
        Self {
            media_dir: media_dir.into(),
            startup_asset: startup_asset.into(),
            counter: 0,
        }
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    pub fn startup_asset(&self) -> &str {
        &self.startup_asset
    }

    pub fn startup_path(&self) -> PathBuf {
        self.media_dir.join(&self.startup_asset)
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn chain_path(&self, id: u64) -> PathBuf {
        self.media_dir.join(chain_file_name(id))
    }

    pub fn video_path(&self, id: u64) -> PathBuf {
        self.media_dir.join(segment_file_name(id))
    }

    pub fn entry_path(&self) -> PathBuf {
        self.chain_path(ENTRY_ID)
    }

    pub fn read_chain(&self, id: u64) -> Result<ChainFile> {
        let path = self.chain_path(id);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        ChainFile::parse(&text).with_context(|| format!("malformed {}", path.display()))
    }

    /// Write via temp file + rename so the player never reads half a node.
    fn write_chain(&self, id: u64, node: &ChainFile) -> io::Result<PathBuf> {
        let path = self.chain_path(id);
        let tmp = self.media_dir.join(format!(".{}.tmp", chain_file_name(id)));
        let res = fs::File::create(&tmp)
            .and_then(|mut f| {
                f.write_all(node.render().as_bytes())?;
                f.sync_all()
            })
            .and_then(|()| fs::rename(&tmp, &path));
        if let Err(e) = res {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        Ok(path)
    }

    /// The entry must exist and lead somewhere. Slot 1 itself may be gone
    /// once eviction has moved past it.
    pub fn bootstrap_health(&self) -> BootstrapHealth {
        let has_successor = self
            .chain_ids()
            .map(|ids| ids.iter().any(|id| *id != ENTRY_ID))
            .unwrap_or(false);
        if !self.entry_path().is_file() || !has_successor {
            BootstrapHealth::MissingChain
        } else if !self.startup_path().is_file() {
            BootstrapHealth::MissingStartupAsset
        } else {
            BootstrapHealth::Healthy
        }
    }

    /// Rewrite the two-node bootstrap loop and restart numbering.
    ///
    /// playlist0 -> startup, playlist1; playlist1 -> startup, playlist0.
    /// Numbering restarts at 1, so nodes left from before are dropped first;
    /// a renumbered chain must never link into one of them.
    pub fn write_bootstrap(&mut self) -> Result<()> {
        fs::create_dir_all(&self.media_dir)
            .with_context(|| format!("failed to create {}", self.media_dir.display()))?;
        let stale: Vec<u64> = self
            .segments()?
            .into_iter()
            .map(|s| s.id)
            .chain(self.chain_ids()?)
            .filter(|id| *id != ENTRY_ID)
            .collect();
        for id in stale {
            warn!("dropping stale segment {id} before rebuilding the bootstrap chain");
            self.remove_segment(id)?;
        }
        let entry = ChainFile {
            asset: self.startup_asset.clone(),
            next: chain_file_name(BOOTSTRAP_ID),
        };
        let loopback = ChainFile {
            asset: self.startup_asset.clone(),
            next: chain_file_name(ENTRY_ID),
        };
        self.write_chain(ENTRY_ID, &entry)
            .context("failed to write entry chain file")?;
        self.write_chain(BOOTSTRAP_ID, &loopback)
            .context("failed to write bootstrap chain file")?;
        self.counter = 0;
        info!("bootstrap chain rebuilt; segment counter reset to 0");
        Ok(())
    }

    /// Chain ids present on disk, in natural file-name order.
    pub fn chain_ids(&self) -> Result<Vec<u64>> {
        let mut names = Vec::new();
        let rd = fs::read_dir(&self.media_dir)
            .with_context(|| format!("failed to read_dir({})", self.media_dir.display()))?;
        for ent in rd {
            let ent = ent.context("failed to read_dir entry")?;
            let name = ent.file_name().to_string_lossy().to_string();
            if parse_chain_file_name(&name).is_some() && ent.path().is_file() {
                names.push(name);
            }
        }
        sort_natural(&mut names);
        Ok(names.iter().filter_map(|n| parse_chain_file_name(n)).collect())
    }

    /// Segments with a video on disk, oldest id first.
    pub fn segments(&self) -> Result<Vec<StoredSegment>> {
        let mut found = Vec::new();
        let rd = fs::read_dir(&self.media_dir)
            .with_context(|| format!("failed to read_dir({})", self.media_dir.display()))?;
        for ent in rd {
            let ent = ent.context("failed to read_dir entry")?;
            let name = ent.file_name().to_string_lossy().to_string();
            let Some(id) = parse_segment_file_name(&name) else {
                continue;
            };
            if id == ENTRY_ID {
                continue;
            }
            let meta = ent
                .metadata()
                .with_context(|| format!("failed to stat {name}"))?;
            if !meta.is_file() {
                continue;
            }
            found.push((
                name,
                StoredSegment {
                    id,
                    video_file: ent.path(),
                    chain_file: self.chain_path(id),
                    modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                },
            ));
        }
        found.sort_by(|(a, _), (b, _)| natural_cmp(a, b));
        Ok(found.into_iter().map(|(_, s)| s).collect())
    }

    /// Resume numbering after a restart: the highest chain id on disk is the
    /// last allocated one. Slot 1 only counts once it holds a real segment.
    pub fn recover_counter(&mut self) -> Result<u64> {
        let last = self.chain_ids()?.into_iter().max().unwrap_or(ENTRY_ID);
        let counter = if last == BOOTSTRAP_ID {
            match self.read_chain(BOOTSTRAP_ID) {
                Ok(node) if node.asset == self.startup_asset => 0,
                Ok(_) => BOOTSTRAP_ID,
                Err(e) => {
                    warn!("unreadable bootstrap chain file, starting from 0: {e:#}");
                    0
                }
            }
        } else {
            last
        };
        self.counter = counter;
        info!("segment counter is now {counter}");
        Ok(counter)
    }

    /// Publish a rendered video as the next segment.
    ///
    /// The copy happens first; if it fails the partial file is removed and the
    /// counter is untouched. Only then is the chain node written, pointing
    /// forward at a successor that will exist after the next append.
    pub async fn append_segment(
        &mut self,
        video: &Path,
        duration_seconds: f64,
    ) -> Result<Segment, AppendError> {
        let id = self.counter + 1;
        let video_file = self.video_path(id);

        if let Err(source) = tokio::fs::copy(video, &video_file).await {
            let _ = tokio::fs::remove_file(&video_file).await;
            return Err(AppendError::Copy {
                src: video.to_path_buf(),
                source,
            });
        }

        let node = ChainFile {
            asset: segment_file_name(id),
            next: chain_file_name(id + 1),
        };
        let chain_file = match self.write_chain(id, &node) {
            Ok(path) => path,
            Err(source) => {
                let _ = fs::remove_file(&video_file);
                return Err(AppendError::Chain {
                    path: self.chain_path(id),
                    source,
                });
            }
        };

        self.counter = id;
        info!(
            "queued {} ({:.1}s) as {}",
            segment_file_name(id),
            duration_seconds,
            chain_file_name(id)
        );

        Ok(Segment {
            id,
            video_file,
            chain_file,
            duration_seconds,
            created_at: SystemTime::now(),
        })
    }

    /// Point the entry file at the oldest chain node still on disk.
    /// Returns the id it now points at, or `None` if only the entry exists.
    pub fn advance_entry(&self) -> Result<Option<u64>> {
        let Some(oldest) = self.chain_ids()?.into_iter().find(|id| *id != ENTRY_ID) else {
            debug!("no chain files besides the entry; entry left alone");
            return Ok(None);
        };
        let node = ChainFile {
            asset: self.startup_asset.clone(),
            next: chain_file_name(oldest),
        };
        self.write_chain(ENTRY_ID, &node)
            .context("failed to rewrite entry chain file")?;
        info!("entry now starts at {}", chain_file_name(oldest));
        Ok(Some(oldest))
    }

    /// Delete a segment's video and chain node. Callers remove in ascending id
    /// order only, so a sequential reader never meets a dangling reference.
    pub fn remove_segment(&self, id: u64) -> Result<()> {
        if id == ENTRY_ID {
            bail!("refusing to remove the entry chain file");
        }
        for path in [self.video_path(id), self.chain_path(id)] {
            match fs::remove_file(&path) {
                Ok(()) => debug!("removed {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to remove {}", path.display()))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn chain_in(dir: &TempDir) -> SegmentChain {
        SegmentChain::new(dir.path(), "startup.flv")
    }

    fn touch(path: &Path, bytes: &[u8]) {
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_file_names_round_trip() {
        assert_eq!(chain_file_name(12), "playlist12.txt");
        assert_eq!(segment_file_name(3), "segment3.flv");
        assert_eq!(parse_chain_file_name("playlist12.txt"), Some(12));
        assert_eq!(parse_segment_file_name("segment3.flv"), Some(3));
    }

    #[test]
    fn test_file_name_parser_is_strict() {
        assert_eq!(parse_chain_file_name("playlist.txt"), None);
        assert_eq!(parse_chain_file_name("playlist1a.txt"), None);
        assert_eq!(parse_chain_file_name(".playlist1.txt.tmp"), None);
        assert_eq!(parse_segment_file_name("segment-1.flv"), None);
        assert_eq!(parse_segment_file_name("startup.flv"), None);
    }

    #[test]
    fn test_chain_file_format() {
        let node = ChainFile {
            asset: "segment4.flv".into(),
            next: "playlist5.txt".into(),
        };
        assert_eq!(
            node.render(),
            "ffconcat version 1.0\nfile segment4.flv\nfile playlist5.txt\n"
        );
        assert_eq!(ChainFile::parse(&node.render()).unwrap(), node);
        assert!(ChainFile::parse("file a\nfile b\n").is_err());
        assert!(ChainFile::parse("ffconcat version 1.0\nfile a\n").is_err());
    }

    #[test]
    fn test_bootstrap_forms_mutual_reference() {
        let dir = TempDir::new().unwrap();
        let mut chain = chain_in(&dir);
        assert_eq!(chain.bootstrap_health(), BootstrapHealth::MissingChain);

        chain.write_bootstrap().unwrap();
        let entry = chain.read_chain(ENTRY_ID).unwrap();
        let loopback = chain.read_chain(BOOTSTRAP_ID).unwrap();
        assert_eq!(entry.asset, "startup.flv");
        assert_eq!(entry.next, "playlist1.txt");
        assert_eq!(loopback.asset, "startup.flv");
        assert_eq!(loopback.next, "playlist0.txt");
        assert_eq!(chain.counter(), 0);

        // Chains exist but the startup asset does not.
        assert_eq!(chain.bootstrap_health(), BootstrapHealth::MissingStartupAsset);
        touch(&chain.startup_path(), b"video");
        assert_eq!(chain.bootstrap_health(), BootstrapHealth::Healthy);
    }

    #[tokio::test]
    async fn test_bootstrap_survives_eviction_of_slot_one() {
        let dir = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let mut chain = chain_in(&dir);
        chain.write_bootstrap().unwrap();
        touch(&chain.startup_path(), b"video");
        let render = scratch.path().join("render.flv");
        touch(&render, b"x");

        chain.append_segment(&render, 10.0).await.unwrap();
        chain.append_segment(&render, 10.0).await.unwrap();
        chain.remove_segment(1).unwrap();
        assert_eq!(chain.bootstrap_health(), BootstrapHealth::Healthy);

        chain.remove_segment(2).unwrap();
        assert_eq!(chain.bootstrap_health(), BootstrapHealth::MissingChain);
    }

    #[tokio::test]
    async fn test_rebuilding_bootstrap_drops_stale_nodes() {
        let dir = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let mut chain = chain_in(&dir);
        chain.write_bootstrap().unwrap();
        let render = scratch.path().join("render.flv");
        touch(&render, b"x");
        for _ in 0..3 {
            chain.append_segment(&render, 10.0).await.unwrap();
        }

        chain.write_bootstrap().unwrap();
        assert_eq!(chain.counter(), 0);
        assert_eq!(chain.chain_ids().unwrap(), vec![ENTRY_ID, BOOTSTRAP_ID]);
        assert!(chain.segments().unwrap().is_empty());
        assert_eq!(chain.read_chain(BOOTSTRAP_ID).unwrap().next, "playlist0.txt");
    }

    #[test]
    fn test_recover_counter() {
        let dir = TempDir::new().unwrap();
        let mut chain = chain_in(&dir);
        chain.write_bootstrap().unwrap();
        assert_eq!(chain.recover_counter().unwrap(), 0);

        // Slot 1 holding a real segment counts.
        chain
            .write_chain(
                1,
                &ChainFile {
                    asset: segment_file_name(1),
                    next: chain_file_name(2),
                },
            )
            .unwrap();
        assert_eq!(chain.recover_counter().unwrap(), 1);

        for id in [2u64, 10, 9] {
            chain
                .write_chain(
                    id,
                    &ChainFile {
                        asset: segment_file_name(id),
                        next: chain_file_name(id + 1),
                    },
                )
                .unwrap();
        }
        assert_eq!(chain.recover_counter().unwrap(), 10);
    }

    #[tokio::test]
    async fn test_append_links_forward_and_counts_up() {
        let dir = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let mut chain = chain_in(&dir);
        chain.write_bootstrap().unwrap();

        let render = scratch.path().join("render.flv");
        touch(&render, b"rendered");

        let first = chain.append_segment(&render, 180.0).await.unwrap();
        let second = chain.append_segment(&render, 200.0).await.unwrap();
        assert_eq!((first.id, second.id), (1, 2));
        assert_eq!(chain.counter(), 2);

        assert!(dir.path().join("segment1.flv").is_file());
        assert!(dir.path().join("segment2.flv").is_file());
        let node = chain.read_chain(2).unwrap();
        assert_eq!(node.asset, "segment2.flv");
        assert_eq!(node.next, "playlist3.txt");
        assert!(!chain.chain_path(3).exists());
        // The original render stays with the caller.
        assert!(render.exists());
    }

    #[tokio::test]
    async fn test_failed_copy_mutates_nothing() {
        let dir = TempDir::new().unwrap();
        let mut chain = chain_in(&dir);
        chain.write_bootstrap().unwrap();

        let missing = dir.path().join("does-not-exist.flv");
        let err = chain.append_segment(&missing, 60.0).await.unwrap_err();
        assert!(matches!(err, AppendError::Copy { .. }));
        assert_eq!(chain.counter(), 0);
        assert!(!chain.video_path(1).exists());
        // Slot 1 is still the bootstrap loop.
        assert_eq!(chain.read_chain(1).unwrap().next, "playlist0.txt");
    }

    #[tokio::test]
    async fn test_failed_chain_write_rolls_back() {
        let dir = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let mut chain = chain_in(&dir);
        chain.write_bootstrap().unwrap();
        let render = scratch.path().join("render.flv");
        touch(&render, b"rendered");
        chain.append_segment(&render, 60.0).await.unwrap();

        // A non-empty directory where playlist2.txt should land blocks the rename.
        std::fs::create_dir(chain.chain_path(2)).unwrap();
        touch(&chain.chain_path(2).join("keep"), b"x");

        let err = chain.append_segment(&render, 60.0).await.unwrap_err();
        assert!(matches!(err, AppendError::Chain { .. }));
        let os = std::error::Error::source(&err).unwrap().to_string();
        let report = format!("{:#}", anyhow::Error::from(err));
        assert_eq!(report.matches(os.as_str()).count(), 1, "{report}");
        assert_eq!(chain.counter(), 1);
        assert!(!chain.video_path(2).exists());
        assert!(!dir.path().join(".playlist2.txt.tmp").exists());
        assert_eq!(chain.read_chain(1).unwrap().next, "playlist2.txt");
    }

    #[tokio::test]
    async fn test_advance_entry_tracks_oldest_node() {
        let dir = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let mut chain = chain_in(&dir);
        chain.write_bootstrap().unwrap();
        let render = scratch.path().join("render.flv");
        touch(&render, b"x");

        for _ in 0..11 {
            chain.append_segment(&render, 10.0).await.unwrap();
        }
        assert_eq!(chain.advance_entry().unwrap(), Some(1));

        for id in 1..=8 {
            chain.remove_segment(id).unwrap();
        }
        // Textually playlist10.txt < playlist9.txt; numerically it is not.
        assert_eq!(chain.advance_entry().unwrap(), Some(9));
        let entry = chain.read_chain(ENTRY_ID).unwrap();
        assert_eq!(entry.asset, "startup.flv");
        assert_eq!(entry.next, "playlist9.txt");
    }

    #[test]
    fn test_advance_entry_without_nodes_is_noop() {
        let dir = TempDir::new().unwrap();
        let chain = chain_in(&dir);
        let before = ChainFile {
            asset: "startup.flv".into(),
            next: "playlist7.txt".into(),
        };
        chain.write_chain(ENTRY_ID, &before).unwrap();
        assert_eq!(chain.advance_entry().unwrap(), None);
        assert_eq!(chain.read_chain(ENTRY_ID).unwrap(), before);
    }

    #[test]
    fn test_segments_listing_and_removal() {
        let dir = TempDir::new().unwrap();
        let chain = chain_in(&dir);
        for id in [10u64, 2, 1] {
            touch(&chain.video_path(id), b"v");
            touch(&chain.chain_path(id), b"c");
        }
        touch(&chain.startup_path(), b"s");
        touch(&dir.path().join("notes.txt"), b"n");

        let ids: Vec<u64> = chain.segments().unwrap().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2, 10]);

        chain.remove_segment(2).unwrap();
        assert!(!chain.video_path(2).exists());
        assert!(!chain.chain_path(2).exists());
        // Already gone is fine.
        chain.remove_segment(2).unwrap();
        assert!(chain.remove_segment(ENTRY_ID).is_err());
        assert!(chain.startup_path().exists());
    }
}
