// Candidate acquisition: download into the attempt's scratch dir and, for zip
// archives, unpack and pick a playable member at random. Archives may nest;
// the walk stops after MAX_ARCHIVE_DEPTH levels.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info};

use crate::candidates::{extension_of, file_name_of, Extensions};
use crate::fetch::Fetcher;
use crate::production::SkipReason;
use crate::scratch::ScratchDir;

pub const ARCHIVE_EXT: &str = "zip";
pub const MAX_ARCHIVE_DEPTH: usize = 4;

const DOWNLOAD_DIR: &str = "download";

/// A local, playable source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquired {
    pub path: PathBuf,
    /// Lower-cased file name, shown in the overlay.
    pub file_name: String,
}

pub async fn acquire(
    fetcher: &dyn Fetcher,
    url: &str,
    scratch: &ScratchDir,
    extensions: &Extensions,
    rng: &mut fastrand::Rng,
) -> Result<Acquired, SkipReason> {
    if !extensions.allows(url) {
        return Err(SkipReason::UnsupportedExtension);
    }
    let name = file_name_of(url)
        .filter(|n| n != "." && n != "..")
        .ok_or(SkipReason::UnsupportedExtension)?;

    let dir = scratch.join(DOWNLOAD_DIR);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| SkipReason::Download(anyhow!(e).context("failed to create download dir")))?;
    let dest = dir.join(&name);
    fetcher
        .download(url, &dest)
        .await
        .map_err(SkipReason::Download)?;

    let mut current = Acquired { path: dest, file_name: name };
    let mut depth = 0;
    while extension_of(&current.file_name).as_deref() == Some(ARCHIVE_EXT) {
        if depth >= MAX_ARCHIVE_DEPTH {
            return Err(SkipReason::Archive(format!(
                "archives nested deeper than {MAX_ARCHIVE_DEPTH} levels"
            )));
        }
        info!("unzipping {}", current.file_name);

        let archive = current.path.clone();
        let unpack_dir = scratch.join(format!("unpacked{depth}"));
        let exts = extensions.clone();
        let members =
            tokio::task::spawn_blocking(move || unpack_archive(&archive, &unpack_dir, &exts))
                .await
                .map_err(|e| SkipReason::Archive(format!("unpack task failed: {e}")))?
                .map_err(|e| SkipReason::Archive(format!("{e:#}")))?;

        if members.is_empty() {
            return Err(SkipReason::EmptyArchive);
        }
        let choice = &members[rng.usize(..members.len())];
        debug!("picked archive member {}", choice.display());
        current = promote(choice, &scratch.join(format!("picked{depth}")))
            .await
            .map_err(|e| SkipReason::Archive(format!("{e:#}")))?;
        depth += 1;
    }
    Ok(current)
}

/// Extract `archive` into `dest` and list every extracted file whose
/// extension is allowed (nested archives included).
pub fn unpack_archive(
    archive: &Path,
    dest: &Path,
    extensions: &Extensions,
) -> Result<Vec<PathBuf>> {
    let file =
        File::open(archive).with_context(|| format!("failed to open {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(file).context("bad zip file")?;
    std::fs::create_dir_all(dest)
        .with_context(|| format!("failed to create {}", dest.display()))?;
    zip.extract(dest).context("failed to extract archive")?;
    scan_allowed_files(dest, extensions)
}

fn scan_allowed_files(root: &Path, extensions: &Extensions) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let rd = std::fs::read_dir(&path)
            .map_err(|e| anyhow!("failed to read_dir({}): {e}", path.display()))?;
        for ent in rd {
            let ent = ent.map_err(|e| anyhow!("failed to read_dir entry: {e}"))?;
            let p = ent.path();
            if p.is_dir() {
                stack.push(p);
                continue;
            }
            if !p.is_file() {
                continue;
            }
            let Some(ext) = p.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if extensions.allows_ext(ext) {
                out.push(p);
            }
        }
    }
    // read_dir order is filesystem dependent; keep the pick reproducible per seed.
    out.sort();
    Ok(out)
}

/// Move a chosen member out of the unpack tree under its lower-cased name.
async fn promote(member: &Path, dir: &Path) -> Result<Acquired> {
    let file_name = member
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .context("archive member has no file name")?;
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(&file_name);
    tokio::fs::rename(member, &path)
        .await
        .with_context(|| format!("failed to move {}", member.display()))?;
    Ok(Acquired { path, file_name })
}
