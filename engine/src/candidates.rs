// Remote candidate list: parsing, fingerprinting, extension allow-list.
//
// The list is a text body of URLs. Some sources deliver real newlines, others
// deliver the two characters `\` `n` between entries, so the separator is
// configurable; `Auto` accepts both.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListFormat {
    Newline,
    EscapedNewline,
    #[default]
    Auto,
}

impl FromStr for ListFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "newline" => Ok(Self::Newline),
            "escaped_newline" | "escaped" => Ok(Self::EscapedNewline),
            "auto" | "" => Ok(Self::Auto),
            other => anyhow::bail!("unknown list format: {other}"),
        }
    }
}

impl fmt::Display for ListFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Newline => "newline",
            Self::EscapedNewline => "escaped_newline",
            Self::Auto => "auto",
        })
    }
}

/// Content fingerprint of the raw body, used to detect list changes.
pub fn fingerprint(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

pub fn parse_list(body: &str, format: ListFormat) -> Vec<String> {
    let pieces: Vec<&str> = match format {
        ListFormat::Newline => body.lines().collect(),
        ListFormat::EscapedNewline => body.split("\\n").collect(),
        ListFormat::Auto => body.lines().flat_map(|l| l.split("\\n")).collect(),
    };
    pieces
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Lower-cased extension of the last path segment, ignoring query/fragment.
pub fn extension_of(candidate: &str) -> Option<String> {
    let end = candidate.find(['?', '#']).unwrap_or(candidate.len());
    let path = &candidate[..end];
    let last = path.rsplit('/').next()?;
    let (stem, ext) = last.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Lower-cased last path segment, the name a candidate is stored under.
pub fn file_name_of(candidate: &str) -> Option<String> {
    let end = candidate.find(['?', '#']).unwrap_or(candidate.len());
    let last = candidate[..end].rsplit('/').next()?.trim();
    if last.is_empty() {
        return None;
    }
    Some(last.to_ascii_lowercase())
}

/// Allowed file extensions (lower case, no dot).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extensions(BTreeSet<String>);

impl Extensions {
    pub fn new<I, S>(exts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            exts.into_iter()
                .map(|e| e.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        )
    }

    pub fn allows_ext(&self, ext: &str) -> bool {
        self.0.contains(&ext.to_ascii_lowercase())
    }

    pub fn allows(&self, candidate: &str) -> bool {
        extension_of(candidate).is_some_and(|e| self.0.contains(&e))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// A fetched list, already filtered to allow-listed entries.
#[derive(Debug, Clone)]
pub struct CandidateList {
    pub fingerprint: String,
    pub total: usize,
    pub playable: Vec<String>,
}

impl CandidateList {
    pub fn from_body(body: &[u8], format: ListFormat, extensions: &Extensions) -> Self {
        let text = String::from_utf8_lossy(body);
        let all = parse_list(&text, format);
        let total = all.len();
        let playable = all.into_iter().filter(|c| extensions.allows(c)).collect();
        Self {
            fingerprint: fingerprint(body),
            total,
            playable,
        }
    }

    /// Uniformly random allow-listed entry.
    pub fn pick(&self, rng: &mut fastrand::Rng) -> Option<&str> {
        if self.playable.is_empty() {
            return None;
        }
        Some(self.playable[rng.usize(..self.playable.len())].as_str())
    }
}
