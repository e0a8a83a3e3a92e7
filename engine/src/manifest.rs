use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};

/// File names allowed to live in the working directory. Anything else found
/// there after a production cycle is debris and gets swept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    names: BTreeSet<String>,
}

impl Manifest {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names = names
            .into_iter()
            .map(Into::into)
            .map(|n: String| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        Self { names }
    }

    /// One name per line; blank lines ignored. A missing file yields an
    /// empty manifest (callers add the names they always need).
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Self::new(text.lines())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("failed to read manifest {}", path.display())),
        }
    }

    pub fn with<S: Into<String>>(mut self, name: S) -> Self {
        let name = name.into();
        if !name.trim().is_empty() {
            self.names.insert(name.trim().to_string());
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}
