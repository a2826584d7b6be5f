//! Local storage prober.
//!
//! Inspects the acquisition directory to determine the actual completion
//! state of a product, independent of whatever state the registry persisted.
//! Its finding is the source of truth that can short-circuit a pending
//! remote retry the moment data appears locally, including data placed
//! out-of-band.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

/// Suffix of a complete product archive.
pub const ARCHIVE_SUFFIX: &str = ".zip";
/// Suffix of an extracted product directory.
pub const EXTRACTED_SUFFIX: &str = ".SAFE";
/// Suffix left behind by an interrupted download.
pub const INCOMPLETE_SUFFIX: &str = ".incomplete";

/// What the prober found in local storage for one title.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalProbe {
    /// A complete archive or extracted directory exists.
    Available,
    /// Only a partial download marker exists.
    Incomplete,
    /// No title-prefixed entry gives any evidence; the caller keeps its
    /// persisted state.
    NoEvidence,
}

/// Probes the acquisition directory for title-prefixed product artifacts.
#[derive(Debug, Clone)]
pub struct StorageProber {
    data_dir: PathBuf,
}

impl StorageProber {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Classify the local evidence for a product title.
    pub fn probe(&self, title: &str) -> Result<LocalProbe> {
        // An empty title would prefix-match every entry in the directory.
        if title.is_empty() {
            return Ok(LocalProbe::NoEvidence);
        }

        let entries = match std::fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LocalProbe::NoEvidence);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to list data dir {:?}", self.data_dir));
            }
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| "Failed to read data dir entry")?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(title) {
                names.push(name);
            }
        }
        debug!("Found {} local entries for title {}", names.len(), title);

        if names
            .iter()
            .any(|n| n.ends_with(ARCHIVE_SUFFIX) || n.ends_with(EXTRACTED_SUFFIX))
        {
            return Ok(LocalProbe::Available);
        }
        if names.iter().any(|n| n.ends_with(INCOMPLETE_SUFFIX)) {
            return Ok(LocalProbe::Incomplete);
        }
        Ok(LocalProbe::NoEvidence)
    }
}
