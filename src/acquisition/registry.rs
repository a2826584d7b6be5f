//! Acquisition registry storage and persistence.
//!
//! Keeps the per-id acquisition records in memory and snapshots them
//! wholesale to a flat keyed file, one record per id. The file is loaded
//! in full at startup; `persist` writes it in full at explicit checkpoints
//! only (never automatically after background mutations).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::info;

use super::models::{AcquisitionRequest, RequestState};

/// Trait for acquisition record storage.
pub trait AcquisitionRegistry: Send + Sync {
    /// Get a record by product id.
    fn get(&self, id: &str) -> Option<AcquisitionRequest>;

    /// Insert or replace the record for its id.
    fn upsert(&self, record: AcquisitionRequest);

    /// List all records currently in a given state.
    fn list_by_state(&self, state: RequestState) -> Vec<AcquisitionRequest>;

    /// Remove the record for an id. Returns true if a record existed.
    fn remove(&self, id: &str) -> bool;

    /// Flush the full in-memory table to durable storage.
    fn persist(&self) -> Result<()>;

    /// Merge records from durable storage into memory. Idempotent; an id
    /// already present in memory is never overwritten by the on-disk copy.
    fn load(&self) -> Result<()>;
}

/// File-backed registry persisting a wholesale JSON snapshot.
pub struct FileBackedRegistry {
    path: PathBuf,
    records: Mutex<HashMap<String, AcquisitionRequest>>,
}

impl FileBackedRegistry {
    /// Open a registry backed by the given snapshot file.
    ///
    /// A missing file yields an empty registry, not an error.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create registry dir {:?}", parent))?;
        }
        let registry = Self {
            path,
            records: Mutex::new(HashMap::new()),
        };
        registry.load()?;
        Ok(registry)
    }

    fn read_snapshot(&self) -> Result<Vec<AcquisitionRequest>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read registry file {:?}", self.path));
            }
        };
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse registry file {:?}", self.path))
    }
}

impl AcquisitionRegistry for FileBackedRegistry {
    fn get(&self, id: &str) -> Option<AcquisitionRequest> {
        self.records.lock().unwrap().get(id).cloned()
    }

    fn upsert(&self, record: AcquisitionRequest) {
        self.records
            .lock()
            .unwrap()
            .insert(record.id.clone(), record);
    }

    fn list_by_state(&self, state: RequestState) -> Vec<AcquisitionRequest> {
        let mut records: Vec<_> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.state == state)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    fn remove(&self, id: &str) -> bool {
        self.records.lock().unwrap().remove(id).is_some()
    }

    fn persist(&self) -> Result<()> {
        let mut snapshot: Vec<AcquisitionRequest> =
            self.records.lock().unwrap().values().cloned().collect();
        snapshot.sort_by(|a, b| a.id.cmp(&b.id));

        let json = serde_json::to_string_pretty(&snapshot)
            .context("Failed to serialize registry snapshot")?;

        // Write-then-rename so a crash mid-write never truncates the table.
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)
            .with_context(|| format!("Failed to write registry snapshot {:?}", tmp_path))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to move registry snapshot into {:?}", self.path))?;
        Ok(())
    }

    fn load(&self) -> Result<()> {
        let snapshot = self.read_snapshot()?;
        if snapshot.is_empty() {
            return Ok(());
        }
        let mut records = self.records.lock().unwrap();
        let mut merged = 0;
        for record in snapshot {
            // In-memory state is always newer than the snapshot.
            if !records.contains_key(&record.id) {
                records.insert(record.id.clone(), record);
                merged += 1;
            }
        }
        if merged > 0 {
            info!("Loaded {} acquisition records from {:?}", merged, self.path);
        }
        Ok(())
    }
}
