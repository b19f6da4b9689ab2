// Reverie Engine — Scan Manifest
// Tracks which conversation files have completed the memory stage for a
// run directory. Append-memories runs consult it to skip files that were
// already mined; `force_rerun` clears it. Same single-writer flush
// discipline as the checkpoint store.

use crate::atoms::error::EngineResult;
use crate::engine::fsio;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannedFile {
    pub file_size: u64,
    pub file_mtime_ms: u64,
    pub scanned_at_utc: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScanManifest {
    pub input_dir: String,
    pub created_at_utc: String,
    pub updated_at_utc: String,
    pub scanned_files: BTreeMap<String, ScannedFile>,
}

impl ScanManifest {
    fn fresh(input_dir: &Path) -> Self {
        let now = Utc::now().to_rfc3339();
        ScanManifest {
            input_dir: input_dir.to_string_lossy().into_owned(),
            created_at_utc: now.clone(),
            updated_at_utc: now,
            scanned_files: BTreeMap::new(),
        }
    }

    /// A file counts as scanned only when size and mtime both match.
    pub fn is_scanned(&self, file_name: &str, size: u64, mtime_ms: u64) -> bool {
        self.scanned_files
            .get(file_name)
            .map(|e| e.file_size == size && e.file_mtime_ms == mtime_ms)
            .unwrap_or(false)
    }
}

/// `(size, mtime ms)` of a file on disk.
pub fn file_info(path: &Path) -> EngineResult<(u64, u64)> {
    let meta = std::fs::metadata(path)?;
    let mtime_ms = meta
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    Ok((meta.len(), mtime_ms))
}

pub struct ScanManifestStore {
    path: PathBuf,
    state: Mutex<ScanManifest>,
}

impl ScanManifestStore {
    /// Load the run's manifest, or start fresh when missing, unreadable, or
    /// `fresh_scan` is requested.
    pub fn load_or_new(path: impl Into<PathBuf>, input_dir: &Path, fresh_scan: bool) -> Self {
        let path = path.into();
        let state = if fresh_scan {
            ScanManifest::fresh(input_dir)
        } else {
            std::fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<ScanManifest>(&raw).ok())
                .unwrap_or_else(|| ScanManifest::fresh(input_dir))
        };
        ScanManifestStore {
            path,
            state: Mutex::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> ScanManifest {
        self.state.lock().await.clone()
    }

    /// Record memory-stage completion for one file and flush.
    pub async fn record(&self, file_name: &str, size: u64, mtime_ms: u64) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        state.scanned_files.insert(
            file_name.to_string(),
            ScannedFile {
                file_size: size,
                file_mtime_ms: mtime_ms,
                scanned_at_utc: Utc::now().to_rfc3339(),
            },
        );
        state.updated_at_utc = Utc::now().to_rfc3339();
        fsio::write_json_durable(&self.path, &*state)
    }

    /// Persist the current state even when nothing changed this run.
    pub async fn flush(&self) -> EngineResult<()> {
        let state = self.state.lock().await;
        fsio::write_json_durable(&self.path, &*state)
    }
}
