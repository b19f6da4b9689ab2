// Reverie Engine — Durable File Writes
// Manifest, checkpoint, and artifact writes go through write-then-rename so
// a crash mid-write never leaves a half-formed file where a consumer might
// read it. Writes are retried once; the second failure propagates.

use crate::atoms::error::EngineResult;
use serde::Serialize;
use std::path::Path;

/// Atomically replace `path` with `bytes` via a sibling temp file.
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> EngineResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let tmp = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("out")
    ));
    let result = std::fs::write(&tmp, bytes).and_then(|_| std::fs::rename(&tmp, path));
    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Atomic write with a single retry on failure.
pub fn write_bytes_durable(path: &Path, bytes: &[u8]) -> EngineResult<()> {
    match write_bytes_atomic(path, bytes) {
        Ok(()) => Ok(()),
        Err(first) => {
            log::warn!(
                "[fsio] Write to {} failed ({}), retrying once",
                path.display(),
                first
            );
            write_bytes_atomic(path, bytes)
        }
    }
}

/// Pretty-printed JSON, written atomically with one retry.
pub fn write_json_durable<T: Serialize>(path: &Path, value: &T) -> EngineResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_bytes_durable(path, &bytes)
}

/// Plain text, written atomically with one retry.
pub fn write_text_durable(path: &Path, text: &str) -> EngineResult<()> {
    write_bytes_durable(path, text.as_bytes())
}
