// Reverie Engine — Extraction Cache
// Content-addressed per-source cache that makes re-runs free: keyed by
// `(source fingerprint, model)`, it holds one cleaned conversation file per
// conversation. A cache directory either contains a complete extraction for
// the pair or is treated as absent; partial writes from a crashed run are
// cleared by the next run writing fresh.

use crate::atoms::constants::IMPLICIT_ANTHROPIC_MODEL_TAG;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::Role;
use crate::engine::formats::{
    self, anthropic, openai, ConversationWriter, ExportFileFormat, ExportFormat,
};
use crate::engine::opener;
use crate::engine::stream::JsonArrayStream;
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const MANIFEST_FILE: &str = "extraction_manifest.json";
const MODEL_EXPORTS_DIR: &str = "model_exports";

// ── Fingerprint ────────────────────────────────────────────────────────────

/// Stable identity of one source export file.
#[derive(Debug, Clone)]
pub struct SourceFingerprint {
    pub hex: String,
    pub resolved_path: PathBuf,
    pub size_bytes: u64,
    pub mtime_ms: u64,
}

/// Hash `(resolved absolute path, size, floor(mtime ms))` so the cache key
/// survives renames-in-place but not content changes.
pub fn source_fingerprint(path: &Path) -> EngineResult<SourceFingerprint> {
    let resolved = std::fs::canonicalize(path)?;
    let meta = std::fs::metadata(&resolved)?;
    let mtime_ms = meta
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    let mut hasher = Sha256::new();
    hasher.update(resolved.to_string_lossy().as_bytes());
    hasher.update(b"|");
    hasher.update(meta.len().to_le_bytes());
    hasher.update(b"|");
    hasher.update(mtime_ms.to_le_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(16).map(|b| format!("{b:02x}")).collect();

    Ok(SourceFingerprint {
        hex,
        resolved_path: resolved,
        size_bytes: meta.len(),
        mtime_ms,
    })
}

// ── Manifest ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelCacheEntry {
    pub file_count: usize,
    pub reused_extraction: bool,
    pub extracted_in_last_run: bool,
    pub format: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheManifest {
    pub source_file_path: String,
    pub source_file_size_bytes: u64,
    pub source_file_mtime_ms: u64,
    pub source_fingerprint: String,
    pub cache_root: String,
    pub model_exports_dir: String,
    pub models: BTreeMap<String, ModelCacheEntry>,
}

// ── Cache ──────────────────────────────────────────────────────────────────

/// Result of `ensure`: the cleaned conversation files for the pair, plus
/// whether a prior extraction was reused.
#[derive(Debug, Clone)]
pub struct EnsureOutcome {
    pub fingerprint: String,
    pub format: ExportFormat,
    pub model_dir: PathBuf,
    pub files: Vec<PathBuf>,
    pub reused_extraction: bool,
}

pub struct ExtractionCache {
    root: PathBuf,
}

impl ExtractionCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ExtractionCache { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn manifest_path(&self, fingerprint: &str) -> PathBuf {
        self.root.join(fingerprint).join(MANIFEST_FILE)
    }

    fn model_dir(&self, fingerprint: &str, model: &str) -> PathBuf {
        self.root
            .join(fingerprint)
            .join(MODEL_EXPORTS_DIR)
            .join(formats::sanitize_component(model))
    }

    fn load_manifest(&self, fingerprint: &str) -> Option<CacheManifest> {
        let raw = std::fs::read_to_string(self.manifest_path(fingerprint)).ok()?;
        match serde_json::from_str(&raw) {
            Ok(m) => Some(m),
            Err(e) => {
                warn!("[cache] Manifest unreadable for {fingerprint}: {e}");
                None
            }
        }
    }

    /// Ensure a complete extraction exists for `(source, model)`. Reuses the
    /// cached files when the manifest records a non-empty extraction for the
    /// pair; otherwise streams the source and writes fresh.
    pub fn ensure(&self, source: &Path, model: &str) -> EngineResult<EnsureOutcome> {
        let fp = source_fingerprint(source)?;
        let model_dir = self.model_dir(&fp.hex, model);
        let mut manifest = self.load_manifest(&fp.hex).unwrap_or_default();

        let recorded = manifest.models.get(&formats::sanitize_component(model));
        let existing = list_conversation_files(&model_dir);
        if recorded.map(|e| e.file_count).unwrap_or(0) > 0 && !existing.is_empty() {
            info!(
                "[cache] Reusing extraction for {} model={} ({} files)",
                fp.hex,
                model,
                existing.len()
            );
            let format = match recorded.map(|e| e.format.as_str()) {
                Some("anthropic") => ExportFormat::Anthropic,
                Some("openai") => ExportFormat::OpenAi,
                _ => ExportFormat::Unknown,
            };
            self.record(&mut manifest, &fp, model, existing.len(), true, format)?;
            return Ok(EnsureOutcome {
                fingerprint: fp.hex,
                format,
                model_dir,
                files: existing,
                reused_extraction: true,
            });
        }

        // Treat partial or unrecorded contents as absent.
        if model_dir.exists() {
            std::fs::remove_dir_all(&model_dir)?;
        }

        let exports_root = self.root.join(&fp.hex).join(MODEL_EXPORTS_DIR);
        let (format, files) = extract_for_model(source, &exports_root, model)?;
        if files.is_empty() {
            return Err(EngineError::NoMatchingConversations {
                model: model.to_string(),
            });
        }
        info!(
            "[cache] Extracted {} conversations for {} model={}",
            files.len(),
            fp.hex,
            model
        );
        self.record(&mut manifest, &fp, model, files.len(), false, format)?;

        Ok(EnsureOutcome {
            fingerprint: fp.hex,
            format,
            model_dir,
            files,
            reused_extraction: false,
        })
    }

    fn record(
        &self,
        manifest: &mut CacheManifest,
        fp: &SourceFingerprint,
        model: &str,
        file_count: usize,
        reused: bool,
        format: ExportFormat,
    ) -> EngineResult<()> {
        manifest.source_file_path = fp.resolved_path.to_string_lossy().into_owned();
        manifest.source_file_size_bytes = fp.size_bytes;
        manifest.source_file_mtime_ms = fp.mtime_ms;
        manifest.source_fingerprint = fp.hex.clone();
        manifest.cache_root = self.root.to_string_lossy().into_owned();
        manifest.model_exports_dir = self
            .root
            .join(&fp.hex)
            .join(MODEL_EXPORTS_DIR)
            .to_string_lossy()
            .into_owned();
        manifest.models.insert(
            formats::sanitize_component(model),
            ModelCacheEntry {
                file_count,
                reused_extraction: reused,
                extracted_in_last_run: !reused,
                format: format.as_str().to_string(),
                updated_at: Utc::now().to_rfc3339(),
            },
        );
        crate::engine::fsio::write_json_durable(&self.manifest_path(&fp.hex), manifest)
    }
}

/// Sorted `*.jsonl` files directly inside a model directory.
pub fn list_conversation_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file() && p.extension().map(|e| e == "jsonl").unwrap_or(false)
        })
        .collect();
    files.sort();
    files
}

/// Stream the source and write cleaned conversation files for one model.
/// OpenAI-format conversations are written when the requested model appears in
/// their assistant metadata; Anthropic exports only match the implicit tag.
fn extract_for_model(
    source: &Path,
    exports_root: &Path,
    model: &str,
) -> EngineResult<(ExportFormat, Vec<PathBuf>)> {
    let openai_roles = [Role::System, Role::User, Role::Assistant];
    let anthropic_roles = [Role::User, Role::Assistant];

    let mut opened = opener::open(source)?;
    let reader = opened.reader()?;

    let mut format = ExportFormat::Unknown;
    let mut writer: Option<ConversationWriter> = None;
    let mut files = Vec::new();

    for convo in JsonArrayStream::new(reader) {
        let convo = convo?;
        let convo_format = formats::detect_conversation_format(&convo);
        if format == ExportFormat::Unknown {
            format = convo_format;
        }

        match convo_format {
            ExportFormat::OpenAi => {
                let counts = openai::conversation_models(&convo);
                if !counts.contains_key(model) {
                    continue;
                }
                if writer.is_none() {
                    writer = Some(ConversationWriter::new(
                        exports_root,
                        model,
                        ExportFileFormat::Jsonl,
                    )?);
                }
                let Some(writer) = writer.as_mut() else { continue };
                let messages =
                    openai::order_messages(&convo, &openai_roles, openai::OrderPolicy::Time);
                let conv_id = openai::conversation_id(&convo)
                    .unwrap_or_else(|| "unknown-session".to_string());
                let path = writer.write(
                    model,
                    &conv_id,
                    openai::first_message_time(&convo),
                    &messages,
                    &openai::conversation_meta(&convo),
                )?;
                files.push(path);
            }
            ExportFormat::Anthropic => {
                // No per-message model data; only the implicit tag matches.
                if formats::sanitize_component(model) != IMPLICIT_ANTHROPIC_MODEL_TAG {
                    continue;
                }
                if writer.is_none() {
                    writer = Some(ConversationWriter::new(
                        exports_root,
                        IMPLICIT_ANTHROPIC_MODEL_TAG,
                        ExportFileFormat::Jsonl,
                    )?);
                }
                let Some(writer) = writer.as_mut() else { continue };
                let messages = anthropic::order_messages(&convo, &anthropic_roles);
                let conv_id = anthropic::conversation_id(&convo)
                    .unwrap_or_else(|| "unknown-session".to_string());
                let path = writer.write(
                    IMPLICIT_ANTHROPIC_MODEL_TAG,
                    &conv_id,
                    anthropic::first_message_time(&convo),
                    &messages,
                    &anthropic::conversation_meta(&convo),
                )?;
                files.push(path);
            }
            ExportFormat::Unknown => {
                warn!("[cache] Skipping conversation with unknown shape");
            }
        }
    }

    Ok((format, files))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn openai_export() -> String {
        let convo1 = json!({
            "conversation_id": "conv/a?1",
            "mapping": {
                "n1": {"message": {"id": "1", "author": {"role": "user"},
                    "create_time": 1_700_000_000.0,
                    "content": {"content_type": "text", "parts": ["hello"]},
                    "metadata": {}}},
                "n2": {"message": {"id": "2", "author": {"role": "assistant"},
                    "create_time": 1_700_000_100.0,
                    "content": {"content_type": "text", "parts": ["hi!"]},
                    "metadata": {"model_slug": "m-a"}}},
            }
        });
        let convo2 = json!({
            "conversation_id": "conv-b",
            "mapping": {
                "n1": {"message": {"id": "3", "author": {"role": "assistant"},
                    "create_time": 1_700_086_400.0,
                    "content": {"content_type": "text", "parts": ["yo"]},
                    "metadata": {"model_slug": "m-b"}}},
            }
        });
        serde_json::to_string(&json!([convo1, convo2])).unwrap()
    }

    #[test]
    fn extracts_matching_conversations_and_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("conversations.json");
        std::fs::write(&source, openai_export()).unwrap();

        let cache = ExtractionCache::new(dir.path().join("extractionCache"));
        let first = cache.ensure(&source, "m-a").unwrap();
        assert!(!first.reused_extraction);
        assert_eq!(first.files.len(), 1);
        assert_eq!(
            first.files[0].file_name().unwrap(),
            "m-a_20231114_conv_a_1.jsonl"
        );

        let second = cache.ensure(&source, "m-a").unwrap();
        assert!(second.reused_extraction);
        assert_eq!(second.files, first.files);
        assert_eq!(second.fingerprint, first.fingerprint);
    }

    #[test]
    fn unmatched_model_fails() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("conversations.json");
        std::fs::write(&source, openai_export()).unwrap();

        let cache = ExtractionCache::new(dir.path().join("extractionCache"));
        assert!(matches!(
            cache.ensure(&source, "m-z").unwrap_err(),
            EngineError::NoMatchingConversations { .. }
        ));
    }

    #[test]
    fn anthropic_export_extracts_under_implicit_tag() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("conversations.json");
        let export = json!([
            {"uuid": "c-1", "chat_messages": [
                {"sender": "human", "created_at": "2024-02-01T08:00:00Z",
                 "content": [{"type": "text", "text": "hey"}]},
                {"sender": "assistant", "created_at": "2024-02-01T08:00:05Z",
                 "content": [{"type": "text", "text": "hello"}]},
            ]},
            {"uuid": "c-2", "chat_messages": [
                {"sender": "assistant", "created_at": "2024-02-02T08:00:00Z",
                 "content": [{"type": "text", "text": "again"}]},
            ]},
        ]);
        std::fs::write(&source, serde_json::to_string(&export).unwrap()).unwrap();

        let cache = ExtractionCache::new(dir.path().join("extractionCache"));
        let outcome = cache.ensure(&source, "claude").unwrap();
        assert_eq!(outcome.format, ExportFormat::Anthropic);
        assert_eq!(outcome.files.len(), 2);
        assert!(outcome.model_dir.ends_with("model_exports/claude"));
    }

    #[test]
    fn fingerprint_changes_with_content_size() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("conversations.json");
        std::fs::write(&source, "[]").unwrap();
        let a = source_fingerprint(&source).unwrap();
        std::fs::write(&source, "[  ]").unwrap();
        let b = source_fingerprint(&source).unwrap();
        assert_ne!(a.hex, b.hex);
    }
}
