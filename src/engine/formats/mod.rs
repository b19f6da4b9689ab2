// Reverie Engine — Export Format Detection & Emission
// Classifies raw conversation objects as vendor formats, and owns the
// shared machinery for writing cleaned per-conversation files: filename
// schema, sanitization, collision suffixes, and the JSONL/JSON layouts.

pub mod anthropic;
pub mod openai;

use crate::atoms::constants::IMPLICIT_ANTHROPIC_MODEL_TAG;
use crate::atoms::error::EngineResult;
use crate::atoms::types::CleanedMessage;
use crate::engine::opener;
use crate::engine::stream::JsonArrayStream;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

// ── Detection ──────────────────────────────────────────────────────────────

/// Vendor format of a conversation object (or a whole export).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// OpenAI export: tree-structured `mapping` with per-message model metadata.
    OpenAi,
    /// Anthropic export: flat `chat_messages` array, single implicit model.
    Anthropic,
    Unknown,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::OpenAi => "openai",
            ExportFormat::Anthropic => "anthropic",
            ExportFormat::Unknown => "unknown",
        }
    }
}

impl Default for ExportFormat {
    fn default() -> Self {
        ExportFormat::Unknown
    }
}

/// Per-conversation detection: `mapping` marks an OpenAI export, `chat_messages`
/// marks an Anthropic one.
pub fn detect_conversation_format(convo: &Value) -> ExportFormat {
    if convo.get("mapping").map(Value::is_object).unwrap_or(false) {
        ExportFormat::OpenAi
    } else if convo.get("chat_messages").map(Value::is_array).unwrap_or(false) {
        ExportFormat::Anthropic
    } else {
        ExportFormat::Unknown
    }
}

/// Detect the format of a whole export. The first recognized conversation
/// locks the label; a file of only unknown shapes reports `Unknown`.
pub fn detect_export_format(path: &Path) -> EngineResult<ExportFormat> {
    let mut source = opener::open(path)?;
    let reader = source.reader()?;
    for convo in JsonArrayStream::new(reader) {
        let convo = convo?;
        let fmt = detect_conversation_format(&convo);
        if fmt != ExportFormat::Unknown {
            return Ok(fmt);
        }
    }
    Ok(ExportFormat::Unknown)
}

// ── Model discovery ────────────────────────────────────────────────────────

/// Per-model tallies across a whole export.
#[derive(Debug, Clone, Default)]
pub struct ModelDiscovery {
    pub format: ExportFormat,
    /// model → assistant messages carrying that model tag
    pub message_counts: BTreeMap<String, usize>,
    /// model → conversations with at least one such message
    pub conversation_counts: BTreeMap<String, usize>,
}

/// Stream an export once and tally models. Anthropic exports carry no
/// per-message model data, so everything lands on the implicit tag.
pub fn discover_models(path: &Path) -> EngineResult<ModelDiscovery> {
    let mut discovery = ModelDiscovery::default();
    let mut source = opener::open(path)?;
    let reader = source.reader()?;

    for convo in JsonArrayStream::new(reader) {
        let convo = convo?;
        let fmt = detect_conversation_format(&convo);
        if discovery.format == ExportFormat::Unknown {
            discovery.format = fmt;
        }
        match fmt {
            ExportFormat::OpenAi => {
                let counts = openai::conversation_models(&convo);
                for (model, n) in &counts {
                    *discovery.message_counts.entry(model.clone()).or_default() += n;
                    *discovery
                        .conversation_counts
                        .entry(model.clone())
                        .or_default() += 1;
                }
            }
            ExportFormat::Anthropic => {
                let n = convo
                    .get("chat_messages")
                    .and_then(Value::as_array)
                    .map(|msgs| {
                        msgs.iter()
                            .filter(|m| str_field(m, "sender") == Some("assistant"))
                            .count()
                    })
                    .unwrap_or(0);
                *discovery
                    .message_counts
                    .entry(IMPLICIT_ANTHROPIC_MODEL_TAG.into())
                    .or_default() += n;
                *discovery
                    .conversation_counts
                    .entry(IMPLICIT_ANTHROPIC_MODEL_TAG.into())
                    .or_default() += 1;
            }
            ExportFormat::Unknown => {}
        }
    }
    Ok(discovery)
}

// ── Narrowing helpers ──────────────────────────────────────────────────────
// Vendor payloads are weakly typed; every field read narrows through these,
// returning None on shape mismatch instead of panicking.

pub(crate) fn str_field<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str)
}

pub(crate) fn num_field(v: &Value, key: &str) -> Option<f64> {
    v.get(key).and_then(Value::as_f64)
}

pub(crate) fn obj_field<'a>(v: &'a Value, key: &str) -> Option<&'a serde_json::Map<String, Value>> {
    v.get(key).and_then(Value::as_object)
}

// ── Filename schema ────────────────────────────────────────────────────────

/// Replace runs of characters outside `[A-Za-z0-9._-]` with a single
/// underscore, then trim leading/trailing underscores.
pub fn sanitize_component(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_run = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out.trim_matches('_').to_string()
}

/// UTC `yyyymmdd` from unix seconds, or `unknown-date`.
pub fn format_date(ts: Option<f64>) -> String {
    match ts.and_then(|t| chrono::DateTime::from_timestamp(t as i64, 0)) {
        Some(dt) => dt.format("%Y%m%d").to_string(),
        None => "unknown-date".to_string(),
    }
}

/// Metadata recovered from an emitted filename
/// (`<modelTag>_<yyyymmdd>_<sanitizedConversationId>.<ext>`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportFileMeta {
    pub model_tag: Option<String>,
    pub first_message_date: Option<String>,
    pub conversation_id: Option<String>,
    pub source_file: String,
}

/// Parse an emitted filename back into its components. Files that do not
/// match the schema keep only `source_file`.
pub fn parse_export_file_name(file_name: &str) -> ExportFileMeta {
    let mut meta = ExportFileMeta {
        source_file: file_name.to_string(),
        ..Default::default()
    };
    let stem = file_name
        .rsplit_once('.')
        .map(|(s, _)| s)
        .unwrap_or(file_name);

    // model tag may itself contain underscores only after sanitization of
    // dots/dashes, so split on the first `_<8 digits>_` boundary.
    let bytes = stem.as_bytes();
    let mut split = None;
    for (i, _) in stem.match_indices('_') {
        let date_start = i + 1;
        let date_end = date_start + 8;
        if date_end < bytes.len()
            && stem[date_start..date_end].chars().all(|c| c.is_ascii_digit())
            && bytes[date_end] == b'_'
        {
            split = Some((i, date_start, date_end));
            break;
        }
    }
    if let Some((model_end, date_start, date_end)) = split {
        meta.model_tag = Some(stem[..model_end].to_string());
        meta.first_message_date = Some(stem[date_start..date_end].to_string());
        meta.conversation_id = Some(stem[date_end + 1..].to_string());
    }
    meta
}

// ── Emission ───────────────────────────────────────────────────────────────

/// On-disk layout of an emitted conversation file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFileFormat {
    /// One cleaned message per line.
    Jsonl,
    /// Single object with conversation metadata and a `messages` array.
    Json,
}

impl ExportFileFormat {
    fn extension(&self) -> &'static str {
        match self {
            ExportFileFormat::Jsonl => "jsonl",
            ExportFileFormat::Json => "json",
        }
    }
}

/// Conversation-level metadata carried into the JSON layout.
#[derive(Debug, Clone, Default)]
pub struct ConversationMeta {
    pub conversation_id: Option<String>,
    pub title: Option<String>,
    pub create_time: Option<f64>,
    pub update_time: Option<f64>,
}

/// Writes cleaned conversations into a model directory, handling the
/// filename schema and collision suffixes (`_2`, `_3`, …).
pub struct ConversationWriter {
    target_dir: PathBuf,
    format: ExportFileFormat,
    used_names: HashSet<String>,
}

impl ConversationWriter {
    pub fn new(out_dir: &Path, model_tag: &str, format: ExportFileFormat) -> EngineResult<Self> {
        let target_dir = out_dir.join(sanitize_component(model_tag));
        std::fs::create_dir_all(&target_dir)?;
        Ok(ConversationWriter {
            target_dir,
            format,
            used_names: HashSet::new(),
        })
    }

    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    /// Write one conversation; returns the emitted path.
    pub fn write(
        &mut self,
        model_tag: &str,
        conversation_id: &str,
        first_message_time: Option<f64>,
        messages: &[CleanedMessage],
        meta: &ConversationMeta,
    ) -> EngineResult<PathBuf> {
        let base = format!(
            "{}_{}_{}",
            sanitize_component(model_tag),
            format_date(first_message_time),
            sanitize_component(conversation_id),
        );
        let ext = self.format.extension();

        let mut name = format!("{base}.{ext}");
        let mut suffix = 2u32;
        while self.used_names.contains(&name) || self.target_dir.join(&name).exists() {
            name = format!("{base}_{suffix}.{ext}");
            suffix += 1;
        }
        self.used_names.insert(name.clone());
        let path = self.target_dir.join(&name);

        let mut file = std::fs::File::create(&path)?;
        match self.format {
            ExportFileFormat::Jsonl => {
                for msg in messages {
                    serde_json::to_writer(&mut file, msg)?;
                    file.write_all(b"\n")?;
                }
            }
            ExportFileFormat::Json => {
                let payload = json!({
                    "conversation_id": meta.conversation_id,
                    "title": meta.title,
                    "create_time": meta.create_time,
                    "update_time": meta.update_time,
                    "messages": messages,
                });
                serde_json::to_writer(&mut file, &payload)?;
            }
        }
        Ok(path)
    }
}
