// Reverie Engine — Chat Dataset Builder
// Converts a directory of cleaned per-conversation JSONL files into one
// OpenAI-style chat JSONL suitable for downstream tooling. Handles image
// parts, empty/system filtering, and consecutive same-role merging.

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::formats::parse_export_file_name;
use log::info;
use serde_json::{json, Value};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

/// How non-string (image) parts are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageMode {
    /// Drop image parts, keep surrounding text.
    Strip,
    /// Replace each image part with a placeholder token.
    Placeholder,
    /// Drop messages whose only content was images.
    DropIfImageOnly,
}

pub const IMAGE_PLACEHOLDER: &str = "<image>";

#[derive(Debug, Clone)]
pub struct DatasetOptions {
    pub image_mode: ImageMode,
    pub merge_consecutive: bool,
    pub min_messages: usize,
    pub require_user: bool,
    pub require_assistant: bool,
    pub include_system: bool,
    pub drop_user_context: bool,
    pub include_meta: bool,
    /// 0 = unlimited.
    pub max_conversations: usize,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        DatasetOptions {
            image_mode: ImageMode::Strip,
            merge_consecutive: true,
            min_messages: 2,
            require_user: false,
            require_assistant: false,
            include_system: true,
            drop_user_context: true,
            include_meta: false,
            max_conversations: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DatasetStats {
    pub total: usize,
    pub kept: usize,
    pub skipped: usize,
}

/// Extract message text. Prefers `text`; otherwise joins string parts,
/// rendering non-string parts per the image mode. Returns the text and
/// whether an image part was seen.
fn extract_text(msg: &Value, image_mode: ImageMode) -> (String, bool) {
    if let Some(text) = msg.get("text").and_then(Value::as_str) {
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            return (trimmed.to_string(), false);
        }
    }
    let Some(parts) = msg.get("parts").and_then(Value::as_array) else {
        return (String::new(), false);
    };

    let mut had_image = false;
    let mut out = String::new();
    for part in parts {
        match part.as_str() {
            Some(s) => out.push_str(s),
            None => {
                had_image = true;
                if image_mode == ImageMode::Placeholder {
                    out.push_str(IMAGE_PLACEHOLDER);
                }
            }
        }
    }
    (out.trim().to_string(), had_image)
}

fn should_keep(role: &str, content_type: Option<&str>, text: &str, opts: &DatasetOptions) -> bool {
    if !matches!(role, "system" | "user" | "assistant") {
        return false;
    }
    if role == "system" && !opts.include_system {
        return false;
    }
    if content_type == Some("user_editable_context") && opts.drop_user_context {
        return false;
    }
    if text.is_empty() {
        return false;
    }
    true
}

fn merge_consecutive(messages: Vec<(String, String)>) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = Vec::with_capacity(messages.len());
    for (role, content) in messages {
        match merged.last_mut() {
            Some((last_role, last_content)) if *last_role == role => {
                last_content.push_str("\n\n");
                last_content.push_str(&content);
            }
            _ => merged.push((role, content)),
        }
    }
    merged
}

/// Process one cleaned conversation file into a dataset item, or None when
/// it fails the gates.
pub fn process_file(path: &Path, opts: &DatasetOptions) -> EngineResult<Option<Value>> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let mut messages: Vec<(String, String)> = Vec::new();

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(msg) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let Some(role) = msg.get("role").and_then(Value::as_str) else {
            continue;
        };
        let content_type = msg.get("content_type").and_then(Value::as_str);
        let (text, had_image) = extract_text(&msg, opts.image_mode);
        if opts.image_mode == ImageMode::DropIfImageOnly && had_image && text.is_empty() {
            continue;
        }
        if !should_keep(role, content_type, &text, opts) {
            continue;
        }
        messages.push((role.to_string(), text));
    }

    let messages = if opts.merge_consecutive {
        merge_consecutive(messages)
    } else {
        messages
    };
    if messages.len() < opts.min_messages {
        return Ok(None);
    }
    if opts.require_user && !messages.iter().any(|(r, _)| r == "user") {
        return Ok(None);
    }
    if opts.require_assistant && !messages.iter().any(|(r, _)| r == "assistant") {
        return Ok(None);
    }

    let rendered: Vec<Value> = messages
        .into_iter()
        .map(|(role, content)| json!({"role": role, "content": content}))
        .collect();
    let mut item = json!({ "messages": rendered });
    if opts.include_meta {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let meta = parse_export_file_name(&file_name);
        item["metadata"] = json!({
            "conversation_id": meta.conversation_id,
            "first_message_date": meta.first_message_date,
            "model_tag": meta.model_tag,
            "source_file": meta.source_file,
        });
    }
    Ok(Some(item))
}

fn list_input_files(input_dir: &Path) -> Vec<PathBuf> {
    crate::engine::cache::list_conversation_files(input_dir)
}

/// Build a chat dataset JSONL from per-conversation exports.
pub fn build_dataset(
    input_dir: &Path,
    output_file: &Path,
    opts: &DatasetOptions,
) -> EngineResult<DatasetStats> {
    let input_files = list_input_files(input_dir);
    if input_files.is_empty() {
        return Err(EngineError::Config(format!(
            "no input files found in {}",
            input_dir.display()
        )));
    }
    if let Some(parent) = output_file.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut stats = DatasetStats::default();
    let mut out = std::fs::File::create(output_file)?;

    for path in input_files {
        stats.total += 1;
        match process_file(&path, opts)? {
            Some(item) => {
                serde_json::to_writer(&mut out, &item)?;
                out.write_all(b"\n")?;
                stats.kept += 1;
            }
            None => stats.skipped += 1,
        }
        if stats.total % 50 == 0 {
            info!(
                "[dataset] Processed {} files, kept {}",
                stats.total, stats.kept
            );
        }
        if opts.max_conversations > 0 && stats.kept >= opts.max_conversations {
            break;
        }
    }
    Ok(stats)
}
