// Reverie Engine — Card & Lorebook Shaping
// Maps LLM synthesis payloads into the Character Card V3 and lorebook_v3
// wire formats, repairing the string damage models commonly inflict
// (flattened markdown, single-line example dialogues) and falling back to
// conservative defaults for empty fields.

use crate::atoms::types::{normalize_ws, LorebookEntry, MemoryCandidate, MemoryCategory};
use chrono::Utc;
use serde_json::{json, Map, Value};

// ── Draft ──────────────────────────────────────────────────────────────────

/// Card-facing fields out of the persona synthesis payload.
#[derive(Debug, Clone, Default)]
pub struct CharacterCardDraft {
    pub name: String,
    pub nickname: String,
    pub description: String,
    pub personality: String,
    pub scenario: String,
    pub first_mes: String,
    pub mes_example: String,
    pub creator_notes: String,
    pub tags: Vec<String>,
    pub system_prompt: String,
    pub post_history_instructions: String,
    pub alternate_greetings: Vec<String>,
}

fn text_field(payload: &Value, key: &str) -> String {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(normalize_ws)
        .unwrap_or_default()
}

/// Markdown-bearing fields keep their internal newlines; only edges are
/// trimmed.
fn block_field(payload: &Value, key: &str) -> String {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn string_list(payload: &Value, key: &str) -> Vec<String> {
    payload
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(normalize_ws)
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Narrow a persona synthesis payload into a draft. Weak or missing fields
/// stay empty here; defaults apply at card-build time.
pub fn draft_from_payload(companion_name: &str, payload: &Value) -> CharacterCardDraft {
    let mut draft = CharacterCardDraft {
        name: text_field(payload, "name"),
        nickname: text_field(payload, "nickname"),
        description: block_field(payload, "description"),
        personality: text_field(payload, "personality"),
        scenario: text_field(payload, "scenario"),
        first_mes: block_field(payload, "first_mes"),
        mes_example: block_field(payload, "mes_example"),
        creator_notes: text_field(payload, "creator_notes"),
        tags: string_list(payload, "tags"),
        system_prompt: block_field(payload, "system_prompt"),
        post_history_instructions: block_field(payload, "post_history_instructions"),
        alternate_greetings: string_list(payload, "alternate_greetings"),
    };
    if draft.name.is_empty() {
        draft.name = companion_name.to_string();
    }
    draft
}

/// Tolerantly parse a `{"memories": [...]}` payload into candidates.
/// Rows missing content or keys are dropped; unknown categories become
/// shared memories; priorities clamp to 0..=100.
pub fn candidates_from_payload(payload: &Value) -> Vec<MemoryCandidate> {
    let Some(rows) = payload.get("memories").and_then(Value::as_array) else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            let content = row.get("content").and_then(Value::as_str)?;
            let content = normalize_ws(content);
            if content.is_empty() {
                return None;
            }
            let keys: Vec<String> = row
                .get("keys")
                .and_then(Value::as_array)
                .map(|ks| {
                    ks.iter()
                        .filter_map(Value::as_str)
                        .map(normalize_ws)
                        .filter(|k| !k.is_empty())
                        .collect()
                })
                .unwrap_or_default();
            if keys.is_empty() {
                return None;
            }
            let name = row
                .get("name")
                .and_then(Value::as_str)
                .map(normalize_ws)
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "Memory".to_string());
            let category = row
                .get("category")
                .and_then(Value::as_str)
                .map(MemoryCategory::parse)
                .unwrap_or(MemoryCategory::SharedMemory);
            let priority = row
                .get("priority")
                .and_then(Value::as_i64)
                .unwrap_or(0)
                .clamp(0, 100);
            Some(MemoryCandidate {
                name,
                keys,
                content,
                category,
                priority,
                source_conversation: row
                    .get("source_conversation")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                source_date: row
                    .get("source_date")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        })
        .collect()
}

// ── Repairs ────────────────────────────────────────────────────────────────

/// Ensure `<START>` tags and speaker prefixes start on their own line.
pub fn repair_mes_example(text: &str) -> String {
    let mut out = text.to_string();
    for token in ["<START>", "{{user}}:", "{{char}}:"] {
        out = newline_before_token(&out, token);
    }
    out.trim().to_string()
}

fn newline_before_token(text: &str, token: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut rest = text;
    while let Some(idx) = rest.find(token) {
        let before = &rest[..idx];
        out.push_str(before.trim_end());
        out.push('\n');
        out.push_str(token);
        rest = &rest[idx + token.len()..];
    }
    out.push_str(rest);
    out
}

/// Restore newlines in markdown that a model flattened to one line: insert
/// breaks before headings, list items, and `<tag>` / `</tag>` markers. Text
/// that already contains newlines is left untouched.
pub fn repair_markdown_newlines(text: &str) -> String {
    if text.is_empty() || text.contains('\n') {
        return text.to_string();
    }

    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 32);
    let mut i = 0;
    while i < chars.len() {
        if let Some((marker_len, double)) = marker_at(&chars, i) {
            if i > 0 {
                while out.ends_with(' ') || out.ends_with('\t') {
                    out.pop();
                }
                out.push('\n');
                if double {
                    out.push('\n');
                }
            }
            for c in &chars[i..i + marker_len] {
                out.push(*c);
            }
            i += marker_len;
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    out.trim().to_string()
}

/// Detect a structural marker starting at `i`: returns its length and
/// whether it earns a blank line (headings do).
fn marker_at(chars: &[char], i: usize) -> Option<(usize, bool)> {
    // Headings: 1-4 '#' followed by whitespace.
    if chars[i] == '#' {
        let mut n = 0;
        while i + n < chars.len() && chars[i + n] == '#' && n < 4 {
            n += 1;
        }
        if i + n < chars.len() && chars[i + n].is_whitespace() {
            return Some((n + 1, true));
        }
        return None;
    }
    // List items: "- " preceded by start or whitespace.
    if chars[i] == '-'
        && i + 1 < chars.len()
        && chars[i + 1] == ' '
        && (i == 0 || chars[i - 1].is_whitespace())
    {
        return Some((2, false));
    }
    // Tags: <word> or </word>, with `{{char}}` also accepted inside.
    if chars[i] == '<' {
        let mut j = i + 1;
        if j < chars.len() && chars[j] == '/' {
            j += 1;
        }
        let body_start = j;
        while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_' || chars[j] == '{' || chars[j] == '}') {
            j += 1;
        }
        if j > body_start && j < chars.len() && chars[j] == '>' {
            return Some((j - i + 1, false));
        }
    }
    None
}

// ── Card assembly ──────────────────────────────────────────────────────────

/// Conservative defaults for empty fields.
const DEFAULT_FIRST_MES: &str = "Hi. I'm here with you.";
const DEFAULT_MES_EXAMPLE: &str = "<START>\n{{user}}: How are you?\n{{char}}: I'm here with you.";
const DEFAULT_SYSTEM_PROMPT: &str =
    "Reconstruct responses from transcript-derived behavior and tone.";
const DEFAULT_POST_HISTORY: &str =
    "Maintain continuity using extracted memories and observed style.";

fn non_empty(value: String, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

/// Build the Character Card V3 envelope, with the shaped lorebook embedded
/// as `character_book`.
pub fn build_card(
    draft: &CharacterCardDraft,
    lorebook: &Value,
    companion_name: &str,
    creator: &str,
    source_label: Option<&str>,
) -> Value {
    let now_ts = Utc::now().timestamp();
    let mut tags = draft.tags.clone();
    if tags.is_empty() {
        tags = vec!["companion".to_string(), "transcript-derived".to_string()];
    }
    let mut alternate_greetings = draft.alternate_greetings.clone();
    if alternate_greetings.is_empty() {
        alternate_greetings = vec![
            "Hi. What would you like to talk about?".to_string(),
            "I'm here. What do you want to focus on?".to_string(),
        ];
    }

    let name = non_empty(draft.name.clone(), companion_name);
    let description = repair_markdown_newlines(&non_empty(
        draft.description.clone(),
        &format!("{companion_name} reconstructed from transcript evidence."),
    ));
    let mes_example =
        repair_mes_example(&non_empty(draft.mes_example.clone(), DEFAULT_MES_EXAMPLE));

    let mut data = Map::new();
    data.insert("name".into(), json!(name));
    data.insert("description".into(), json!(description));
    // Deprecated in favor of the structured description; emitted empty.
    data.insert("personality".into(), json!(""));
    data.insert("scenario".into(), json!(draft.scenario));
    data.insert(
        "first_mes".into(),
        json!(non_empty(draft.first_mes.clone(), DEFAULT_FIRST_MES)),
    );
    data.insert("mes_example".into(), json!(mes_example));
    data.insert(
        "creator_notes".into(),
        json!(non_empty(
            draft.creator_notes.clone(),
            "Auto-generated companion reconstruction card."
        )),
    );
    data.insert(
        "system_prompt".into(),
        json!(non_empty(draft.system_prompt.clone(), DEFAULT_SYSTEM_PROMPT)),
    );
    data.insert(
        "post_history_instructions".into(),
        json!(non_empty(
            draft.post_history_instructions.clone(),
            DEFAULT_POST_HISTORY
        )),
    );
    data.insert("tags".into(), json!(tags));
    data.insert("alternate_greetings".into(), json!(alternate_greetings));
    data.insert("group_only_greetings".into(), json!([]));
    data.insert("creator".into(), json!(non_empty(creator.to_string(), "unknown")));
    data.insert("character_version".into(), json!("1.0"));
    data.insert("creation_date".into(), json!(now_ts));
    data.insert("modification_date".into(), json!(now_ts));
    data.insert("extensions".into(), json!({}));
    if !draft.nickname.is_empty() {
        data.insert("nickname".into(), json!(draft.nickname));
    }
    if let Some(label) = source_label {
        data.insert("source".into(), json!([label]));
    }
    if let Some(book) = lorebook.get("data") {
        data.insert("character_book".into(), book.clone());
    }

    json!({
        "spec": "chara_card_v3",
        "spec_version": "3.0",
        "data": Value::Object(data),
    })
}

/// Build the lorebook_v3 wrapper from compacted entries.
pub fn build_lorebook(entries: &[LorebookEntry]) -> Value {
    let rendered: Vec<Value> = entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let mut extensions = Map::new();
            extensions.insert("category".into(), json!(entry.category.as_str()));
            if let Some(date) = &entry.source_date {
                extensions.insert("source_date".into(), json!(date));
            }
            if let Some(conv) = &entry.source_conversation {
                extensions.insert("source_conversation".into(), json!(conv));
            }
            json!({
                "keys": entry.keys,
                "content": entry.content,
                "enabled": true,
                "insertion_order": index,
                "name": entry.name,
                "priority": entry.priority,
                "position": "before_char",
                "extensions": Value::Object(extensions),
            })
        })
        .collect();

    json!({
        "spec": "lorebook_v3",
        "data": {
            "name": "Companion Shared Memories",
            "description": "Memories and relational anchors extracted from historical chats. \
                Entries carry retrieval-oriented keys compatible with lorebook scans and RAG pipelines.",
            "entries": rendered,
        }
    })
}

// ── Fallback draft ─────────────────────────────────────────────────────────

/// Conservative built-in draft used when the LLM produced nothing usable,
/// so the emitted card is still well-formed.
pub fn heuristic_draft(companion_name: &str) -> CharacterCardDraft {
    CharacterCardDraft {
        name: companion_name.to_string(),
        nickname: String::new(),
        description: format!(
            "{companion_name} is a thoughtful companion focused on emotional clarity, \
             steady support, and practical next steps."
        ),
        personality: String::new(),
        scenario: "A long-term trusted chat companion supporting everyday life, emotional \
                   processing, and growth over many conversations."
            .to_string(),
        first_mes: "I'm here with you. Tell me what's most present right now, and we'll take \
                    it one step at a time."
            .to_string(),
        mes_example: "<START>\n{{user}}: I'm overwhelmed and don't know where to begin.\n\
                      {{char}}: That makes sense. Let's reduce pressure and pick one \
                      manageable first step."
            .to_string(),
        creator_notes: "Generated fallback draft. Re-run with a working model for higher \
                        fidelity voice matching."
            .to_string(),
        tags: vec!["companion".into(), "supportive".into(), "reflective".into()],
        system_prompt: "Stay grounded, compassionate, and specific. Offer emotional \
                        validation first, then actionable support."
            .to_string(),
        post_history_instructions: "Maintain continuity with prior discussions and keep tone \
                                    consistent with a trusted long-term companion."
            .to_string(),
        alternate_greetings: vec![
            "I'm glad you're here. What do you need most in this moment?".into(),
            "We can slow this down together. What's on your mind first?".into(),
        ],
    }
}

// ── Validation ─────────────────────────────────────────────────────────────

/// Structural checks over the card envelope. Returns human-readable
/// problems; empty means valid.
pub fn validate_card(card: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    if card.get("spec").and_then(Value::as_str) != Some("chara_card_v3") {
        errors.push("spec must be chara_card_v3".to_string());
    }
    if !card.get("spec_version").map(Value::is_string).unwrap_or(false) {
        errors.push("spec_version must be string".to_string());
    }
    let Some(data) = card.get("data").and_then(Value::as_object) else {
        errors.push("data must be object".to_string());
        return errors;
    };
    for field in [
        "name",
        "description",
        "creator",
        "character_version",
        "mes_example",
        "system_prompt",
        "post_history_instructions",
        "first_mes",
        "personality",
        "scenario",
        "creator_notes",
    ] {
        if !data.get(field).map(Value::is_string).unwrap_or(false) {
            errors.push(format!("data.{field} must be string"));
        }
    }
    for field in ["tags", "alternate_greetings", "group_only_greetings"] {
        if !data.get(field).map(Value::is_array).unwrap_or(false) {
            errors.push(format!("data.{field} must be array"));
        }
    }
    if !data.get("extensions").map(Value::is_object).unwrap_or(false) {
        errors.push("data.extensions must be object".to_string());
    }
    if let Some(book) = data.get("character_book") {
        if !book.is_object() {
            errors.push("data.character_book must be object if present".to_string());
        }
    }
    errors
}

/// Structural checks over the lorebook wrapper.
pub fn validate_lorebook(wrapper: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    if wrapper.get("spec").and_then(Value::as_str) != Some("lorebook_v3") {
        errors.push("spec must be lorebook_v3".to_string());
    }
    let Some(data) = wrapper.get("data").and_then(Value::as_object) else {
        errors.push("data must be object".to_string());
        return errors;
    };
    let Some(entries) = data.get("entries").and_then(Value::as_array) else {
        errors.push("data.entries must be array".to_string());
        return errors;
    };
    for (i, entry) in entries.iter().enumerate() {
        let Some(entry) = entry.as_object() else {
            errors.push(format!("entry[{i}] must be object"));
            continue;
        };
        if !entry.get("keys").map(Value::is_array).unwrap_or(false) {
            errors.push(format!("entry[{i}].keys must be array"));
        }
        if !entry.get("content").map(Value::is_string).unwrap_or(false) {
            errors.push(format!("entry[{i}].content must be string"));
        }
        if !entry.get("enabled").map(Value::is_boolean).unwrap_or(false) {
            errors.push(format!("entry[{i}].enabled must be bool"));
        }
        if !entry
            .get("insertion_order")
            .map(Value::is_number)
            .unwrap_or(false)
        {
            errors.push(format!("entry[{i}].insertion_order must be number"));
        }
        if !entry.get("extensions").map(Value::is_object).unwrap_or(false) {
            errors.push(format!("entry[{i}].extensions must be object"));
        }
    }
    errors
}
