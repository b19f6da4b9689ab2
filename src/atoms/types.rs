// ── Reverie Atoms: Core Types ──────────────────────────────────────────────
// Data shapes shared by the extraction, sampling, and generation layers.
// Vendor payloads arrive weakly typed; everything here is the narrowed,
// validated form the rest of the pipeline works with.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

// ── Roles ──────────────────────────────────────────────────────────────────

/// Message author role in a cleaned conversation.
/// The Anthropic `human` sender maps to `User` during normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Parse a vendor role string, mapping the Anthropic `human` sender to `user`.
    pub fn parse(raw: &str) -> Option<Role> {
        match raw {
            "system" => Some(Role::System),
            "user" | "human" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

// ── Cleaned messages ───────────────────────────────────────────────────────

/// One normalized message, common to both vendor formats.
///
/// Invariant: when `text` is absent but every element of `parts` is a string,
/// normalization sets `text` to their concatenation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanedMessage {
    pub id: Option<String>,
    pub role: Role,
    pub name: Option<String>,
    /// Unix seconds; Anthropic ISO timestamps are converted at normalization.
    pub create_time: Option<f64>,
    pub content_type: Option<String>,
    /// Raw content parts. Non-string parts (images, attachments) are kept
    /// opaque so downstream consumers can decide how to render them.
    pub parts: Vec<Value>,
    pub text: Option<String>,
    pub model: Option<String>,
}

// ── Sampling ───────────────────────────────────────────────────────────────

/// Per-conversation statistics that drive sampling weight.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationScore {
    pub file_name: String,
    pub file_path: PathBuf,
    pub assistant_chars: usize,
    pub assistant_turns: usize,
    pub turns: usize,
}

impl ConversationScore {
    /// Sampling weight: rewards assistant volume with diminishing returns,
    /// plus small bonuses for turn counts. Never below 1.
    pub fn weight(&self) -> f64 {
        let w = (self.assistant_chars.max(1) as f64).sqrt()
            + 0.5 * self.assistant_turns as f64
            + 0.15 * self.turns as f64;
        w.max(1.0)
    }
}

/// A token-budgeted transcript excerpt built for one conversation.
/// Packets with `messages_used == 0` or an empty transcript are dropped
/// at construction.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationPacket {
    pub conversation_id: String,
    pub source_file: String,
    pub source_path: PathBuf,
    /// Newline-joined `[role] content` lines.
    pub transcript: String,
    pub messages_used: usize,
    pub char_count: usize,
    pub token_estimate: usize,
}

// ── Memories ───────────────────────────────────────────────────────────────

/// Category of an extracted memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    SharedMemory,
    UserContext,
    CompanionStyle,
    RelationshipDynamic,
}

impl MemoryCategory {
    /// Tolerant parse for LLM output; anything unrecognized is treated as a
    /// shared memory.
    pub fn parse(raw: &str) -> MemoryCategory {
        match raw.trim() {
            "user_context" => MemoryCategory::UserContext,
            "companion_style" => MemoryCategory::CompanionStyle,
            "relationship_dynamic" => MemoryCategory::RelationshipDynamic,
            _ => MemoryCategory::SharedMemory,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryCategory::SharedMemory => "shared_memory",
            MemoryCategory::UserContext => "user_context",
            MemoryCategory::CompanionStyle => "companion_style",
            MemoryCategory::RelationshipDynamic => "relationship_dynamic",
        }
    }
}

/// A raw memory proposal from one conversation, before dedup/compaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryCandidate {
    pub name: String,
    pub keys: Vec<String>,
    pub content: String,
    pub category: MemoryCategory,
    pub priority: i64,
    pub source_conversation: Option<String>,
    pub source_date: Option<String>,
}

/// A compacted, keyed memory ready for lorebook emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LorebookEntry {
    pub name: String,
    pub keys: Vec<String>,
    pub content: String,
    pub category: MemoryCategory,
    pub priority: i64,
    pub source_conversation: Option<String>,
    pub source_date: Option<String>,
}

impl From<MemoryCandidate> for LorebookEntry {
    fn from(c: MemoryCandidate) -> Self {
        LorebookEntry {
            name: c.name,
            keys: c.keys,
            content: c.content,
            category: c.category,
            priority: c.priority,
            source_conversation: c.source_conversation,
            source_date: c.source_date,
        }
    }
}

impl From<LorebookEntry> for MemoryCandidate {
    fn from(e: LorebookEntry) -> Self {
        MemoryCandidate {
            name: e.name,
            keys: e.keys,
            content: e.content,
            category: e.category,
            priority: e.priority,
            source_conversation: e.source_conversation,
            source_date: e.source_date,
        }
    }
}

// ── Chat plumbing ──────────────────────────────────────────────────────────

/// One message in an outbound LLM request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage { role: "system", content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage { role: "user", content: content.into() }
    }
}

// ── Text helpers ───────────────────────────────────────────────────────────

/// Collapse runs of whitespace to single spaces and trim.
pub fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parse_maps_human_to_user() {
        assert_eq!(Role::parse("human"), Some(Role::User));
        assert_eq!(Role::parse("assistant"), Some(Role::Assistant));
        assert_eq!(Role::parse("tool"), None);
    }

    #[test]
    fn score_weight_floors_at_one() {
        let s = ConversationScore {
            file_name: "a.jsonl".into(),
            file_path: "a.jsonl".into(),
            assistant_chars: 0,
            assistant_turns: 0,
            turns: 0,
        };
        assert!(s.weight() >= 1.0);
    }

    #[test]
    fn normalize_ws_collapses_runs() {
        assert_eq!(normalize_ws("  a \t b\n\nc  "), "a b c");
    }

    #[test]
    fn category_parse_defaults_to_shared() {
        assert_eq!(MemoryCategory::parse("user_context"), MemoryCategory::UserContext);
        assert_eq!(MemoryCategory::parse("nonsense"), MemoryCategory::SharedMemory);
    }
}
