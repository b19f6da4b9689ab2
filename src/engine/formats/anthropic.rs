// Reverie Engine — Anthropic-Format Exporter (flat exports)
// Conversations arrive as an ordered `chat_messages` array. There is no
// per-message model metadata; every conversation is attributed to the
// implicit model tag. Content is a sequence of typed blocks, of which only
// `text` blocks are retained.

use crate::atoms::types::{CleanedMessage, Role};
use crate::engine::formats::{str_field, ConversationMeta};
use serde_json::{json, Value};

fn iter_messages(convo: &Value) -> impl Iterator<Item = &Value> {
    convo
        .get("chat_messages")
        .and_then(Value::as_array)
        .map(|a| a.iter())
        .unwrap_or_default()
}

/// Parse an ISO-8601 timestamp string to unix seconds.
fn parse_iso_timestamp(raw: Option<&str>) -> Option<f64> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_millis()) / 1000.0)
}

/// Normalize one raw message: `human` → user, `assistant` stays; text is
/// the in-order concatenation of `text`-typed content blocks. Blocks of
/// type `tool_use`, `tool_result`, `thinking`, `token_budget`, and any
/// other non-text kind are dropped. Falls back to a top-level `text` field
/// when no text blocks exist.
pub fn clean_message(msg: &Value) -> Option<CleanedMessage> {
    let role = str_field(msg, "sender").and_then(Role::parse)?;

    let mut text_parts: Vec<&str> = Vec::new();
    if let Some(blocks) = msg.get("content").and_then(Value::as_array) {
        for block in blocks {
            if str_field(block, "type") == Some("text") {
                if let Some(t) = str_field(block, "text") {
                    text_parts.push(t);
                }
            }
        }
    }
    let text = if text_parts.is_empty() {
        str_field(msg, "text").map(str::to_string)
    } else {
        Some(text_parts.concat())
    };

    Some(CleanedMessage {
        id: str_field(msg, "uuid").map(str::to_string),
        role,
        name: None,
        create_time: parse_iso_timestamp(str_field(msg, "created_at")),
        content_type: Some("text".to_string()),
        parts: text.iter().map(|t| json!(t)).collect(),
        text,
        model: None,
    })
}

/// Earliest message timestamp, falling back to the conversation's own
/// `created_at`.
pub fn first_message_time(convo: &Value) -> Option<f64> {
    let min = iter_messages(convo)
        .filter_map(|m| parse_iso_timestamp(str_field(m, "created_at")))
        .fold(None::<f64>, |acc, t| Some(acc.map_or(t, |a| a.min(t))));
    min.or_else(|| parse_iso_timestamp(str_field(convo, "created_at")))
}

/// Cleaned messages of the requested roles in chronological order
/// (untimed messages first, stable).
pub fn order_messages(convo: &Value, roles: &[Role]) -> Vec<CleanedMessage> {
    let mut msgs: Vec<CleanedMessage> = iter_messages(convo)
        .filter_map(clean_message)
        .filter(|m| roles.contains(&m.role))
        .collect();
    msgs.sort_by(|a, b| {
        let ka = (a.create_time.is_some(), a.create_time.unwrap_or(0.0));
        let kb = (b.create_time.is_some(), b.create_time.unwrap_or(0.0));
        ka.partial_cmp(&kb).unwrap_or(std::cmp::Ordering::Equal)
    });
    msgs
}

pub fn conversation_id(convo: &Value) -> Option<String> {
    str_field(convo, "uuid")
        .or_else(|| str_field(convo, "name"))
        .map(str::to_string)
}

pub fn conversation_meta(convo: &Value) -> ConversationMeta {
    ConversationMeta {
        conversation_id: str_field(convo, "uuid").map(str::to_string),
        title: str_field(convo, "name").map(str::to_string),
        create_time: parse_iso_timestamp(str_field(convo, "created_at")),
        update_time: parse_iso_timestamp(str_field(convo, "updated_at")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn non_text_blocks_are_dropped() {
        let msg = json!({
            "uuid": "u1",
            "sender": "assistant",
            "created_at": "2024-03-01T10:00:00Z",
            "content": [
                {"type": "thinking", "thinking": "hidden"},
                {"type": "text", "text": "Hello "},
                {"type": "tool_use", "name": "search"},
                {"type": "text", "text": "there."},
                {"type": "token_budget", "budget": 4},
            ],
        });
        let cleaned = clean_message(&msg).unwrap();
        assert_eq!(cleaned.text.as_deref(), Some("Hello there."));
        assert_eq!(cleaned.role, Role::Assistant);
    }

    #[test]
    fn human_sender_maps_to_user() {
        let msg = json!({
            "sender": "human",
            "created_at": "2024-03-01T10:00:00+00:00",
            "content": [{"type": "text", "text": "hi"}],
        });
        assert_eq!(clean_message(&msg).unwrap().role, Role::User);
    }

    #[test]
    fn unknown_sender_is_skipped() {
        let msg = json!({"sender": "bot", "content": []});
        assert!(clean_message(&msg).is_none());
    }

    #[test]
    fn iso_timestamps_convert_to_unix_seconds() {
        let msg = json!({
            "sender": "human",
            "created_at": "2023-11-14T22:13:20Z",
            "content": [{"type": "text", "text": "x"}],
        });
        let t = clean_message(&msg).unwrap().create_time.unwrap();
        assert_eq!(t as i64, 1_700_000_000);
    }

    #[test]
    fn orders_by_time_and_filters_roles() {
        let convo = json!({
            "uuid": "c1",
            "chat_messages": [
                {"sender": "assistant", "created_at": "2024-01-02T00:00:00Z",
                 "content": [{"type": "text", "text": "b"}]},
                {"sender": "human", "created_at": "2024-01-01T00:00:00Z",
                 "content": [{"type": "text", "text": "a"}]},
            ],
        });
        let ordered = order_messages(&convo, &[Role::User, Role::Assistant]);
        let texts: Vec<_> = ordered.iter().map(|m| m.text.clone().unwrap()).collect();
        assert_eq!(texts, vec!["a", "b"]);
    }
}
