// Reverie Engine — OpenAI-Format Exporter (tree-structured exports)
// Conversations arrive as a `mapping` of node records plus a `current_node`
// pointer. Messages carry per-message model metadata; ordering is either
// timestamp-based or a walk up the current-node path.

use crate::atoms::types::{CleanedMessage, Role};
use crate::engine::formats::{num_field, obj_field, str_field, ConversationMeta};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// Metadata keys searched, in order, for an assistant message's model tag.
const MODEL_METADATA_KEYS: [&str; 3] = ["model_slug", "default_model_slug", "model"];

/// Ordering policy for OpenAI-format messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderPolicy {
    /// Sort by `(has_create_time, create_time)`, untimed messages first;
    /// equal timestamps keep insertion order.
    Time,
    /// Walk `parent` links from `current_node` up the tree, then reverse.
    CurrentPath,
}

/// Raw message dicts out of the mapping, in mapping iteration order.
fn iter_messages(convo: &Value) -> Vec<&Value> {
    let Some(mapping) = obj_field(convo, "mapping") else {
        return Vec::new();
    };
    mapping
        .values()
        .filter_map(|node| node.get("message"))
        .filter(|m| m.is_object())
        .collect()
}

fn message_role(msg: &Value) -> Option<Role> {
    msg.get("author")
        .and_then(|a| str_field(a, "role"))
        .and_then(Role::parse)
}

/// First non-empty model tag in the message metadata.
pub fn message_model(msg: &Value) -> Option<&str> {
    let meta = obj_field(msg, "metadata")?;
    MODEL_METADATA_KEYS
        .iter()
        .find_map(|key| meta.get(*key).and_then(Value::as_str).filter(|s| !s.is_empty()))
}

/// model → assistant-message count for one conversation. Non-assistant
/// messages never contribute, regardless of their metadata.
pub fn conversation_models(convo: &Value) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for msg in iter_messages(convo) {
        if message_role(msg) != Some(Role::Assistant) {
            continue;
        }
        if let Some(model) = message_model(msg) {
            *counts.entry(model.to_string()).or_default() += 1;
        }
    }
    counts
}

/// Pick the primary model among candidates present in one conversation:
/// highest message count wins, ties broken by the lexicographically
/// greater name so the choice is deterministic.
pub fn primary_model<'a>(
    counts: &BTreeMap<String, usize>,
    candidates: impl IntoIterator<Item = &'a str>,
) -> Option<String> {
    candidates
        .into_iter()
        .max_by_key(|m| (counts.get(*m).copied().unwrap_or(0), m.to_string()))
        .map(str::to_string)
}

/// Earliest message timestamp, falling back to the conversation's own
/// `create_time`.
pub fn first_message_time(convo: &Value) -> Option<f64> {
    let min = iter_messages(convo)
        .iter()
        .filter_map(|m| num_field(m, "create_time"))
        .fold(None::<f64>, |acc, t| Some(acc.map_or(t, |a| a.min(t))));
    min.or_else(|| num_field(convo, "create_time"))
}

/// Normalize one raw message. If every part is a string, `text` becomes
/// their concatenation; otherwise `text` stays empty and the parts are
/// carried opaquely.
pub fn clean_message(msg: &Value) -> Option<CleanedMessage> {
    let role = message_role(msg)?;
    let content = msg.get("content");
    let content_type = content
        .and_then(|c| str_field(c, "content_type"))
        .map(str::to_string);
    let parts: Vec<Value> = content
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let text = if !parts.is_empty() && parts.iter().all(Value::is_string) {
        Some(
            parts
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .concat(),
        )
    } else {
        None
    };

    Some(CleanedMessage {
        id: str_field(msg, "id").map(str::to_string),
        role,
        name: msg
            .get("author")
            .and_then(|a| str_field(a, "name"))
            .map(str::to_string),
        create_time: num_field(msg, "create_time"),
        content_type,
        parts,
        text,
        model: message_model(msg).map(str::to_string),
    })
}

/// Cleaned messages of the requested roles, ordered per policy.
pub fn order_messages(convo: &Value, roles: &[Role], order: OrderPolicy) -> Vec<CleanedMessage> {
    match order {
        OrderPolicy::CurrentPath => {
            let Some(mapping) = obj_field(convo, "mapping") else {
                return Vec::new();
            };
            let mut path = Vec::new();
            let mut visited: HashSet<String> = HashSet::new();
            let mut node_id = str_field(convo, "current_node").map(str::to_string);
            // A malformed export can form a parent cycle; the visited set
            // terminates the walk with whatever was collected.
            while let Some(id) = node_id {
                if !visited.insert(id.clone()) {
                    break;
                }
                let Some(node) = mapping.get(&id) else { break };
                if let Some(msg) = node.get("message").filter(|m| m.is_object()) {
                    if let Some(cleaned) = clean_message(msg) {
                        if roles.contains(&cleaned.role) {
                            path.push(cleaned);
                        }
                    }
                }
                node_id = str_field(node, "parent").map(str::to_string);
            }
            path.reverse();
            path
        }
        OrderPolicy::Time => {
            let mut msgs: Vec<CleanedMessage> = iter_messages(convo)
                .into_iter()
                .filter_map(clean_message)
                .filter(|m| roles.contains(&m.role))
                .collect();
            // Stable: untimed messages sort before timed ones, equal
            // timestamps keep insertion order.
            msgs.sort_by(|a, b| {
                let ka = (a.create_time.is_some(), a.create_time.unwrap_or(0.0));
                let kb = (b.create_time.is_some(), b.create_time.unwrap_or(0.0));
                ka.partial_cmp(&kb).unwrap_or(std::cmp::Ordering::Equal)
            });
            msgs
        }
    }
}

/// Conversation-level metadata for the JSON emission layout.
pub fn conversation_meta(convo: &Value) -> ConversationMeta {
    ConversationMeta {
        conversation_id: conversation_id(convo),
        title: str_field(convo, "title").map(str::to_string),
        create_time: num_field(convo, "create_time"),
        update_time: num_field(convo, "update_time"),
    }
}

pub fn conversation_id(convo: &Value) -> Option<String> {
    str_field(convo, "conversation_id")
        .or_else(|| str_field(convo, "id"))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str, role: &str, text: &str, time: Option<f64>, model: Option<&str>) -> Value {
        let mut metadata = json!({});
        if let Some(m) = model {
            metadata = json!({ "model_slug": m });
        }
        json!({
            "message": {
                "id": id,
                "author": { "role": role },
                "create_time": time,
                "content": { "content_type": "text", "parts": [text] },
                "metadata": metadata,
            }
        })
    }

    #[test]
    fn model_discovery_ignores_non_assistant_messages() {
        let convo = json!({
            "mapping": {
                "n1": node("m1", "user", "hi", Some(1.0), Some("should-not-count")),
                "n2": node("m2", "assistant", "hello", Some(2.0), Some("m-a")),
                "n3": node("m3", "tool", "ignored", Some(3.0), Some("m-x")),
            }
        });
        let counts = conversation_models(&convo);
        assert_eq!(counts.len(), 1);
        assert_eq!(counts["m-a"], 1);
    }

    #[test]
    fn model_key_fallback_order() {
        let msg = json!({
            "author": {"role": "assistant"},
            "metadata": {"default_model_slug": "fallback", "model": "last"},
        });
        assert_eq!(message_model(&msg), Some("fallback"));

        let msg2 = json!({
            "author": {"role": "assistant"},
            "metadata": {"model_slug": "", "model": "last"},
        });
        assert_eq!(message_model(&msg2), Some("last"));
    }

    #[test]
    fn primary_model_tie_breaks_lexicographically() {
        let mut counts = BTreeMap::new();
        counts.insert("m-a".to_string(), 2usize);
        counts.insert("m-b".to_string(), 2usize);
        assert_eq!(
            primary_model(&counts, ["m-a", "m-b"]),
            Some("m-b".to_string())
        );
        counts.insert("m-a".to_string(), 3);
        assert_eq!(
            primary_model(&counts, ["m-a", "m-b"]),
            Some("m-a".to_string())
        );
    }

    #[test]
    fn time_order_sorts_untimed_first_and_is_stable() {
        let convo = json!({
            "mapping": {
                "a": node("1", "assistant", "late", Some(9.0), None),
                "b": node("2", "user", "untimed", None, None),
                "c": node("3", "user", "early", Some(1.0), None),
            }
        });
        let ordered = order_messages(
            &convo,
            &[Role::System, Role::User, Role::Assistant],
            OrderPolicy::Time,
        );
        let texts: Vec<_> = ordered.iter().map(|m| m.text.clone().unwrap()).collect();
        assert_eq!(texts, vec!["untimed", "early", "late"]);
    }

    #[test]
    fn current_path_walk_reverses_and_breaks_cycles() {
        let mut n1 = node("1", "user", "first", Some(1.0), None);
        n1["parent"] = Value::Null;
        let mut n2 = node("2", "assistant", "second", Some(2.0), None);
        n2["parent"] = json!("n1");
        let mut n3 = node("3", "user", "third", Some(3.0), None);
        n3["parent"] = json!("n2");

        let convo = json!({
            "current_node": "n3",
            "mapping": { "n1": n1, "n2": n2, "n3": n3 }
        });
        let ordered = order_messages(&convo, &[Role::User, Role::Assistant], OrderPolicy::CurrentPath);
        let texts: Vec<_> = ordered.iter().map(|m| m.text.clone().unwrap()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);

        // Cycle: n1's parent points back at n3.
        let mut cyclic = convo.clone();
        cyclic["mapping"]["n1"]["parent"] = json!("n3");
        let ordered = order_messages(&cyclic, &[Role::User, Role::Assistant], OrderPolicy::CurrentPath);
        assert_eq!(ordered.len(), 3);
    }

    #[test]
    fn clean_message_concatenates_string_parts() {
        let msg = json!({
            "id": "m1",
            "author": {"role": "assistant"},
            "create_time": 5.0,
            "content": {"content_type": "text", "parts": ["a", "b", "c"]},
            "metadata": {},
        });
        let cleaned = clean_message(&msg).unwrap();
        assert_eq!(cleaned.text.as_deref(), Some("abc"));

        let mixed = json!({
            "author": {"role": "user"},
            "content": {"content_type": "multimodal_text", "parts": ["a", {"image": true}]},
        });
        let cleaned = clean_message(&mixed).unwrap();
        assert!(cleaned.text.is_none());
        assert_eq!(cleaned.parts.len(), 2);
    }
}
