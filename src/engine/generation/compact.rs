// Reverie Engine — Memory Compactor
// Deduplicates memory candidates before synthesis (so the synthesizer sees
// a clean input) and again on the shaped lorebook. Two entries collide when
// either their normalized content or their normalized key set matches;
// merging unions keys, keeps the higher priority and the longer content,
// and fills source fields that were previously empty.

use crate::atoms::constants::MAX_MEMORY_KEYS;
use crate::atoms::types::{normalize_ws, MemoryCandidate};
use std::collections::HashMap;

/// Lowercased, whitespace-normalized content signature.
fn content_signature(content: &str) -> String {
    normalize_ws(content).to_lowercase()
}

/// Lowercased keys joined in sorted order, so key order never splits a
/// duplicate pair.
fn keys_signature(keys: &[String]) -> String {
    let mut normalized: Vec<String> = keys
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized.join("|")
}

fn merge_into(existing: &mut MemoryCandidate, incoming: &MemoryCandidate) {
    // Union keys case-insensitively, preserving first-seen order and casing.
    let mut seen: Vec<String> = existing.keys.iter().map(|k| k.to_lowercase()).collect();
    for key in &incoming.keys {
        let norm = key.to_lowercase();
        if !seen.contains(&norm) {
            seen.push(norm);
            existing.keys.push(key.clone());
        }
    }
    existing.keys.truncate(MAX_MEMORY_KEYS);

    existing.priority = existing.priority.max(incoming.priority);
    if incoming.content.len() > existing.content.len() {
        existing.content = incoming.content.clone();
    }
    if existing.source_conversation.is_none() {
        existing.source_conversation = incoming.source_conversation.clone();
    }
    if existing.source_date.is_none() {
        existing.source_date = incoming.source_date.clone();
    }
}

/// Deduplicate a candidate list. Idempotent: compacting a compacted list
/// is a no-op.
pub fn compact_candidates(candidates: &[MemoryCandidate]) -> Vec<MemoryCandidate> {
    let mut compacted: Vec<MemoryCandidate> = Vec::new();
    let mut by_content: HashMap<String, usize> = HashMap::new();
    let mut by_keys: HashMap<String, usize> = HashMap::new();

    for raw in candidates {
        let content = normalize_ws(&raw.content);
        let mut keys: Vec<String> = raw
            .keys
            .iter()
            .map(|k| normalize_ws(k))
            .filter(|k| !k.is_empty())
            .collect();
        keys.truncate(MAX_MEMORY_KEYS);
        if content.is_empty() || keys.is_empty() {
            continue;
        }

        let candidate = MemoryCandidate {
            name: if raw.name.trim().is_empty() {
                "Memory".to_string()
            } else {
                normalize_ws(&raw.name)
            },
            keys,
            content,
            category: raw.category,
            priority: raw.priority,
            source_conversation: raw.source_conversation.clone(),
            source_date: raw.source_date.clone(),
        };

        let csig = content_signature(&candidate.content);
        let ksig = keys_signature(&candidate.keys);
        let hit = by_content.get(&csig).or_else(|| by_keys.get(&ksig)).copied();

        match hit {
            Some(idx) => {
                merge_into(&mut compacted[idx], &candidate);
                // The merge may have changed content or keys; keep both
                // indices pointing at the merged entry.
                by_content.insert(content_signature(&compacted[idx].content), idx);
                by_keys.insert(keys_signature(&compacted[idx].keys), idx);
                by_content.insert(csig, idx);
                by_keys.insert(ksig, idx);
            }
            None => {
                let idx = compacted.len();
                compacted.push(candidate);
                by_content.insert(csig, idx);
                by_keys.insert(ksig, idx);
            }
        }
    }
    compacted
}

/// Keep the `max` highest-priority entries, stable within equal priority.
pub fn cap_by_priority(mut entries: Vec<MemoryCandidate>, max: usize) -> Vec<MemoryCandidate> {
    if max == 0 || entries.len() <= max {
        return entries;
    }
    entries.sort_by(|a, b| b.priority.cmp(&a.priority));
    entries.truncate(max);
    entries
}
