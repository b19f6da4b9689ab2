// Reverie Engine — Conversation Sampler & Packet Builder
// Scores cleaned conversation files, selects a deterministic subset under a
// sampling policy, and produces token-budgeted transcript packets for the
// generation engine. All randomness flows through one seeded RNG so a run
// is reproducible across restarts and processes.

use crate::atoms::error::EngineResult;
use crate::atoms::types::{normalize_ws, ConversationPacket, ConversationScore, Role};
use crate::engine::budget::estimate_tokens;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::BufRead;
use std::path::{Path, PathBuf};

// ── Sampling policy ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMode {
    /// Highest-scoring conversations first.
    Top,
    /// Seeded shuffle, first N.
    RandomUniform,
    /// Weighted sampling without replacement, proportional to score weight.
    WeightedRandom,
}

impl SamplingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SamplingMode::Top => "top",
            SamplingMode::RandomUniform => "random-uniform",
            SamplingMode::WeightedRandom => "weighted-random",
        }
    }

    pub fn parse(raw: &str) -> SamplingMode {
        match raw.trim().to_lowercase().as_str() {
            "top" | "ranked" | "top-ranked" => SamplingMode::Top,
            "random-uniform" | "uniform-random" => SamplingMode::RandomUniform,
            _ => SamplingMode::WeightedRandom,
        }
    }
}

// ── Reading cleaned conversations ──────────────────────────────────────────

/// A scored conversation with its role/content lines ready for packets.
#[derive(Debug, Clone)]
pub struct ScoredConversation {
    pub score: ConversationScore,
    pub messages: Vec<(Role, String)>,
}

/// Read a cleaned JSONL conversation file into `(role, content)` pairs.
/// Unparsable lines are skipped; content prefers `text` and falls back to
/// concatenated string parts, whitespace-normalized either way.
pub fn read_conversation(path: &Path) -> EngineResult<Vec<(Role, String)>> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let mut messages = Vec::new();

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(obj) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let Some(role) = obj.get("role").and_then(Value::as_str).and_then(Role::parse)
        else {
            continue;
        };

        let mut text = obj
            .get("text")
            .and_then(Value::as_str)
            .map(normalize_ws)
            .unwrap_or_default();
        if text.is_empty() {
            if let Some(parts) = obj.get("parts").and_then(Value::as_array) {
                let joined: String = parts.iter().filter_map(Value::as_str).collect();
                text = normalize_ws(&joined);
            }
        }
        if text.is_empty() {
            continue;
        }
        messages.push((role, text));
    }
    Ok(messages)
}

/// Score every readable, non-empty conversation file.
pub fn score_conversations(files: &[PathBuf]) -> Vec<ScoredConversation> {
    let mut scored = Vec::new();
    for path in files {
        let Ok(messages) = read_conversation(path) else {
            continue;
        };
        if messages.is_empty() {
            continue;
        }
        let assistant_turns = messages.iter().filter(|(r, _)| *r == Role::Assistant).count();
        let assistant_chars: usize = messages
            .iter()
            .filter(|(r, _)| *r == Role::Assistant)
            .map(|(_, c)| c.chars().count())
            .sum();
        scored.push(ScoredConversation {
            score: ConversationScore {
                file_name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                file_path: path.clone(),
                assistant_chars,
                assistant_turns,
                turns: messages.len(),
            },
            messages,
        });
    }
    scored
}

// ── Selection ──────────────────────────────────────────────────────────────

/// Select up to `limit` conversations under the given policy. Zero `limit`
/// means "all". Deterministic for a fixed seed and fixed inputs.
pub fn select_conversations(
    mut scored: Vec<ScoredConversation>,
    limit: usize,
    mode: SamplingMode,
    seed: u32,
) -> Vec<ScoredConversation> {
    // Canonical pre-order so selection is independent of directory listing
    // order: best-first, file name as the final tiebreak.
    scored.sort_by(|a, b| {
        b.score
            .assistant_chars
            .cmp(&a.score.assistant_chars)
            .then(b.score.assistant_turns.cmp(&a.score.assistant_turns))
            .then(b.score.turns.cmp(&a.score.turns))
            .then(a.score.file_name.cmp(&b.score.file_name))
    });

    let take = if limit == 0 || limit >= scored.len() {
        scored.len()
    } else {
        limit
    };
    let mut rng = StdRng::seed_from_u64(u64::from(seed));

    match mode {
        SamplingMode::Top => {
            scored.truncate(take);
            scored
        }
        SamplingMode::RandomUniform => {
            scored.shuffle(&mut rng);
            scored.truncate(take);
            scored
        }
        SamplingMode::WeightedRandom => {
            let mut pool = scored;
            let mut selected = Vec::with_capacity(take);
            while !pool.is_empty() && selected.len() < take {
                let weights: Vec<f64> = pool.iter().map(|c| c.score.weight()).collect();
                let total: f64 = weights.iter().sum();
                let pick = rng.gen::<f64>() * total;
                let mut cursor = 0.0;
                let mut chosen = pool.len() - 1;
                for (i, w) in weights.iter().enumerate() {
                    cursor += w;
                    if cursor >= pick {
                        chosen = i;
                        break;
                    }
                }
                selected.push(pool.remove(chosen));
            }
            selected
        }
    }
}

// ── Seed derivation ────────────────────────────────────────────────────────

/// Run-shaping parameters hashed into the effective sampling seed when the
/// caller supplies none. Identical inputs reproduce identical selections
/// across restarts.
#[derive(Debug, Clone)]
pub struct SeedInputs<'a> {
    pub model_dir: &'a Path,
    pub primary_model: &'a str,
    pub companion_name: &'a str,
    pub sample_size: usize,
    pub sampling_mode: SamplingMode,
    pub max_messages_per_conversation: usize,
    pub max_chars_per_conversation: usize,
    pub max_total_chars: usize,
    pub prompt_override_digest: &'a str,
}

/// Stable 32-bit hash of the run-shaping parameters.
pub fn derive_seed(inputs: &SeedInputs<'_>) -> u32 {
    let resolved = std::fs::canonicalize(inputs.model_dir)
        .unwrap_or_else(|_| inputs.model_dir.to_path_buf());
    let fields = [
        resolved.to_string_lossy().into_owned(),
        inputs.primary_model.to_string(),
        inputs.companion_name.to_string(),
        inputs.sample_size.to_string(),
        inputs.sampling_mode.as_str().to_string(),
        inputs.max_messages_per_conversation.to_string(),
        inputs.max_chars_per_conversation.to_string(),
        inputs.max_total_chars.to_string(),
        inputs.prompt_override_digest.to_string(),
    ];
    let mut hasher = Sha256::new();
    for field in &fields {
        hasher.update(field.as_bytes());
        hasher.update([0x1f]);
    }
    let digest = hasher.finalize();
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

// ── Packet construction ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct PacketBudgets {
    pub max_messages_per_conversation: usize,
    pub max_chars_per_conversation: usize,
    pub max_total_chars: usize,
}

/// Effective per-conversation character budget: the per-conversation cap,
/// tightened so N conversations fit the total budget.
pub fn effective_char_budget(budgets: &PacketBudgets, selected_count: usize) -> usize {
    let share = (budgets.max_total_chars / selected_count.max(1)).max(1);
    budgets.max_chars_per_conversation.min(share)
}

/// Build one packet per selected conversation. Messages are appended in
/// order until the next line would exceed the char budget or the message
/// cap; empty packets are dropped.
pub fn build_packets(
    selected: &[ScoredConversation],
    budgets: &PacketBudgets,
) -> Vec<ConversationPacket> {
    let char_budget = effective_char_budget(budgets, selected.len());
    let mut packets = Vec::with_capacity(selected.len());

    for convo in selected {
        let mut lines: Vec<String> = Vec::new();
        let mut chars = 0usize;
        let mut used = 0usize;

        for (role, content) in convo
            .messages
            .iter()
            .take(budgets.max_messages_per_conversation)
        {
            let line = format!("[{}] {}", role.as_str(), content);
            let line_chars = line.chars().count();
            if chars + line_chars > char_budget {
                break;
            }
            lines.push(line);
            chars += line_chars;
            used += 1;
        }

        let transcript = lines.join("\n");
        if used == 0 || transcript.trim().is_empty() {
            continue;
        }

        let conversation_id = convo
            .score
            .file_name
            .rsplit_once('.')
            .map(|(stem, _)| stem.to_string())
            .unwrap_or_else(|| convo.score.file_name.clone());
        let token_estimate = estimate_tokens(&transcript);
        packets.push(ConversationPacket {
            conversation_id,
            source_file: convo.score.file_name.clone(),
            source_path: convo.score.file_path.clone(),
            transcript,
            messages_used: used,
            char_count: chars,
            token_estimate,
        });
    }
    packets
}

/// Concatenated packet transcripts with per-conversation headers; used for
/// downstream fidelity comparison.
pub fn build_analysis_transcript(packets: &[ConversationPacket]) -> String {
    packets
        .iter()
        .map(|p| format!("=== conversation: {} ===\n{}", p.conversation_id, p.transcript))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_convo(dir: &Path, name: &str, lines: &[(&str, &str)]) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        for (role, text) in lines {
            writeln!(
                f,
                r#"{{"id":null,"role":"{role}","name":null,"create_time":null,"content_type":"text","parts":["{text}"],"text":"{text}","model":null}}"#
            )
            .unwrap();
        }
        path
    }

    fn fixture(dir: &Path) -> Vec<PathBuf> {
        vec![
            write_convo(
                dir,
                "m_20240101_long.jsonl",
                &[
                    ("user", "tell me everything"),
                    ("assistant", "a very long and thorough explanation of it all"),
                    ("assistant", "and a second long follow-up message as well"),
                ],
            ),
            write_convo(
                dir,
                "m_20240102_short.jsonl",
                &[("user", "hi"), ("assistant", "hey")],
            ),
            write_convo(
                dir,
                "m_20240103_mid.jsonl",
                &[("user", "question"), ("assistant", "a middling answer here")],
            ),
        ]
    }

    #[test]
    fn scoring_counts_assistant_volume() {
        let dir = tempfile::tempdir().unwrap();
        let files = fixture(dir.path());
        let scored = score_conversations(&files);
        assert_eq!(scored.len(), 3);
        let long = scored
            .iter()
            .find(|c| c.score.file_name.contains("long"))
            .unwrap();
        assert_eq!(long.score.assistant_turns, 2);
        assert_eq!(long.score.turns, 3);
        assert!(long.score.assistant_chars > 60);
    }

    #[test]
    fn top_selection_orders_by_score_then_name() {
        let dir = tempfile::tempdir().unwrap();
        let scored = score_conversations(&fixture(dir.path()));
        let selected = select_conversations(scored, 2, SamplingMode::Top, 0);
        assert_eq!(selected.len(), 2);
        assert!(selected[0].score.file_name.contains("long"));
        assert!(selected[1].score.file_name.contains("mid"));
    }

    #[test]
    fn all_policies_are_reproducible_for_a_fixed_seed() {
        let dir = tempfile::tempdir().unwrap();
        let files = fixture(dir.path());
        for mode in [
            SamplingMode::Top,
            SamplingMode::RandomUniform,
            SamplingMode::WeightedRandom,
        ] {
            let a: Vec<String> =
                select_conversations(score_conversations(&files), 2, mode, 1234)
                    .iter()
                    .map(|c| c.score.file_name.clone())
                    .collect();
            let b: Vec<String> =
                select_conversations(score_conversations(&files), 2, mode, 1234)
                    .iter()
                    .map(|c| c.score.file_name.clone())
                    .collect();
            assert_eq!(a, b, "mode {:?} not reproducible", mode);
        }
    }

    #[test]
    fn different_seeds_can_differ() {
        let dir = tempfile::tempdir().unwrap();
        let files = fixture(dir.path());
        // Not guaranteed for any seed pair, but these differ for this input.
        let picks: Vec<Vec<String>> = (0u32..16)
            .map(|seed| {
                select_conversations(
                    score_conversations(&files),
                    2,
                    SamplingMode::WeightedRandom,
                    seed,
                )
                .iter()
                .map(|c| c.score.file_name.clone())
                .collect()
            })
            .collect();
        assert!(picks.iter().any(|p| *p != picks[0]));
    }

    #[test]
    fn derived_seed_is_stable_and_parameter_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        let base = SeedInputs {
            model_dir: dir.path(),
            primary_model: "m-a",
            companion_name: "Ember",
            sample_size: 24,
            sampling_mode: SamplingMode::WeightedRandom,
            max_messages_per_conversation: 60,
            max_chars_per_conversation: 9000,
            max_total_chars: 90_000,
            prompt_override_digest: "none",
        };
        assert_eq!(derive_seed(&base), derive_seed(&base));
        let renamed = SeedInputs {
            companion_name: "Someone",
            ..base.clone()
        };
        assert_ne!(derive_seed(&base), derive_seed(&renamed));
    }

    #[test]
    fn packets_respect_budgets_and_drop_empties() {
        let dir = tempfile::tempdir().unwrap();
        let scored = score_conversations(&fixture(dir.path()));
        let selected = select_conversations(scored, 0, SamplingMode::Top, 0);
        let budgets = PacketBudgets {
            max_messages_per_conversation: 2,
            max_chars_per_conversation: 60,
            max_total_chars: 600,
        };
        let packets = build_packets(&selected, &budgets);
        let effective = effective_char_budget(&budgets, selected.len());
        assert!(!packets.is_empty());
        for p in &packets {
            assert!(p.char_count <= effective);
            assert!(p.messages_used <= 2);
            assert!(!p.transcript.trim().is_empty());
            assert!(p.token_estimate >= 1);
        }

        // A tiny total budget starves conversations down to empty packets,
        // which are dropped rather than emitted.
        let starved = PacketBudgets {
            max_messages_per_conversation: 2,
            max_chars_per_conversation: 60,
            max_total_chars: 3,
        };
        let packets = build_packets(&selected, &starved);
        assert!(packets.is_empty());
    }

    #[test]
    fn analysis_transcript_concatenates_with_headers() {
        let dir = tempfile::tempdir().unwrap();
        let scored = score_conversations(&fixture(dir.path()));
        let selected = select_conversations(scored, 2, SamplingMode::Top, 0);
        let packets = build_packets(
            &selected,
            &PacketBudgets {
                max_messages_per_conversation: 10,
                max_chars_per_conversation: 1000,
                max_total_chars: 10_000,
            },
        );
        let transcript = build_analysis_transcript(&packets);
        assert!(transcript.contains("=== conversation: m_20240101_long ==="));
        assert!(transcript.contains("[assistant]"));
    }
}
