// Reverie Engine — Context Budgeting
// Token budgets derive from the configured model context window; when the
// caller does not supply one, a model-name heuristic fills in. All token
// math uses the 4-chars-per-token approximation.

use crate::atoms::constants::{
    CHARS_PER_TOKEN, CONTEXT_RESERVE_TOKENS, MIN_PER_CHAT_BUDGET_TOKENS,
    MIN_SYNTHESIS_BUDGET_TOKENS, MIN_USABLE_CONTEXT_TOKENS,
};

/// Token budgets for one generation run.
#[derive(Debug, Clone, Copy)]
pub struct ContextBudgets {
    pub context_window: usize,
    pub usable_context: usize,
    /// Input budget for one per-conversation extraction call.
    pub per_chat_tokens: usize,
    /// Input budget for a synthesis call.
    pub synthesis_tokens: usize,
}

impl ContextBudgets {
    pub fn for_window(context_window: usize) -> Self {
        let usable = context_window
            .saturating_sub(CONTEXT_RESERVE_TOKENS)
            .max(MIN_USABLE_CONTEXT_TOKENS);
        ContextBudgets {
            context_window,
            usable_context: usable,
            per_chat_tokens: (usable * 9 / 10).max(MIN_PER_CHAT_BUDGET_TOKENS),
            synthesis_tokens: (usable * 9 / 10).max(MIN_SYNTHESIS_BUDGET_TOKENS),
        }
    }

    /// Character capacity of the usable context.
    pub fn usable_chars(&self) -> usize {
        self.usable_context * CHARS_PER_TOKEN
    }
}

/// ~4 characters per token, floor 1 for non-empty text.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    text.chars().count().div_ceil(CHARS_PER_TOKEN).max(1)
}

/// Truncate to `token_budget * 4` characters, respecting char boundaries.
pub fn truncate_to_token_budget(text: &str, token_budget: usize) -> &str {
    if token_budget == 0 {
        return "";
    }
    let char_budget = token_budget * CHARS_PER_TOKEN;
    match text.char_indices().nth(char_budget) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

// ── Model-name heuristics ──────────────────────────────────────────────────

/// Infer a context window from a model name. First matching needle wins;
/// unknown models get a conservative 32k.
pub fn infer_context_window(model_name: &str) -> usize {
    let m = model_name.to_lowercase();
    if m.is_empty() {
        return 32_000;
    }
    const RULES: &[(&str, usize)] = &[
        // Premium / large-context closed models
        ("grok-4", 2_000_000),
        ("gpt-5.2", 400_000),
        ("gpt-5", 400_000),
        ("gpt-5-mini", 400_000),
        ("gemini-3", 1_000_000),
        ("gemini-2.0", 1_000_000),
        ("gemini-1.5", 1_000_000),
        // Open-weight large context
        ("kimi", 262_000),
        ("deepseek-v3", 164_000),
        ("minimax", 197_000),
        ("qwen3", 262_000),
        ("glm-5", 205_000),
        ("glm-4", 128_000),
        // Standard models
        ("gpt-4o", 128_000),
        ("gpt-4.1", 128_000),
        ("gpt-4-turbo", 128_000),
        ("gpt-4", 8_192),
        ("claude-sonnet-4", 200_000),
        ("claude-3.7", 200_000),
        ("claude-3.5", 200_000),
        ("claude-3", 200_000),
        ("sonnet", 200_000),
        ("haiku", 200_000),
        ("opus", 200_000),
        ("hermes-4", 128_000),
        ("mistral-large", 128_000),
        ("deepseek", 64_000),
        ("qwen", 32_000),
        ("llama-3.3", 128_000),
        ("llama-3.2", 128_000),
        ("llama-3.1", 128_000),
        ("mistral", 32_000),
    ];
    for (needle, size) in RULES {
        if m.contains(needle) {
            return *size;
        }
    }
    32_000
}

// ── Budget presets ─────────────────────────────────────────────────────────

/// Sampling/transcript budgets derived from a context-window bucket.
#[derive(Debug, Clone, Copy)]
pub struct BudgetPreset {
    pub max_messages_per_conversation: usize,
    pub max_chars_per_conversation: usize,
    pub max_total_chars: usize,
    pub request_timeout_secs: u64,
}

/// Bucket a window into the preset tiers.
pub fn bucket_for_window(window_tokens: usize) -> &'static str {
    if window_tokens >= 500_000 {
        "1m"
    } else if window_tokens >= 180_000 {
        "200k"
    } else if window_tokens >= 100_000 {
        "128k"
    } else {
        "64k"
    }
}

pub fn budget_preset(bucket: &str) -> BudgetPreset {
    match bucket {
        "1m" => BudgetPreset {
            max_messages_per_conversation: 120,
            max_chars_per_conversation: 26_000,
            max_total_chars: 420_000,
            request_timeout_secs: 480,
        },
        "200k" => BudgetPreset {
            max_messages_per_conversation: 90,
            max_chars_per_conversation: 18_000,
            max_total_chars: 240_000,
            request_timeout_secs: 300,
        },
        "128k" => BudgetPreset {
            max_messages_per_conversation: 70,
            max_chars_per_conversation: 14_000,
            max_total_chars: 160_000,
            request_timeout_secs: 240,
        },
        _ => BudgetPreset {
            max_messages_per_conversation: 50,
            max_chars_per_conversation: 9_000,
            max_total_chars: 90_000,
            request_timeout_secs: 180,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budgets_respect_floors() {
        let small = ContextBudgets::for_window(1_000);
        assert_eq!(small.usable_context, 2048);
        assert!(small.per_chat_tokens >= 900);
        assert!(small.synthesis_tokens >= 1200);

        let big = ContextBudgets::for_window(200_000);
        assert_eq!(big.usable_context, 197_500);
        assert_eq!(big.per_chat_tokens, 197_500 * 9 / 10);
    }

    #[test]
    fn token_estimation() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "aééé"; // multi-byte chars
        let cut = truncate_to_token_budget(text, 1); // 4 chars
        assert_eq!(cut, "aééé");
        let long = "x".repeat(100);
        assert_eq!(truncate_to_token_budget(&long, 5).len(), 20);
        assert_eq!(truncate_to_token_budget(&long, 0), "");
    }

    #[test]
    fn window_inference_first_match_wins() {
        assert_eq!(infer_context_window("claude-3.5-sonnet"), 200_000);
        assert_eq!(infer_context_window("gpt-4o-mini"), 128_000);
        assert_eq!(infer_context_window("gpt-4"), 8_192);
        assert_eq!(infer_context_window("totally-new-model"), 32_000);
    }

    #[test]
    fn buckets() {
        assert_eq!(bucket_for_window(1_000_000), "1m");
        assert_eq!(bucket_for_window(200_000), "200k");
        assert_eq!(bucket_for_window(128_000), "128k");
        assert_eq!(bucket_for_window(32_000), "64k");
    }
}
