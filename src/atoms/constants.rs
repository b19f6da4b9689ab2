// ── Reverie Atoms: Constants ───────────────────────────────────────────────
// Tuning knobs shared across the pipeline. Values that callers may want to
// override live on the request structs instead; these are the fixed floors
// and caps of the engine itself.

/// Maximum attempts per LLM call (first try + retries).
pub const MAX_LLM_ATTEMPTS: u32 = 6;

/// Cap on a single retry backoff delay, in seconds.
pub const MAX_RETRY_DELAY_SECS: f64 = 45.0;

/// Hard ceiling on concurrent per-conversation LLM calls.
pub const MAX_PARALLEL_CALLS_CAP: usize = 16;

/// Tokens reserved out of the model context window for the response and
/// prompt scaffolding.
pub const CONTEXT_RESERVE_TOKENS: usize = 2500;

/// Floor on the usable context after the reserve is subtracted.
pub const MIN_USABLE_CONTEXT_TOKENS: usize = 2048;

/// Floor on the per-conversation input budget.
pub const MIN_PER_CHAT_BUDGET_TOKENS: usize = 900;

/// Floor on the synthesis input budget.
pub const MIN_SYNTHESIS_BUDGET_TOKENS: usize = 1200;

/// Heuristic character-per-token ratio for budget math.
pub const CHARS_PER_TOKEN: usize = 4;

/// Default per-call HTTP timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 180;

/// Max retrieval keys kept on a single memory entry.
pub const MAX_MEMORY_KEYS: usize = 8;

/// How many individual errors an aggregated summary names before "+N more".
pub const ERROR_SUMMARY_HEAD: usize = 4;

/// max_tokens for the preflight ping call.
pub const PREFLIGHT_MAX_TOKENS: u32 = 64;

/// Chunk size for incremental reads of export files (1 MiB).
pub const STREAM_CHUNK_SIZE: usize = 1024 * 1024;

/// Model tag assigned to every conversation in a flat Anthropic export,
/// which carries no per-message model metadata.
pub const IMPLICIT_ANTHROPIC_MODEL_TAG: &str = "claude";
