// Reverie Engine — companion preservation pipeline
// Streams multi-gigabyte chat-history exports, normalizes two vendor formats,
// caches per-conversation extractions, samples transcripts deterministically,
// and drives a resumable staged-LLM reconstruction of a Character Card V3
// plus a keyed memory lorebook.

pub mod atoms;
pub mod engine;

pub use atoms::error::{EngineError, EngineResult};
pub use atoms::types::{
    CleanedMessage, ConversationPacket, ConversationScore, LorebookEntry, MemoryCandidate,
    MemoryCategory, Role,
};
pub use engine::generation::{
    run_generation, GenerationOutput, GenerationParams, GenerationRequest, GenerationStatus,
};
pub use engine::llm::{CallOptions, HttpLlmClient, JsonCompletion, LlmClient, LlmConfig, Provider};
pub use engine::sampler::SamplingMode;
