// ── Reverie Atoms: Error Types ─────────────────────────────────────────────
// Single canonical error enum for the pipeline, built with `thiserror`.
//
// Design rules:
//   • Variants follow the pipeline taxonomy: input shape errors (streamer,
//     opener, formats), cache errors, and generation-engine errors.
//   • `#[from]` wires std/external error conversions automatically.
//   • `Aborted` is a cancellation sentinel, never a failure — callers must
//     check `is_abort()` before counting an error against a run.
//   • No variant carries secret material (API keys) in its message.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The input stream is not a well-formed JSON array of objects, or a
    /// conversation record has an unrecognized shape.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// The given source path does not point at a regular file.
    #[error("Not a file: {0}")]
    NotAFile(PathBuf),

    /// A ZIP archive was opened but contains no `conversations.json` entry.
    #[error("No conversations.json entry found in archive: {0}")]
    ConversationsJsonMissing(PathBuf),

    /// The ZIP archive could not be read.
    #[error("Archive corrupt: {0}")]
    ArchiveCorrupt(String),

    /// Extraction produced no conversation files for the requested model.
    #[error("No conversations matched model '{model}'")]
    NoMatchingConversations { model: String },

    /// The provider/model preflight roundtrip errored or came back empty.
    #[error("Provider preflight failed: {0}")]
    ProviderPreflightFailed(String),

    /// A single LLM call exhausted its retry budget or hit a terminal error.
    /// Captured into the run's error list without aborting the batch.
    #[error("LLM call failed ({tag}, {attempts} attempts): {message}")]
    LlmCallFailed {
        tag: String,
        attempts: u32,
        message: String,
    },

    /// Every persona observation in a full run failed.
    #[error("Persona extraction failed: {0}")]
    PersonaExtractionFailed(String),

    /// Every memory extraction failed.
    #[error("Memory extraction failed: {0}")]
    MemoryExtractionFailed(String),

    /// A synthesis call failed; the checkpoint survives so the run can be
    /// retried, possibly with a different model.
    #[error("Synthesis failed: {0}")]
    SynthesisFailed(String),

    /// Cancellation sentinel. Never surfaced as a failure.
    #[error("Aborted")]
    Aborted,

    /// Engine configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// True when this error is the cancellation sentinel.
    pub fn is_abort(&self) -> bool {
        matches!(self, EngineError::Aborted)
    }
}

impl From<zip::result::ZipError> for EngineError {
    fn from(e: zip::result::ZipError) -> Self {
        EngineError::ArchiveCorrupt(e.to_string())
    }
}

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

/// All pipeline operations return this type.
pub type EngineResult<T> = Result<T, EngineError>;
