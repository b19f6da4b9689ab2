// Reverie Engine — Resume Checkpoint
// Durable record of completed per-conversation LLM work. A checkpoint is
// keyed by a signature over the run-shaping parameters; a mismatched
// signature invalidates prior state so a resumed run never mixes inputs.
//
// Writes are serialized through the store's mutex and flushed after every
// successful call, so on-disk state never reflects an interleaved partial
// update and a kill at any point leaves only fully-recorded entries.

use crate::atoms::error::EngineResult;
use crate::atoms::types::MemoryCandidate;
use crate::engine::fsio;
use crate::engine::sampler::SamplingMode;
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResumeCheckpoint {
    pub version: u32,
    pub signature: String,
    pub created_at_utc: String,
    pub updated_at_utc: String,
    pub persona_observations_by_conversation: BTreeMap<String, Value>,
    pub memory_candidates_by_source_file: BTreeMap<String, Vec<MemoryCandidate>>,
    pub processed_memory_files: Vec<String>,
}

impl ResumeCheckpoint {
    fn fresh(signature: &str) -> Self {
        let now = Utc::now().to_rfc3339();
        ResumeCheckpoint {
            version: CHECKPOINT_VERSION,
            signature: signature.to_string(),
            created_at_utc: now.clone(),
            updated_at_utc: now,
            ..Default::default()
        }
    }

    /// A memory file is resumable only when both records agree.
    pub fn memory_file_done(&self, file_name: &str) -> bool {
        self.processed_memory_files.iter().any(|f| f == file_name)
            && self.memory_candidates_by_source_file.contains_key(file_name)
    }

    pub fn observation_done(&self, conversation_id: &str) -> bool {
        self.persona_observations_by_conversation
            .get(conversation_id)
            .map(|v| v.as_object().map(|o| !o.is_empty()).unwrap_or(false))
            .unwrap_or(false)
    }
}

// ── Signature ──────────────────────────────────────────────────────────────

/// Run-shaping parameters covered by the checkpoint signature. Changing any
/// of these invalidates prior checkpoint state.
#[derive(Debug, Clone)]
pub struct SignatureInputs<'a> {
    pub model_dir: &'a Path,
    pub primary_model: &'a str,
    pub companion_name: &'a str,
    pub sampling_mode: SamplingMode,
    pub sampling_seed: u32,
    pub sample_conversations: usize,
    pub max_messages_per_conversation: usize,
    pub max_chars_per_conversation: usize,
    pub max_total_chars: usize,
    pub per_chat_budget_tokens: usize,
    pub synthesis_budget_tokens: usize,
    pub prompt_override_digest: &'a str,
}

pub fn checkpoint_signature(inputs: &SignatureInputs<'_>) -> String {
    let resolved = std::fs::canonicalize(inputs.model_dir)
        .unwrap_or_else(|_| inputs.model_dir.to_path_buf());
    let fields = [
        resolved.to_string_lossy().into_owned(),
        inputs.primary_model.to_string(),
        inputs.companion_name.to_string(),
        inputs.sampling_mode.as_str().to_string(),
        inputs.sampling_seed.to_string(),
        inputs.sample_conversations.to_string(),
        inputs.max_messages_per_conversation.to_string(),
        inputs.max_chars_per_conversation.to_string(),
        inputs.max_total_chars.to_string(),
        inputs.per_chat_budget_tokens.to_string(),
        inputs.synthesis_budget_tokens.to_string(),
        inputs.prompt_override_digest.to_string(),
    ];
    let mut hasher = Sha256::new();
    for field in &fields {
        hasher.update(field.as_bytes());
        hasher.update([0x1f]);
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// ── Store ──────────────────────────────────────────────────────────────────

/// Single owner of the checkpoint file. All mutation goes through the
/// mutex, which also serializes the write-behind flushes.
pub struct CheckpointStore {
    path: PathBuf,
    state: Mutex<ResumeCheckpoint>,
}

impl CheckpointStore {
    /// Load an existing checkpoint iff its signature matches; anything else
    /// (missing file, parse failure, mismatch, `force_rerun`) starts empty.
    pub fn load_or_new(path: impl Into<PathBuf>, signature: &str, force_rerun: bool) -> Self {
        let path = path.into();
        let state = if force_rerun {
            info!("[checkpoint] Force rerun: starting from an empty checkpoint");
            ResumeCheckpoint::fresh(signature)
        } else {
            match std::fs::read_to_string(&path) {
                Ok(raw) => match serde_json::from_str::<ResumeCheckpoint>(&raw) {
                    Ok(cp) if cp.signature == signature => {
                        info!(
                            "[checkpoint] Resuming: {} observations, {} memory files",
                            cp.persona_observations_by_conversation.len(),
                            cp.processed_memory_files.len()
                        );
                        cp
                    }
                    Ok(_) => {
                        info!("[checkpoint] Signature mismatch: starting fresh");
                        ResumeCheckpoint::fresh(signature)
                    }
                    Err(e) => {
                        warn!("[checkpoint] Corrupt checkpoint treated as absent: {e}");
                        ResumeCheckpoint::fresh(signature)
                    }
                },
                Err(_) => ResumeCheckpoint::fresh(signature),
            }
        };
        CheckpointStore {
            path,
            state: Mutex::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> ResumeCheckpoint {
        self.state.lock().await.clone()
    }

    /// Record a persona observation and flush.
    pub async fn record_observation(
        &self,
        conversation_id: &str,
        observation: Value,
    ) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        state
            .persona_observations_by_conversation
            .insert(conversation_id.to_string(), observation);
        state.updated_at_utc = Utc::now().to_rfc3339();
        fsio::write_json_durable(&self.path, &*state)
    }

    /// Record a completed memory extraction and flush.
    pub async fn record_memory_file(
        &self,
        file_name: &str,
        candidates: Vec<MemoryCandidate>,
    ) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        state
            .memory_candidates_by_source_file
            .insert(file_name.to_string(), candidates);
        if !state.processed_memory_files.iter().any(|f| f == file_name) {
            state.processed_memory_files.push(file_name.to_string());
        }
        state.updated_at_utc = Utc::now().to_rfc3339();
        fsio::write_json_durable(&self.path, &*state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::MemoryCategory;
    use serde_json::json;

    fn signature_for(dir: &Path, name: &str) -> String {
        checkpoint_signature(&SignatureInputs {
            model_dir: dir,
            primary_model: "m-a",
            companion_name: name,
            sampling_mode: SamplingMode::Top,
            sampling_seed: 7,
            sample_conversations: 12,
            max_messages_per_conversation: 60,
            max_chars_per_conversation: 9000,
            max_total_chars: 90_000,
            per_chat_budget_tokens: 10_000,
            synthesis_budget_tokens: 12_000,
            prompt_override_digest: "default",
        })
    }

    fn candidate(content: &str) -> MemoryCandidate {
        MemoryCandidate {
            name: "m".into(),
            keys: vec!["k".into()],
            content: content.into(),
            category: MemoryCategory::SharedMemory,
            priority: 10,
            source_conversation: None,
            source_date: None,
        }
    }

    #[tokio::test]
    async fn records_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("generation_resume.json");
        let sig = signature_for(dir.path(), "Ember");

        let store = CheckpointStore::load_or_new(&path, &sig, false);
        store
            .record_observation("c1", json!({"observed_traits": ["warm"]}))
            .await
            .unwrap();
        store
            .record_memory_file("f1.jsonl", vec![candidate("a thing")])
            .await
            .unwrap();

        let reloaded = CheckpointStore::load_or_new(&path, &sig, false);
        let snap = reloaded.snapshot().await;
        assert!(snap.observation_done("c1"));
        assert!(snap.memory_file_done("f1.jsonl"));
        assert!(!snap.memory_file_done("f2.jsonl"));
    }

    #[tokio::test]
    async fn signature_mismatch_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("generation_resume.json");
        let sig = signature_for(dir.path(), "Ember");

        let store = CheckpointStore::load_or_new(&path, &sig, false);
        store.record_observation("c1", json!({"x": 1})).await.unwrap();

        let other_sig = signature_for(dir.path(), "Someone");
        assert_ne!(sig, other_sig);
        let fresh = CheckpointStore::load_or_new(&path, &other_sig, false);
        let snap = fresh.snapshot().await;
        assert!(snap.persona_observations_by_conversation.is_empty());
    }

    #[tokio::test]
    async fn corrupt_checkpoint_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("generation_resume.json");
        std::fs::write(&path, "{ not json").unwrap();

        let sig = signature_for(dir.path(), "Ember");
        let store = CheckpointStore::load_or_new(&path, &sig, false);
        let snap = store.snapshot().await;
        assert!(snap.persona_observations_by_conversation.is_empty());
        assert_eq!(snap.signature, sig);
    }

    #[tokio::test]
    async fn force_rerun_ignores_existing_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("generation_resume.json");
        let sig = signature_for(dir.path(), "Ember");

        let store = CheckpointStore::load_or_new(&path, &sig, false);
        store.record_observation("c1", json!({"x": 1})).await.unwrap();

        let forced = CheckpointStore::load_or_new(&path, &sig, true);
        assert!(forced
            .snapshot()
            .await
            .persona_observations_by_conversation
            .is_empty());
    }

    #[test]
    fn empty_observation_does_not_count_as_done() {
        let mut cp = ResumeCheckpoint::default();
        cp.persona_observations_by_conversation
            .insert("c1".into(), json!({}));
        assert!(!cp.observation_done("c1"));
    }
}
