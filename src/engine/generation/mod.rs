// Reverie Engine — Generation Engine
// Orchestrates the staged LLM reconstruction: preflight, per-conversation
// persona observation and memory extraction under a bounded worker pool,
// persona synthesis, memory synthesis, and artifact emission.
//
// Durability contract: every successful per-conversation call is flushed
// into the resume checkpoint before the conversation is considered done,
// so crashes, cancellation, and rate limiting never re-pay for completed
// work. Synthesis stages always re-run over the current checkpoint and are
// idempotent given the same inputs.

pub mod card;
pub mod checkpoint;
pub mod compact;
pub mod progress;
pub mod scan_manifest;

use crate::atoms::constants::{
    ERROR_SUMMARY_HEAD, MAX_PARALLEL_CALLS_CAP, PREFLIGHT_MAX_TOKENS,
};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{ChatMessage, ConversationPacket, LorebookEntry, MemoryCandidate};
use crate::engine::budget::{self, ContextBudgets};
use crate::engine::formats::parse_export_file_name;
use crate::engine::fsio;
use crate::engine::llm::{CallOptions, LlmClient, LlmConfig, RetryEvent};
use crate::engine::prompts::{fill_template, PromptOverrides, PromptSet, PREFLIGHT_USER};
use crate::engine::sampler::{
    self, build_analysis_transcript, build_packets, score_conversations, select_conversations,
    PacketBudgets, SamplingMode, SeedInputs,
};
use checkpoint::{checkpoint_signature, CheckpointStore, SignatureInputs};
use chrono::Utc;
use log::{info, warn};
use progress::{GenerationPhase, ProgressReporter, ProgressSink};
use scan_manifest::{file_info, ScanManifestStore};
use serde::Serialize;
use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// ── Request & params ───────────────────────────────────────────────────────

/// Sampling, budgets, LLM config, prompt overrides, and run shape.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub companion_name: String,
    pub creator: String,
    pub source_label: Option<String>,
    pub primary_model: String,
    /// 0 = all conversations.
    pub sample_conversations: usize,
    pub sampling: SamplingMode,
    /// None derives a stable seed from the run-shaping parameters.
    pub sampling_seed: Option<u32>,
    pub max_memories: usize,
    pub memory_per_chat_max: usize,
    pub max_messages_per_conversation: usize,
    pub max_chars_per_conversation: usize,
    pub max_total_chars: usize,
    /// 0 infers from the model name.
    pub model_context_window: usize,
    pub max_parallel_calls: usize,
    pub force_rerun: bool,
    pub llm: LlmConfig,
    pub prompts: PromptOverrides,
}

pub struct GenerationParams {
    pub model_dir: PathBuf,
    /// Cleaned conversation files to consider; empty lists the model dir.
    pub available_files: Vec<PathBuf>,
    pub run_dir: PathBuf,
    pub request: GenerationRequest,
    /// Append mode: reuse the card, extend only the lorebook.
    pub append_memories: bool,
    pub existing_card: Option<Value>,
    pub existing_memories: Vec<LorebookEntry>,
    pub source_fingerprint: Option<String>,
    pub cancel: CancellationToken,
    pub on_progress: Option<ProgressSink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StageStats {
    pub context_window: usize,
    pub per_chat_budget_tokens: usize,
    pub synthesis_budget_tokens: usize,
    pub persona_packets: usize,
    pub memory_packets: usize,
    pub observations_total: usize,
    pub memory_candidates_total: usize,
    pub lorebook_entries: usize,
    pub calls_started: usize,
    pub calls_completed: usize,
    pub calls_failed: usize,
    pub total_calls: usize,
}

#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub status: GenerationStatus,
    pub card: Value,
    pub lorebook: Value,
    pub persona_payload: Value,
    pub memories_payload: Value,
    pub persona_files: Vec<String>,
    pub memory_files: Vec<String>,
    pub processed_files: Vec<String>,
    pub checkpoint_path: PathBuf,
    pub scan_manifest_path: PathBuf,
    pub errors: Vec<String>,
    pub stage_stats: StageStats,
}

// ── Worker pool plumbing ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum WorkItem {
    Observe(usize),
    ExtractMemories(usize),
}

struct WorkerCtx {
    client: Arc<dyn LlmClient>,
    llm: LlmConfig,
    prompts: PromptSet,
    companion_name: String,
    memory_per_chat_max: usize,
    per_chat_tokens: usize,
    items: Vec<WorkItem>,
    persona_packets: Arc<Vec<ConversationPacket>>,
    memory_packets: Arc<Vec<ConversationPacket>>,
    cursor: AtomicUsize,
    errors: parking_lot::Mutex<Vec<String>>,
    fatal: parking_lot::Mutex<Option<EngineError>>,
    cancel: CancellationToken,
    checkpoint: Arc<CheckpointStore>,
    scan: Arc<ScanManifestStore>,
    reporter: ProgressReporter,
}

impl WorkerCtx {
    fn record_fatal(&self, error: EngineError) {
        let mut slot = self.fatal.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
        drop(slot);
        // Drain the pool; on-disk state is already consistent.
        self.cancel.cancel();
    }

    fn retry_sink(&self, phase: GenerationPhase) -> Arc<dyn Fn(&RetryEvent) + Send + Sync> {
        let reporter = self.reporter.clone();
        Arc::new(move |e: &RetryEvent| {
            reporter.emit(
                phase,
                format!(
                    "retry {}/{} for {} in {}ms: {}",
                    e.attempt, e.max_attempts, e.request_tag, e.delay_ms, e.error
                ),
            );
        })
    }

    fn call_options(&self, tag: String, phase: GenerationPhase) -> CallOptions {
        CallOptions {
            cancel: self.cancel.clone(),
            request_tag: tag,
            on_retry: Some(self.retry_sink(phase)),
        }
    }
}

async fn run_worker(ctx: Arc<WorkerCtx>) {
    loop {
        let idx = ctx.cursor.fetch_add(1, Ordering::Relaxed);
        if idx >= ctx.items.len() || ctx.cancel.is_cancelled() {
            break;
        }
        match ctx.items[idx] {
            WorkItem::Observe(i) => observe_one(&ctx, i).await,
            WorkItem::ExtractMemories(i) => extract_memories_one(&ctx, i).await,
        }
        if ctx.fatal.lock().is_some() {
            break;
        }
    }
}

async fn observe_one(ctx: &WorkerCtx, packet_index: usize) {
    let packet = &ctx.persona_packets[packet_index];
    let phase = GenerationPhase::PersonaObservation;
    let tag = format!("persona_observation:{}", packet.conversation_id);
    ctx.reporter
        .call_started(phase, format!("observing {}", packet.conversation_id));

    let transcript = budget::truncate_to_token_budget(&packet.transcript, ctx.per_chat_tokens);
    let user = fill_template(
        &ctx.prompts.persona_observation_user,
        &[
            ("companion_name", ctx.companion_name.as_str()),
            ("conversation_id", packet.conversation_id.as_str()),
            ("transcript", transcript),
        ],
    );
    let messages = [
        ChatMessage::system(ctx.prompts.persona_observation_system.clone()),
        ChatMessage::user(user),
    ];
    let options = ctx.call_options(tag, phase);

    match ctx.client.chat_complete_json(&ctx.llm, &messages, &options).await {
        Ok(completion) => {
            let mut payload = completion.parsed;
            let empty = payload.as_object().map(|o| o.is_empty()).unwrap_or(true);
            if empty {
                ctx.errors.lock().push(format!(
                    "persona_observation[{}]: empty or unparseable response",
                    packet.conversation_id
                ));
                ctx.reporter
                    .call_failed(phase, format!("no observation for {}", packet.conversation_id));
                return;
            }
            if payload.get("conversation_id").and_then(Value::as_str).is_none() {
                payload["conversation_id"] = json!(packet.conversation_id);
            }
            match ctx
                .checkpoint
                .record_observation(&packet.conversation_id, payload)
                .await
            {
                Ok(()) => ctx
                    .reporter
                    .call_completed(phase, format!("observed {}", packet.conversation_id)),
                Err(e) => ctx.record_fatal(e),
            }
        }
        Err(EngineError::Aborted) => {
            ctx.reporter
                .call_aborted(phase, format!("aborted {}", packet.conversation_id));
        }
        Err(e) => {
            ctx.errors
                .lock()
                .push(format!("persona_observation[{}]: {e}", packet.conversation_id));
            ctx.reporter
                .call_failed(phase, format!("failed {}", packet.conversation_id));
        }
    }
}

async fn extract_memories_one(ctx: &WorkerCtx, packet_index: usize) {
    let packet = &ctx.memory_packets[packet_index];
    let phase = GenerationPhase::MemoryExtract;
    let tag = format!("memory_extract:{}", packet.source_file);
    ctx.reporter
        .call_started(phase, format!("mining {}", packet.source_file));

    let transcript = budget::truncate_to_token_budget(&packet.transcript, ctx.per_chat_tokens);
    let max_memories = ctx.memory_per_chat_max.to_string();
    let user = fill_template(
        &ctx.prompts.memory_user,
        &[
            ("max_memories", max_memories.as_str()),
            ("transcript", transcript),
        ],
    );
    let messages = [
        ChatMessage::system(ctx.prompts.memory_system.clone()),
        ChatMessage::user(user),
    ];
    let options = ctx.call_options(tag, phase);

    match ctx.client.chat_complete_json(&ctx.llm, &messages, &options).await {
        Ok(completion) => {
            let source_date = parse_export_file_name(&packet.source_file).first_message_date;
            let mut candidates = card::candidates_from_payload(&completion.parsed);
            for candidate in &mut candidates {
                candidate.source_conversation = Some(packet.conversation_id.clone());
                if candidate.source_date.is_none() {
                    candidate.source_date = source_date.clone();
                }
            }
            let count = candidates.len();
            match ctx
                .checkpoint
                .record_memory_file(&packet.source_file, candidates)
                .await
            {
                Ok(()) => {
                    let (size, mtime) = file_info(&packet.source_path).unwrap_or((0, 0));
                    if let Err(e) = ctx.scan.record(&packet.source_file, size, mtime).await {
                        ctx.record_fatal(e);
                        return;
                    }
                    ctx.reporter.call_completed(
                        phase,
                        format!("{} memories from {}", count, packet.source_file),
                    );
                }
                Err(e) => ctx.record_fatal(e),
            }
        }
        Err(EngineError::Aborted) => {
            ctx.reporter
                .call_aborted(phase, format!("aborted {}", packet.source_file));
        }
        Err(e) => {
            ctx.errors
                .lock()
                .push(format!("memory_extract[{}]: {e}", packet.source_file));
            ctx.reporter
                .call_failed(phase, format!("failed {}", packet.source_file));
        }
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────

/// First few entries plus "+N more".
fn summarize_errors(errors: &[String]) -> String {
    if errors.is_empty() {
        return "no individual call errors recorded".to_string();
    }
    let head: Vec<&str> = errors
        .iter()
        .take(ERROR_SUMMARY_HEAD)
        .map(String::as_str)
        .collect();
    let mut out = head.join("; ");
    if errors.len() > ERROR_SUMMARY_HEAD {
        out.push_str(&format!(" (+{} more)", errors.len() - ERROR_SUMMARY_HEAD));
    }
    out
}

/// Existing lorebook entries re-enter the pool as candidates with decayed
/// priorities so fresh evidence can displace stale entries.
fn decay_existing(entries: &[LorebookEntry]) -> Vec<MemoryCandidate> {
    entries
        .iter()
        .cloned()
        .map(|e| {
            let mut candidate = MemoryCandidate::from(e);
            candidate.priority = (candidate.priority * 9 / 10).max(1);
            candidate
        })
        .collect()
}

fn cancelled_output(
    run_dir: &Path,
    errors: Vec<String>,
    stats: StageStats,
    reporter: &ProgressReporter,
) -> GenerationOutput {
    reporter.emit(GenerationPhase::Done, "generation cancelled");
    GenerationOutput {
        status: GenerationStatus::Cancelled,
        card: Value::Null,
        lorebook: Value::Null,
        persona_payload: Value::Null,
        memories_payload: Value::Null,
        persona_files: Vec::new(),
        memory_files: Vec::new(),
        processed_files: Vec::new(),
        checkpoint_path: run_dir.join("generation_resume.json"),
        scan_manifest_path: run_dir.join("scan_manifest.json"),
        errors,
        stage_stats: stats,
    }
}

// ── Entry point ────────────────────────────────────────────────────────────

pub async fn run_generation(
    client: Arc<dyn LlmClient>,
    params: GenerationParams,
) -> EngineResult<GenerationOutput> {
    let request = &params.request;
    std::fs::create_dir_all(&params.run_dir)?;

    // ── Budgets & clamping ─────────────────────────────────────────────
    let context_window = if request.model_context_window > 0 {
        request.model_context_window
    } else {
        budget::infer_context_window(&request.llm.model)
    };
    let budgets = ContextBudgets::for_window(context_window);
    let mut max_total_chars = request.max_total_chars;
    let mut clamp_notice = None;
    if max_total_chars > budgets.usable_chars() {
        clamp_notice = Some(format!(
            "max_total_chars {} exceeds the model context window; clamped to {}",
            max_total_chars,
            budgets.usable_chars()
        ));
        max_total_chars = budgets.usable_chars();
    }

    let prompt_digest = request.prompts.digest();
    let prompts = PromptSet::with_overrides(&request.prompts);

    // ── Seed & signature ───────────────────────────────────────────────
    let seed = request.sampling_seed.unwrap_or_else(|| {
        sampler::derive_seed(&SeedInputs {
            model_dir: &params.model_dir,
            primary_model: &request.primary_model,
            companion_name: &request.companion_name,
            sample_size: request.sample_conversations,
            sampling_mode: request.sampling,
            max_messages_per_conversation: request.max_messages_per_conversation,
            max_chars_per_conversation: request.max_chars_per_conversation,
            max_total_chars,
            prompt_override_digest: &prompt_digest,
        })
    });
    let signature = checkpoint_signature(&SignatureInputs {
        model_dir: &params.model_dir,
        primary_model: &request.primary_model,
        companion_name: &request.companion_name,
        sampling_mode: request.sampling,
        sampling_seed: seed,
        sample_conversations: request.sample_conversations,
        max_messages_per_conversation: request.max_messages_per_conversation,
        max_chars_per_conversation: request.max_chars_per_conversation,
        max_total_chars,
        per_chat_budget_tokens: budgets.per_chat_tokens,
        synthesis_budget_tokens: budgets.synthesis_tokens,
        prompt_override_digest: &prompt_digest,
    });

    // ── Durable state ──────────────────────────────────────────────────
    let checkpoint = Arc::new(CheckpointStore::load_or_new(
        params.run_dir.join("generation_resume.json"),
        &signature,
        request.force_rerun,
    ));
    let scan = Arc::new(ScanManifestStore::load_or_new(
        params.run_dir.join("scan_manifest.json"),
        &params.model_dir,
        request.force_rerun,
    ));

    // ── Selection & packets ────────────────────────────────────────────
    let files = if params.available_files.is_empty() {
        crate::engine::cache::list_conversation_files(&params.model_dir)
    } else {
        params.available_files.clone()
    };
    if files.is_empty() {
        return Err(EngineError::Config(format!(
            "no conversation files found in {}",
            params.model_dir.display()
        )));
    }

    let scored = score_conversations(&files);
    let selected =
        select_conversations(scored, request.sample_conversations, request.sampling, seed);
    if selected.is_empty() {
        return Err(EngineError::Config(
            "no readable conversations found to sample".to_string(),
        ));
    }
    let packets = build_packets(
        &selected,
        &PacketBudgets {
            max_messages_per_conversation: request.max_messages_per_conversation,
            max_chars_per_conversation: request.max_chars_per_conversation,
            max_total_chars,
        },
    );
    if packets.is_empty() {
        return Err(EngineError::Config(
            "transcript sample is empty after budget filters".to_string(),
        ));
    }

    let persona_packets: Arc<Vec<ConversationPacket>> = Arc::new(if params.append_memories {
        Vec::new()
    } else {
        packets.clone()
    });
    let scan_snapshot = scan.snapshot().await;
    let memory_packets: Arc<Vec<ConversationPacket>> = Arc::new(if params.append_memories {
        packets
            .iter()
            .filter(|p| {
                let (size, mtime) = file_info(&p.source_path).unwrap_or((0, 0));
                !scan_snapshot.is_scanned(&p.source_file, size, mtime)
            })
            .cloned()
            .collect()
    } else {
        packets.clone()
    });

    // ── Progress totals (fixed at start) ───────────────────────────────
    let have_candidates = !memory_packets.is_empty() || !params.existing_memories.is_empty();
    let total_calls = 1
        + persona_packets.len()
        + usize::from(!params.append_memories)
        + memory_packets.len()
        + usize::from(have_candidates);
    let reporter = ProgressReporter::new(total_calls, params.on_progress.clone());
    reporter.emit(
        GenerationPhase::Init,
        format!(
            "{} mode: {} persona packets, {} memory packets, seed {}",
            if params.append_memories { "append" } else { "full" },
            persona_packets.len(),
            memory_packets.len(),
            seed
        ),
    );
    if let Some(notice) = &clamp_notice {
        reporter.emit(GenerationPhase::Init, notice.clone());
    }
    info!(
        "[generation] context_window={} per_chat_budget={} synthesis_budget={} total_calls={}",
        context_window, budgets.per_chat_tokens, budgets.synthesis_tokens, total_calls
    );

    let mut stats = StageStats {
        context_window,
        per_chat_budget_tokens: budgets.per_chat_tokens,
        synthesis_budget_tokens: budgets.synthesis_tokens,
        persona_packets: persona_packets.len(),
        memory_packets: memory_packets.len(),
        total_calls,
        ..Default::default()
    };

    if params.cancel.is_cancelled() {
        return Ok(cancelled_output(&params.run_dir, Vec::new(), stats, &reporter));
    }

    // ── Preflight ──────────────────────────────────────────────────────
    reporter.call_started(GenerationPhase::Preflight, "preflight ping");
    let preflight_config = LlmConfig {
        temperature: 0.0,
        max_tokens: PREFLIGHT_MAX_TOKENS,
        ..request.llm.clone()
    };
    let preflight_options = CallOptions {
        cancel: params.cancel.clone(),
        request_tag: "preflight".to_string(),
        on_retry: None,
    };
    match client
        .chat_complete(
            &preflight_config,
            &[ChatMessage::user(PREFLIGHT_USER)],
            &preflight_options,
        )
        .await
    {
        Ok(text) if !text.trim().is_empty() => {
            reporter.call_completed(GenerationPhase::Preflight, "preflight ok");
        }
        Ok(_) => {
            reporter.call_failed(GenerationPhase::Preflight, "preflight empty");
            return Err(EngineError::ProviderPreflightFailed(format!(
                "{}/{} returned an empty preflight response",
                request.llm.provider.as_str(),
                request.llm.model
            )));
        }
        Err(EngineError::Aborted) => {
            reporter.call_aborted(GenerationPhase::Preflight, "preflight aborted");
            return Ok(cancelled_output(&params.run_dir, Vec::new(), stats, &reporter));
        }
        Err(e) => {
            reporter.call_failed(GenerationPhase::Preflight, "preflight failed");
            return Err(EngineError::ProviderPreflightFailed(format!(
                "{}/{}: {e}",
                request.llm.provider.as_str(),
                request.llm.model
            )));
        }
    }

    // ── Per-conversation stages ────────────────────────────────────────
    let snapshot = checkpoint.snapshot().await;
    let mut items = Vec::new();
    for (i, packet) in persona_packets.iter().enumerate() {
        if snapshot.observation_done(&packet.conversation_id) {
            reporter.call_skipped(
                GenerationPhase::PersonaObservation,
                format!("cached observation for {}", packet.conversation_id),
            );
        } else {
            items.push(WorkItem::Observe(i));
        }
    }
    for (i, packet) in memory_packets.iter().enumerate() {
        if snapshot.memory_file_done(&packet.source_file) {
            reporter.call_skipped(
                GenerationPhase::MemoryExtract,
                format!("cached memories for {}", packet.source_file),
            );
        } else {
            items.push(WorkItem::ExtractMemories(i));
        }
    }

    let workers = request
        .max_parallel_calls
        .clamp(1, MAX_PARALLEL_CALLS_CAP)
        .min(items.len().max(1));
    let ctx = Arc::new(WorkerCtx {
        client: client.clone(),
        llm: request.llm.clone(),
        prompts: prompts.clone(),
        companion_name: request.companion_name.clone(),
        memory_per_chat_max: request.memory_per_chat_max,
        per_chat_tokens: budgets.per_chat_tokens,
        items,
        persona_packets: persona_packets.clone(),
        memory_packets: memory_packets.clone(),
        cursor: AtomicUsize::new(0),
        errors: parking_lot::Mutex::new(Vec::new()),
        fatal: parking_lot::Mutex::new(None),
        cancel: params.cancel.clone(),
        checkpoint: checkpoint.clone(),
        scan: scan.clone(),
        reporter: reporter.clone(),
    });

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        handles.push(tokio::spawn(run_worker(ctx.clone())));
    }
    for handle in handles {
        let _ = handle.await;
    }

    let mut errors = ctx.errors.lock().clone();
    if let Some(fatal) = ctx.fatal.lock().take() {
        return Err(fatal);
    }
    stats.calls_started = reporter.started_calls();
    stats.calls_completed = reporter.completed_calls();
    stats.calls_failed = reporter.failed_calls();
    if params.cancel.is_cancelled() {
        return Ok(cancelled_output(&params.run_dir, errors, stats, &reporter));
    }

    // ── Persona synthesis ──────────────────────────────────────────────
    let snapshot = checkpoint.snapshot().await;
    let mut persona_payload = Value::Null;
    if !params.append_memories {
        let observations: Vec<&Value> = persona_packets
            .iter()
            .filter_map(|p| {
                snapshot
                    .persona_observations_by_conversation
                    .get(&p.conversation_id)
            })
            .collect();
        stats.observations_total = observations.len();
        if observations.is_empty() {
            return Err(EngineError::PersonaExtractionFailed(summarize_errors(&errors)));
        }

        reporter.call_started(
            GenerationPhase::PersonaSynthesis,
            format!("synthesizing persona from {} observations", observations.len()),
        );
        let packets_text: String = observations
            .iter()
            .filter_map(|o| serde_json::to_string(o).ok())
            .collect::<Vec<_>>()
            .join("\n");
        let packets_text =
            budget::truncate_to_token_budget(&packets_text, budgets.synthesis_tokens);
        let user = fill_template(
            &prompts.persona_synthesis_user,
            &[
                ("companion_name", request.companion_name.as_str()),
                ("observation_packets", packets_text),
            ],
        );
        let messages = [
            ChatMessage::system(prompts.persona_synthesis_system.clone()),
            ChatMessage::user(user),
        ];
        let options = CallOptions {
            cancel: params.cancel.clone(),
            request_tag: "persona_synthesis".to_string(),
            on_retry: None,
        };
        match client.chat_complete_json(&request.llm, &messages, &options).await {
            Ok(completion) => {
                reporter.call_completed(GenerationPhase::PersonaSynthesis, "persona synthesized");
                persona_payload = completion.parsed;
            }
            Err(EngineError::Aborted) => {
                reporter.call_aborted(GenerationPhase::PersonaSynthesis, "synthesis aborted");
                return Ok(cancelled_output(&params.run_dir, errors, stats, &reporter));
            }
            Err(e) => {
                reporter.call_failed(GenerationPhase::PersonaSynthesis, "synthesis failed");
                return Err(EngineError::SynthesisFailed(format!("persona synthesis: {e}")));
            }
        }
    }

    // ── Memory candidates & synthesis ──────────────────────────────────
    let memory_done = memory_packets
        .iter()
        .filter(|p| snapshot.memory_file_done(&p.source_file))
        .count();
    if memory_done == 0 && !memory_packets.is_empty() {
        return Err(EngineError::MemoryExtractionFailed(summarize_errors(&errors)));
    }

    let mut all_candidates = decay_existing(&params.existing_memories);
    for packet in memory_packets.iter() {
        if let Some(candidates) = snapshot
            .memory_candidates_by_source_file
            .get(&packet.source_file)
        {
            all_candidates.extend(candidates.iter().cloned());
        }
    }
    let all_candidates = compact::compact_candidates(&all_candidates);
    stats.memory_candidates_total = all_candidates.len();

    let mut memories_payload = json!({ "memories": [] });
    let mut final_candidates: Vec<MemoryCandidate> = Vec::new();
    if !all_candidates.is_empty() {
        reporter.call_started(
            GenerationPhase::MemorySynthesis,
            format!("consolidating {} memory candidates", all_candidates.len()),
        );
        let candidates_json = serde_json::to_string(&all_candidates)?;
        let candidates_json =
            budget::truncate_to_token_budget(&candidates_json, budgets.synthesis_tokens);
        let max_memories = request.max_memories.to_string();
        let user = fill_template(
            &prompts.memory_synthesis_user,
            &[
                ("max_memories", max_memories.as_str()),
                ("candidate_memories", candidates_json),
            ],
        );
        let messages = [
            ChatMessage::system(prompts.memory_synthesis_system.clone()),
            ChatMessage::user(user),
        ];
        let options = CallOptions {
            cancel: params.cancel.clone(),
            request_tag: "memory_synthesis".to_string(),
            on_retry: None,
        };
        match client.chat_complete_json(&request.llm, &messages, &options).await {
            Ok(completion) => {
                reporter.call_completed(GenerationPhase::MemorySynthesis, "memories consolidated");
                final_candidates = card::candidates_from_payload(&completion.parsed);
                memories_payload = completion.parsed;
            }
            Err(EngineError::Aborted) => {
                reporter.call_aborted(GenerationPhase::MemorySynthesis, "synthesis aborted");
                return Ok(cancelled_output(&params.run_dir, errors, stats, &reporter));
            }
            Err(e) => {
                reporter.call_failed(GenerationPhase::MemorySynthesis, "synthesis failed");
                return Err(EngineError::SynthesisFailed(format!("memory synthesis: {e}")));
            }
        }
        if final_candidates.is_empty() {
            // The synthesizer dropped everything; fall back to the
            // compacted candidates so evidence is not lost.
            warn!("[generation] Memory synthesis returned no entries, using compacted candidates");
            final_candidates = all_candidates.clone();
            memories_payload = json!({ "memories": final_candidates });
        }
    }

    // ── Shape lorebook & card ──────────────────────────────────────────
    let compacted = compact::compact_candidates(&final_candidates);
    let capped = compact::cap_by_priority(compacted, request.max_memories);
    let entries: Vec<LorebookEntry> = capped.into_iter().map(LorebookEntry::from).collect();
    stats.lorebook_entries = entries.len();
    let lorebook = card::build_lorebook(&entries);

    let card_value = if params.append_memories {
        let mut existing = params
            .existing_card
            .clone()
            .unwrap_or_else(|| {
                card::build_card(
                    &card::heuristic_draft(&request.companion_name),
                    &lorebook,
                    &request.companion_name,
                    &request.creator,
                    request.source_label.as_deref(),
                )
            });
        // Keep the embedded lorebook in step with the extended one.
        if let Some(book) = lorebook.get("data") {
            if let Some(data) = existing.get_mut("data").and_then(Value::as_object_mut) {
                data.insert("character_book".to_string(), book.clone());
                data.insert("modification_date".to_string(), json!(Utc::now().timestamp()));
            }
        }
        existing
    } else {
        let empty_payload = persona_payload
            .as_object()
            .map(|o| o.is_empty())
            .unwrap_or(true);
        let draft = if empty_payload {
            warn!("[generation] Persona synthesis payload was empty, using heuristic draft");
            errors.push("persona_synthesis: empty payload, heuristic draft used".to_string());
            card::heuristic_draft(&request.companion_name)
        } else {
            card::draft_from_payload(&request.companion_name, &persona_payload)
        };
        card::build_card(
            &draft,
            &lorebook,
            &request.companion_name,
            &request.creator,
            request.source_label.as_deref(),
        )
    };

    // ── Artifacts ──────────────────────────────────────────────────────
    reporter.emit(GenerationPhase::Manifest, "writing artifacts");
    let card_errors = card::validate_card(&card_value);
    let lorebook_errors = card::validate_lorebook(&lorebook);

    let persona_files: Vec<String> = persona_packets
        .iter()
        .map(|p| p.source_file.clone())
        .collect();
    let memory_files: Vec<String> = memory_packets
        .iter()
        .map(|p| p.source_file.clone())
        .collect();
    let processed_files: Vec<String> = memory_packets
        .iter()
        .filter(|p| snapshot.memory_file_done(&p.source_file))
        .map(|p| p.source_file.clone())
        .collect();

    let run_dir = &params.run_dir;
    let artifact = |name: &str| run_dir.join(name);
    fsio::write_json_durable(&artifact("character_card_v3.json"), &card_value)?;
    fsio::write_json_durable(&artifact("lorebook_v3.json"), &lorebook)?;
    fsio::write_json_durable(&artifact("persona_payload.json"), &persona_payload)?;
    fsio::write_json_durable(&artifact("memories_payload.json"), &memories_payload)?;
    fsio::write_text_durable(
        &artifact("analysis_transcript.txt"),
        &build_analysis_transcript(&packets),
    )?;
    fsio::write_text_durable(&artifact("persona_sources.txt"), &join_lines(&persona_files))?;
    fsio::write_text_durable(&artifact("memory_sources.txt"), &join_lines(&memory_files))?;

    let processing_manifest = json!({
        "source_fingerprint": &params.source_fingerprint,
        "mode": if params.append_memories { "append_memories" } else { "full" },
        "sampling": {
            "strategy": request.sampling.as_str(),
            "requested_seed": request.sampling_seed,
            "effective_seed": seed,
            "sample_conversations": request.sample_conversations,
        },
        "persona_files": &persona_files,
        "memory_files": &memory_files,
        "persona_processed": stats.observations_total,
        "memory_processed": processed_files.len(),
        "artifacts": {
            "card": abs(&artifact("character_card_v3.json")),
            "lorebook": abs(&artifact("lorebook_v3.json")),
            "persona_payload": abs(&artifact("persona_payload.json")),
            "memories_payload": abs(&artifact("memories_payload.json")),
            "analysis_transcript": abs(&artifact("analysis_transcript.txt")),
            "persona_sources": abs(&artifact("persona_sources.txt")),
            "memory_sources": abs(&artifact("memory_sources.txt")),
            "generation_report": abs(&artifact("generation_report.json")),
            "scan_manifest": abs(scan.path()),
            "checkpoint": abs(checkpoint.path()),
        },
        "created_at_utc": Utc::now().to_rfc3339(),
    });
    fsio::write_json_durable(&artifact("processing_manifest.json"), &processing_manifest)?;

    stats.calls_started = reporter.started_calls();
    stats.calls_completed = reporter.completed_calls();
    stats.calls_failed = reporter.failed_calls();
    let report = json!({
        "mode": if params.append_memories { "append_memories" } else { "full" },
        "provider": request.llm.provider.as_str(),
        "model": request.llm.model,
        "conversation_files_total": files.len(),
        "conversation_files_selected": packets.len(),
        "stage_stats": &stats,
        "errors": &errors,
        "card_validation_errors": card_errors,
        "lorebook_validation_errors": lorebook_errors,
        "created_at_utc": Utc::now().to_rfc3339(),
    });
    fsio::write_json_durable(&artifact("generation_report.json"), &report)?;

    if params.append_memories {
        let line = json!({
            "appended_at_utc": Utc::now().to_rfc3339(),
            "new_files_processed": processed_files.len(),
            "memory_files": &memory_files,
            "lorebook_entries": entries.len(),
        });
        let mut history = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(artifact("memory_append_history.jsonl"))?;
        serde_json::to_writer(&mut history, &line)?;
        history.write_all(b"\n")?;
    }

    scan.flush().await?;
    reporter.emit(GenerationPhase::Done, "generation complete");

    Ok(GenerationOutput {
        status: GenerationStatus::Completed,
        card: card_value,
        lorebook,
        persona_payload,
        memories_payload,
        persona_files,
        memory_files,
        processed_files,
        checkpoint_path: checkpoint.path().to_path_buf(),
        scan_manifest_path: scan.path().to_path_buf(),
        errors,
        stage_stats: stats,
    })
}

fn join_lines(lines: &[String]) -> String {
    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

fn abs(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::MemoryCategory;
    use crate::engine::llm::JsonCompletion;
    use async_trait::async_trait;

    // ── Mock client ────────────────────────────────────────────────────

    /// Scriptable in-memory client. Tags are recorded in call order;
    /// per-stage success budgets simulate a run that died partway.
    #[derive(Default)]
    struct MockLlm {
        calls: parking_lot::Mutex<Vec<String>>,
        persona_budget: Option<usize>,
        memory_budget: Option<usize>,
        persona_ok: AtomicUsize,
        memory_ok: AtomicUsize,
        cancel_after_json_calls: Option<(usize, CancellationToken)>,
        fail_preflight: bool,
    }

    impl MockLlm {
        fn count(&self, prefix: &str) -> usize {
            self.calls
                .lock()
                .iter()
                .filter(|t| t.starts_with(prefix))
                .count()
        }
    }

    fn terminal(tag: &str) -> EngineError {
        EngineError::LlmCallFailed {
            tag: tag.to_string(),
            attempts: 1,
            message: "invalid api key".to_string(),
        }
    }

    /// Atomically take one success slot; None means unlimited.
    fn claim_budget(counter: &AtomicUsize, budget: Option<usize>) -> bool {
        let Some(budget) = budget else {
            counter.fetch_add(1, Ordering::SeqCst);
            return true;
        };
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n < budget {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    #[async_trait]
    impl LlmClient for MockLlm {
        async fn chat_complete(
            &self,
            _config: &LlmConfig,
            _messages: &[ChatMessage],
            options: &CallOptions,
        ) -> EngineResult<String> {
            self.calls.lock().push(options.request_tag.clone());
            if self.fail_preflight {
                return Err(terminal(&options.request_tag));
            }
            Ok("OK".to_string())
        }

        async fn chat_complete_json(
            &self,
            _config: &LlmConfig,
            messages: &[ChatMessage],
            options: &CallOptions,
        ) -> EngineResult<JsonCompletion> {
            let json_calls_so_far = {
                let mut calls = self.calls.lock();
                calls.push(options.request_tag.clone());
                calls.iter().filter(|t| t.contains(':')).count()
            };
            if let Some((limit, token)) = &self.cancel_after_json_calls {
                if json_calls_so_far > *limit {
                    token.cancel();
                    return Err(EngineError::Aborted);
                }
            }
            if options.cancel.is_cancelled() {
                return Err(EngineError::Aborted);
            }

            let tag = options.request_tag.as_str();
            let parsed = if let Some(cid) = tag.strip_prefix("persona_observation:") {
                if !claim_budget(&self.persona_ok, self.persona_budget) {
                    return Err(terminal(tag));
                }
                json!({
                    "conversation_id": cid,
                    "observed_traits": ["warm", "direct"],
                    "voice_markers": [format!("marker for {cid}")],
                })
            } else if let Some(file) = tag.strip_prefix("memory_extract:") {
                if !claim_budget(&self.memory_ok, self.memory_budget) {
                    return Err(terminal(tag));
                }
                json!({
                    "memories": [{
                        "name": format!("Memory from {file}"),
                        "keys": [file],
                        "content": format!("{{{{user}}}} and {{{{char}}}} shared moment {file}"),
                        "priority": 50,
                        "category": "shared_memory",
                    }]
                })
            } else if tag == "persona_synthesis" {
                json!({
                    "name": "Ember",
                    "description": "# Overview\n{{char}} is steady and warm with {{user}}.",
                    "first_mes": "Hey {{user}}. I'm right here.",
                    "mes_example": "<START>\n{{user}}: hi\n{{char}}: hello",
                    "tags": ["companion"],
                })
            } else if tag == "memory_synthesis" {
                // Echo back the candidates embedded in the prompt so
                // compaction results flow through to the lorebook.
                let user_content = &messages.last().unwrap().content;
                let candidates = user_content
                    .split("Candidate memories:")
                    .nth(1)
                    .and_then(|raw| serde_json::from_str::<Value>(raw.trim()).ok())
                    .unwrap_or_else(|| json!([]));
                json!({ "memories": candidates })
            } else {
                json!({})
            };
            Ok(JsonCompletion {
                raw: parsed.to_string(),
                parsed,
            })
        }
    }

    // ── Fixtures ───────────────────────────────────────────────────────

    fn write_fixture_files(dir: &Path, n: usize) -> Vec<PathBuf> {
        (0..n)
            .map(|i| {
                let name = format!("m-a_2024010{}_conv{i}.jsonl", (i % 9) + 1);
                let path = dir.join(name);
                let mut f = std::fs::File::create(&path).unwrap();
                let filler = "talk ".repeat(10 + i * 3);
                writeln!(
                    f,
                    r#"{{"role":"user","text":"hello there {i}","parts":["hello there {i}"]}}"#
                )
                .unwrap();
                writeln!(
                    f,
                    r#"{{"role":"assistant","text":"reply {i}: {filler}","parts":["reply {i}: {filler}"]}}"#
                )
                .unwrap();
                path
            })
            .collect()
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            companion_name: "Ember".to_string(),
            creator: "tester".to_string(),
            source_label: None,
            primary_model: "m-a".to_string(),
            sample_conversations: 0,
            sampling: SamplingMode::Top,
            sampling_seed: Some(7),
            max_memories: 50,
            memory_per_chat_max: 10,
            max_messages_per_conversation: 50,
            max_chars_per_conversation: 4_000,
            max_total_chars: 40_000,
            model_context_window: 64_000,
            max_parallel_calls: 4,
            force_rerun: false,
            llm: LlmConfig {
                model: "test-model".to_string(),
                ..Default::default()
            },
            prompts: PromptOverrides::default(),
        }
    }

    fn params(model_dir: &Path, run_dir: &Path, request: GenerationRequest) -> GenerationParams {
        GenerationParams {
            model_dir: model_dir.to_path_buf(),
            available_files: Vec::new(),
            run_dir: run_dir.to_path_buf(),
            request,
            append_memories: false,
            existing_card: None,
            existing_memories: Vec::new(),
            source_fingerprint: None,
            cancel: CancellationToken::new(),
            on_progress: None,
        }
    }

    // ── Scenarios ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn full_run_emits_expected_call_count() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("model");
        std::fs::create_dir_all(&model_dir).unwrap();
        write_fixture_files(&model_dir, 12);
        let run_dir = dir.path().join("run");

        let mock = Arc::new(MockLlm::default());
        let output = run_generation(mock.clone(), params(&model_dir, &run_dir, request()))
            .await
            .unwrap();

        assert_eq!(output.status, GenerationStatus::Completed);
        assert_eq!(mock.count("preflight"), 1);
        assert_eq!(mock.count("persona_observation:"), 12);
        assert_eq!(mock.count("memory_extract:"), 12);
        assert_eq!(mock.count("persona_synthesis"), 1);
        assert_eq!(mock.count("memory_synthesis"), 1);
        assert_eq!(mock.calls.lock().len(), 27);
        assert_eq!(output.stage_stats.total_calls, 27);

        let checkpoint: checkpoint::ResumeCheckpoint = serde_json::from_str(
            &std::fs::read_to_string(&output.checkpoint_path).unwrap(),
        )
        .unwrap();
        assert_eq!(checkpoint.persona_observations_by_conversation.len(), 12);
        assert_eq!(checkpoint.processed_memory_files.len(), 12);

        for artifact in [
            "character_card_v3.json",
            "lorebook_v3.json",
            "persona_payload.json",
            "memories_payload.json",
            "analysis_transcript.txt",
            "persona_sources.txt",
            "memory_sources.txt",
            "processing_manifest.json",
            "generation_report.json",
            "scan_manifest.json",
            "generation_resume.json",
        ] {
            assert!(run_dir.join(artifact).exists(), "missing {artifact}");
        }
        assert_eq!(output.card["data"]["name"], "Ember");
        assert_eq!(output.card["data"]["personality"], "");
        assert!(output.errors.is_empty());
    }

    #[tokio::test]
    async fn resume_performs_only_remaining_calls() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("model");
        std::fs::create_dir_all(&model_dir).unwrap();
        write_fixture_files(&model_dir, 12);
        let run_dir = dir.path().join("run");

        // First run: 7 observations and 5 memory extractions succeed,
        // the rest fail terminally (same durable state as a kill).
        let crippled = Arc::new(MockLlm {
            persona_budget: Some(7),
            memory_budget: Some(5),
            ..Default::default()
        });
        let output = run_generation(crippled.clone(), params(&model_dir, &run_dir, request()))
            .await
            .unwrap();
        assert_eq!(output.status, GenerationStatus::Completed);
        assert!(!output.errors.is_empty());

        let checkpoint: checkpoint::ResumeCheckpoint = serde_json::from_str(
            &std::fs::read_to_string(run_dir.join("generation_resume.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(checkpoint.persona_observations_by_conversation.len(), 7);
        assert_eq!(checkpoint.processed_memory_files.len(), 5);

        // Second run with identical parameters resumes: 1 preflight +
        // 5 observations + 7 extractions + 2 syntheses = 15 calls.
        let healthy = Arc::new(MockLlm::default());
        let output = run_generation(healthy.clone(), params(&model_dir, &run_dir, request()))
            .await
            .unwrap();
        assert_eq!(output.status, GenerationStatus::Completed);
        assert_eq!(healthy.count("persona_observation:"), 5);
        assert_eq!(healthy.count("memory_extract:"), 7);
        assert_eq!(healthy.calls.lock().len(), 15);

        let checkpoint: checkpoint::ResumeCheckpoint = serde_json::from_str(
            &std::fs::read_to_string(run_dir.join("generation_resume.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(checkpoint.persona_observations_by_conversation.len(), 12);
        assert_eq!(checkpoint.processed_memory_files.len(), 12);
    }

    #[tokio::test]
    async fn signature_mismatch_invalidates_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("model");
        std::fs::create_dir_all(&model_dir).unwrap();
        write_fixture_files(&model_dir, 4);
        let run_dir = dir.path().join("run");

        let first = Arc::new(MockLlm::default());
        run_generation(first.clone(), params(&model_dir, &run_dir, request()))
            .await
            .unwrap();
        assert_eq!(first.count("persona_observation:"), 4);

        // Same run dir, different companion name: prior state is invalid
        // and every per-conversation call re-runs.
        let mut changed = request();
        changed.companion_name = "Someone".to_string();
        let second = Arc::new(MockLlm::default());
        run_generation(second.clone(), params(&model_dir, &run_dir, changed))
            .await
            .unwrap();
        assert_eq!(second.count("persona_observation:"), 4);
        assert_eq!(second.count("memory_extract:"), 4);
    }

    #[tokio::test]
    async fn cancellation_leaves_checkpoint_consistent_and_resumable() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("model");
        std::fs::create_dir_all(&model_dir).unwrap();
        write_fixture_files(&model_dir, 12);
        let run_dir = dir.path().join("run");

        let cancel = CancellationToken::new();
        let mock = Arc::new(MockLlm {
            cancel_after_json_calls: Some((8, cancel.clone())),
            ..Default::default()
        });
        let mut p = params(&model_dir, &run_dir, request());
        p.cancel = cancel.clone();
        let output = run_generation(mock, p).await.unwrap();
        assert_eq!(output.status, GenerationStatus::Cancelled);

        // The checkpoint on disk is loadable and contains only fully
        // recorded entries.
        let checkpoint: checkpoint::ResumeCheckpoint = serde_json::from_str(
            &std::fs::read_to_string(run_dir.join("generation_resume.json")).unwrap(),
        )
        .unwrap();
        let done = checkpoint.persona_observations_by_conversation.len();
        assert!(done > 0 && done < 12);
        for obs in checkpoint.persona_observations_by_conversation.values() {
            assert!(!obs.as_object().unwrap().is_empty());
        }
        for file in &checkpoint.processed_memory_files {
            assert!(checkpoint.memory_candidates_by_source_file.contains_key(file));
        }

        // A fresh run with the same parameters finishes the job.
        let healthy = Arc::new(MockLlm::default());
        let output = run_generation(healthy.clone(), params(&model_dir, &run_dir, request()))
            .await
            .unwrap();
        assert_eq!(output.status, GenerationStatus::Completed);
        assert_eq!(healthy.count("persona_observation:"), 12 - done);
    }

    #[tokio::test]
    async fn append_mode_skips_persona_and_merges_existing_memories() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("model");
        std::fs::create_dir_all(&model_dir).unwrap();
        write_fixture_files(&model_dir, 1);
        let run_dir = dir.path().join("run");

        let file_name = "m-a_20240101_conv0.jsonl";
        let existing_card = json!({
            "spec": "chara_card_v3",
            "spec_version": "3.0",
            "data": {"name": "Ember", "description": "kept as-is", "extensions": {}},
        });
        // Same content as the newly extracted candidate, modulo
        // whitespace; different keys, higher priority.
        let existing_memory = LorebookEntry {
            name: "Old anchor".to_string(),
            keys: vec!["old key".to_string()],
            content: format!("{{{{user}}}} and   {{{{char}}}}  shared moment {file_name}"),
            category: MemoryCategory::SharedMemory,
            priority: 80,
            source_conversation: None,
            source_date: None,
        };

        let mock = Arc::new(MockLlm::default());
        let mut p = params(&model_dir, &run_dir, request());
        p.append_memories = true;
        p.existing_card = Some(existing_card.clone());
        p.existing_memories = vec![existing_memory];
        let output = run_generation(mock.clone(), p).await.unwrap();

        assert_eq!(output.status, GenerationStatus::Completed);
        // Persona stages fully skipped.
        assert_eq!(mock.count("persona_observation:"), 0);
        assert_eq!(mock.count("persona_synthesis"), 0);
        assert_eq!(mock.count("memory_extract:"), 1);
        assert_eq!(mock.count("memory_synthesis"), 1);

        // One compacted entry: keys unioned, priority = max(72, 50)
        // where 72 is the decayed existing priority.
        let entries = output.lorebook["data"]["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        let keys: Vec<&str> = entries[0]["keys"]
            .as_array()
            .unwrap()
            .iter()
            .map(|k| k.as_str().unwrap())
            .collect();
        assert!(keys.contains(&"old key"));
        assert!(keys.contains(&file_name));
        assert_eq!(entries[0]["priority"], 72);

        // The existing card is reused with the lorebook embedded.
        assert_eq!(output.card["data"]["description"], "kept as-is");
        assert!(output.card["data"]["character_book"].is_object());
        assert!(run_dir.join("memory_append_history.jsonl").exists());

        // A second append pass sees the scan manifest and mines nothing.
        let again = Arc::new(MockLlm::default());
        let mut p = params(&model_dir, &run_dir, request());
        p.append_memories = true;
        p.existing_card = Some(existing_card);
        p.existing_memories = output
            .lorebook["data"]["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| LorebookEntry {
                name: e["name"].as_str().unwrap_or("Memory").to_string(),
                keys: e["keys"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .filter_map(|k| k.as_str())
                    .map(str::to_string)
                    .collect(),
                content: e["content"].as_str().unwrap().to_string(),
                category: MemoryCategory::SharedMemory,
                priority: e["priority"].as_i64().unwrap_or(0),
                source_conversation: None,
                source_date: None,
            })
            .collect();
        let output = run_generation(again.clone(), p).await.unwrap();
        assert_eq!(again.count("memory_extract:"), 0);
        assert_eq!(output.status, GenerationStatus::Completed);
    }

    #[tokio::test]
    async fn preflight_failure_is_fatal_without_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("model");
        std::fs::create_dir_all(&model_dir).unwrap();
        write_fixture_files(&model_dir, 2);
        let run_dir = dir.path().join("run");

        let mock = Arc::new(MockLlm {
            fail_preflight: true,
            ..Default::default()
        });
        let err = run_generation(mock, params(&model_dir, &run_dir, request()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ProviderPreflightFailed(_)));
        assert!(!run_dir.join("generation_resume.json").exists());
    }
}
