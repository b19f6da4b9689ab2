// Reverie Engine — Generation Progress
// Structured events emitted on every stage transition and every LLM call
// start/complete/retry/fail. `total_calls` is fixed when the run starts;
// calls skipped via checkpoint count as completed so the numbers converge
// on resumed runs.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationPhase {
    Init,
    Preflight,
    PersonaObservation,
    MemoryExtract,
    PersonaSynthesis,
    MemorySynthesis,
    Manifest,
    Done,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub phase: GenerationPhase,
    pub message: String,
    pub started_calls: usize,
    pub completed_calls: usize,
    pub failed_calls: usize,
    pub active_calls: usize,
    pub total_calls: usize,
}

pub type ProgressSink = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Shared call counters plus the optional sink. Cheap to clone across
/// workers; all counters are atomics.
#[derive(Clone)]
pub struct ProgressReporter {
    started: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    total: usize,
    sink: Option<ProgressSink>,
}

impl ProgressReporter {
    pub fn new(total_calls: usize, sink: Option<ProgressSink>) -> Self {
        ProgressReporter {
            started: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicUsize::new(0)),
            failed: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            total: total_calls,
            sink,
        }
    }

    pub fn call_started(&self, phase: GenerationPhase, message: impl Into<String>) {
        self.started.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        self.emit(phase, message);
    }

    pub fn call_completed(&self, phase: GenerationPhase, message: impl Into<String>) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.emit(phase, message);
    }

    pub fn call_failed(&self, phase: GenerationPhase, message: impl Into<String>) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.emit(phase, message);
    }

    /// A call satisfied from the checkpoint: completed without starting.
    pub fn call_skipped(&self, phase: GenerationPhase, message: impl Into<String>) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.emit(phase, message);
    }

    /// A call torn down by cancellation: neither completed nor failed.
    pub fn call_aborted(&self, phase: GenerationPhase, message: impl Into<String>) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.emit(phase, message);
    }

    pub fn emit(&self, phase: GenerationPhase, message: impl Into<String>) {
        let Some(sink) = &self.sink else { return };
        sink(&ProgressEvent {
            phase,
            message: message.into(),
            started_calls: self.started.load(Ordering::Relaxed),
            completed_calls: self.completed.load(Ordering::Relaxed),
            failed_calls: self.failed.load(Ordering::Relaxed),
            active_calls: self.active.load(Ordering::Relaxed),
            total_calls: self.total,
        });
    }

    pub fn started_calls(&self) -> usize {
        self.started.load(Ordering::Relaxed)
    }

    pub fn completed_calls(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed_calls(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn total_calls(&self) -> usize {
        self.total
    }
}
