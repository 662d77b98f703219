//! Structured per-run event trace and engine counters.
//!
//! Every run emits an ordered event stream keyed by a run id. The stream is
//! what the concurrency tests assert on, and what `--trace` prints from the
//! CLI; it is additionally mirrored to the `log` facade at debug level.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use uuid::Uuid;

/// One recorded run-loop transition.
#[derive(Clone, Debug, Serialize)]
pub struct TraceEvent {
    pub run_id: Uuid,
    pub context_id: Uuid,
    pub at: DateTime<Utc>,
    pub kind: TraceEventKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum TraceEventKind {
    RunStarted { entry: u32 },
    ResourceBound { resource: usize },
    Initialized { isolated: bool },
    Stopped { raw_status: u32, pc: u32 },
    RelayStarted { nr: u64 },
    RelayCompleted { interrupted: bool },
    ExceptionRelayed,
    ReacquireStarted,
    Finalized {
        interrupted: bool,
        raw_status: Option<u32>,
        pc: u32,
    },
}

/// Sink for trace events; implementations must tolerate concurrent runs.
pub trait TraceSink: Send + Sync {
    fn record(&self, event: TraceEvent);
}

/// In-memory sink for tests and the CLI `--trace` flag.
#[derive(Default)]
pub struct MemoryTraceSink {
    events: Mutex<Vec<TraceEvent>>,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<TraceEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Event kinds for one run, in recorded order.
    pub fn kinds_for(&self, run_id: Uuid) -> Vec<TraceEventKind> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.run_id == run_id)
            .map(|e| e.kind.clone())
            .collect()
    }

    pub fn run_ids(&self) -> Vec<Uuid> {
        let mut ids = Vec::new();
        for event in self.events.lock().unwrap().iter() {
            if !ids.contains(&event.run_id) {
                ids.push(event.run_id);
            }
        }
        ids
    }
}

impl TraceSink for MemoryTraceSink {
    fn record(&self, event: TraceEvent) {
        debug!(
            "run {} ctx {}: {:?}",
            event.run_id, event.context_id, event.kind
        );
        self.events.lock().unwrap().push(event);
    }
}

/// Engine-lifetime counters.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub runs_started: AtomicU64,
    pub runs_completed: AtomicU64,
    pub runs_interrupted: AtomicU64,
    pub relays: AtomicU64,
    pub exceptions_relayed: AtomicU64,
    pub reacquisitions: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`] for reporting.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub runs_started: u64,
    pub runs_completed: u64,
    pub runs_interrupted: u64,
    pub relays: u64,
    pub exceptions_relayed: u64,
    pub reacquisitions: u64,
}

impl EngineMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_interrupted: self.runs_interrupted.load(Ordering::Relaxed),
            relays: self.relays.load(Ordering::Relaxed),
            exceptions_relayed: self.exceptions_relayed.load(Ordering::Relaxed),
            reacquisitions: self.reacquisitions.load(Ordering::Relaxed),
        }
    }
}
