/// Core types and error taxonomy shared across the coprun engine
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::hw::status::StopStatus;

/// Engine-wide tunables.
///
/// The two bootstrap bounds are fixed at one second by the hardware contract;
/// they are configurable here so tests can shrink them without sleeping.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bound on the DMA-queue purge during isolated bootstrap.
    pub dma_purge_timeout: Duration,
    /// Bound on the isolated-loader status poll.
    pub loader_poll_timeout: Duration,
    /// Poll interval for cancellable blocking waits (run lock, resource
    /// acquisition, stop wait).
    pub wait_poll_interval: Duration,
    /// Period of the per-run tick timer.
    pub tick_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dma_purge_timeout: Duration::from_secs(1),
            loader_poll_timeout: Duration::from_secs(1),
            wait_poll_interval: Duration::from_millis(10),
            tick_interval: Duration::from_millis(100),
        }
    }
}

/// Outcome of one `run()` invocation.
///
/// `Interrupted` is a distinguished outcome, not a failure: the context
/// records a program counter and status from which re-invocation is correct,
/// so the caller may simply call `run()` again with the recorded counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The coprocessor reached a terminal stop.
    Stopped {
        status: StopStatus,
        npc: u32,
        events: u32,
    },
    /// The run was interrupted at a cancellation point, or a restart-class
    /// host syscall result asked the caller to re-run.
    Interrupted { npc: u32, events: u32 },
}

impl RunOutcome {
    pub fn npc(&self) -> u32 {
        match *self {
            RunOutcome::Stopped { npc, .. } => npc,
            RunOutcome::Interrupted { npc, .. } => npc,
        }
    }

    pub fn events(&self) -> u32 {
        match *self {
            RunOutcome::Stopped { events, .. } => events,
            RunOutcome::Interrupted { events, .. } => events,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, RunOutcome::Interrupted { .. })
    }
}

/// Custom error types for coprun
#[derive(Error, Debug)]
pub enum CoprunError {
    /// Cancellation observed at a suspension point. Always safely resumable.
    #[error("interrupted at a cancellation point")]
    Interrupted,

    #[error("no coprocessor available: {0}")]
    ResourceUnavailable(String),

    /// A fixed hardware bound was exceeded. Fatal to the attempt, never
    /// auto-retried.
    #[error("timed out {what} after {waited:?}")]
    Timeout {
        what: &'static str,
        waited: Duration,
    },

    /// Protocol violation, e.g. an out-of-bounds relay pointer. Never
    /// silently ignored.
    #[error("relay protocol fault: {0}")]
    Fault(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Hardware register access failed.
    #[error("coprocessor access fault: {0}")]
    ResourceFault(String),

    #[error("local store access out of range: offset {offset:#x} + len {len:#x} exceeds size {size:#x}")]
    OutOfRange { offset: u32, len: u32, size: u32 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<nix::errno::Errno> for CoprunError {
    fn from(err: nix::errno::Errno) -> Self {
        CoprunError::ResourceFault(err.to_string())
    }
}

/// Result type alias for coprun operations
pub type Result<T> = std::result::Result<T, CoprunError>;
