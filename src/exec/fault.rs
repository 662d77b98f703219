//! Exception relay and trap delivery seams.
//!
//! Fault-like and asynchronous pending conditions are forwarded to an
//! external handler; this module only defines the seam and a logging default.

use log::warn;
use nix::sys::signal::{raise, Signal};

use crate::config::types::Result;
use crate::hw::resource::PendingCondition;
use crate::sched::context::Context;

/// External fault handler consulted by the run loop whenever a pending
/// condition is observed. An error return terminates the run as interrupted.
pub trait FaultHandler: Send + Sync {
    fn handle(&self, ctx: &Context, cond: &PendingCondition) -> Result<()>;
}

/// Default handler: log and resolve. Real integrations route data faults to
/// their paging machinery and async errors to their event delivery.
pub struct LoggingFaultHandler;

impl FaultHandler for LoggingFaultHandler {
    fn handle(&self, ctx: &Context, cond: &PendingCondition) -> Result<()> {
        match cond {
            PendingCondition::DataFault { addr } => {
                warn!("context {}: data fault at {addr:#x}", ctx.id());
            }
            PendingCondition::AsyncError { events } => {
                warn!("context {}: async error events {events:#x}", ctx.id());
            }
        }
        Ok(())
    }
}

/// Delivery seam for the synchronous debug trap forced by the reserved
/// debug-trap stop code.
pub trait TrapSink: Send + Sync {
    fn deliver_trap(&self);
}

/// Raises SIGTRAP on the calling thread, mirroring how a debugger expects
/// the trap to arrive.
pub struct NativeTrapSink;

impl TrapSink for NativeTrapSink {
    fn deliver_trap(&self) {
        if let Err(e) = raise(Signal::SIGTRAP) {
            warn!("failed to deliver SIGTRAP: {e}");
        }
    }
}
