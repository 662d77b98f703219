//! Resource-handle seam over one physical coprocessor.
//!
//! Everything the engine does to hardware goes through [`CoprocessorOps`], so
//! real MMIO-backed handles, the software model in [`crate::hw::sim`] and the
//! test doubles in [`crate::testing`] are interchangeable.

use std::time::{Duration, Instant};

use crate::config::types::{CoprunError, Result};
use crate::hw::status::{PrivMode, RunControl, StopStatus};

/// Index of a physical coprocessor registered with the engine.
pub type ResourceId = usize;

/// Fault-like or asynchronous condition pending on a coprocessor, forwarded
/// to the external fault handler by the run loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingCondition {
    /// Translation or access fault raised by the coprocessor's DMA engine.
    DataFault { addr: u32 },
    /// Asynchronous error events, delivered as bits in the event-return word.
    AsyncError { events: u32 },
}

/// DMA-queue control encodings.
pub const DMA_PURGE_REQUEST: u64 = 0x1;
pub const DMA_PURGE_STATUS_MASK: u64 = 0x6;
pub const DMA_PURGE_COMPLETE: u64 = 0x4;

/// Saved device state captured when a context is unbound, restored when it is
/// bound again (possibly to a different physical unit).
#[derive(Clone, Debug)]
pub struct SavedImage {
    pub local_store: Vec<u8>,
    pub pc: u32,
    pub status: StopStatus,
}

/// Accessors for one physical coprocessor's registers and local store.
///
/// A handle is exclusively owned by the context it is bound to; the ownership
/// table in [`crate::sched::ownership`] enforces that, not the handle itself.
pub trait CoprocessorOps: Send + Sync {
    fn id(&self) -> ResourceId;

    /// Size of the coprocessor-local memory window in bytes.
    fn local_store_size(&self) -> u32;

    /// Pure snapshot of the status register.
    fn read_status(&self) -> StopStatus;

    fn read_run_control(&self) -> RunControl;

    /// Fails with `ResourceFault` on a hardware-write error; fatal to the
    /// current attempt.
    fn write_run_control(&self, ctl: RunControl) -> Result<()>;

    fn write_priv_mode(&self, mode: PrivMode) -> Result<()>;

    /// Problem-state bit: set means user mode. Cleared while the isolated
    /// loader is given access to privileged facilities.
    fn problem_state(&self) -> bool;
    fn set_problem_state(&self, enabled: bool) -> Result<()>;

    fn write_signal1(&self, value: u32) -> Result<()>;
    fn write_signal2(&self, value: u32) -> Result<()>;

    fn read_pc(&self) -> u32;
    fn write_pc(&self, pc: u32) -> Result<()>;

    /// Bounds-checked local store read; fails `OutOfRange` when
    /// `offset + buf.len()` exceeds the local store size.
    fn read_local(&self, offset: u32, buf: &mut [u8]) -> Result<()>;

    /// Bounds-checked local store write, same range rule as [`read_local`].
    ///
    /// [`read_local`]: CoprocessorOps::read_local
    fn write_local(&self, offset: u32, data: &[u8]) -> Result<()>;

    fn read_dma_control(&self) -> u64;
    fn write_dma_control(&self, value: u64) -> Result<()>;

    /// Revoke outstanding host mappings of the coprocessor windows.
    fn revoke_mappings(&self);

    fn pending_condition(&self) -> Option<PendingCondition>;
    fn clear_pending_condition(&self);

    /// Restore previously saved device state into this unit. Used when a
    /// context is rebound after release or preemption.
    fn restore_image(&self, image: &SavedImage) -> Result<()>;

    /// Purge the DMA queue, polling the completion bit up to `bound`.
    /// A timeout is fatal to the attempt and is not retried here.
    fn purge_dma_queue(&self, bound: Duration) -> Result<()> {
        self.write_dma_control(DMA_PURGE_REQUEST)?;
        let start = Instant::now();
        while self.read_dma_control() & DMA_PURGE_STATUS_MASK != DMA_PURGE_COMPLETE {
            if start.elapsed() > bound {
                return Err(CoprunError::Timeout {
                    what: "flushing the DMA queue",
                    waited: bound,
                });
            }
            std::thread::yield_now();
        }
        // clear purge status
        self.write_dma_control(0)?;
        Ok(())
    }
}

/// Range check shared by local store accessors.
pub fn check_local_bounds(offset: u32, len: usize, size: u32) -> Result<()> {
    let len = u32::try_from(len).map_err(|_| CoprunError::OutOfRange {
        offset,
        len: u32::MAX,
        size,
    })?;
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(CoprunError::OutOfRange { offset, len, size }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_accept_exact_end_and_reject_one_past() {
        assert!(check_local_bounds(0x200, 56, 0x238).is_ok());
        assert!(matches!(
            check_local_bounds(0x201, 56, 0x238),
            Err(CoprunError::OutOfRange { .. })
        ));
    }

    #[test]
    fn bounds_reject_offset_overflow() {
        assert!(check_local_bounds(u32::MAX - 4, 8, u32::MAX).is_err());
    }
}
