//! Status and control register encodings.
//!
//! The bit positions and the two reserved stop codes are fixed by the
//! external ISA contract and must not be renumbered.

use bitflags::bitflags;
use serde::Serialize;

bitflags! {
    /// Raw bits of the coprocessor status register.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct StatusBits: u32 {
        const RUNNING              = 0x0000_0001;
        const STOPPED_BY_STOP      = 0x0000_0002;
        const STOPPED_BY_HALT      = 0x0000_0004;
        const SINGLE_STEP          = 0x0000_0010;
        const ISOLATED_STATE       = 0x0000_0080;
        const ISOLATED_LOAD_STATUS = 0x0000_0200;
    }
}

bitflags! {
    /// Run-control register. Writing an empty set stops the coprocessor.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct RunControl: u32 {
        const RUNNABLE = 0x1;
        const ISOLATE  = 0x2;
    }
}

/// Privilege-control execution mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PrivMode {
    #[default]
    Normal,
    SingleStep,
}

/// Stop code occupies bits 16..30 of the status register.
pub const STOP_CODE_SHIFT: u32 = 16;
pub const STOP_CODE_MASK: u32 = 0x3fff;

/// Stop code issued by coprocessor-resident code requesting a host syscall.
pub const STOP_CODE_HOST_CALL: u16 = 0x2104;

/// Stop code reserved for host-side debugger trap delivery.
pub const STOP_CODE_DEBUG_TRAP: u16 = 0x3fff;

/// Immutable snapshot decoded from the status register at a wakeup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StopStatus {
    raw: u32,
}

impl StopStatus {
    pub fn from_raw(raw: u32) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> u32 {
        self.raw
    }

    fn bits(&self) -> StatusBits {
        StatusBits::from_bits_truncate(self.raw)
    }

    pub fn running(&self) -> bool {
        self.bits().contains(StatusBits::RUNNING)
    }

    pub fn stopped_by_stop(&self) -> bool {
        self.bits().contains(StatusBits::STOPPED_BY_STOP)
    }

    pub fn stopped_by_halt(&self) -> bool {
        self.bits().contains(StatusBits::STOPPED_BY_HALT)
    }

    pub fn single_stepped(&self) -> bool {
        self.bits().contains(StatusBits::SINGLE_STEP)
    }

    pub fn isolated_state(&self) -> bool {
        self.bits().contains(StatusBits::ISOLATED_STATE)
    }

    pub fn isolated_load_status(&self) -> bool {
        self.bits().contains(StatusBits::ISOLATED_LOAD_STATUS)
    }

    /// Stop code delivered with a stop-and-signal; meaningful only when
    /// `stopped_by_stop()` is set.
    pub fn stop_code(&self) -> u16 {
        ((self.raw >> STOP_CODE_SHIFT) & STOP_CODE_MASK) as u16
    }

    /// Any of the stop reasons that end a run once classification has not
    /// diverted it elsewhere.
    pub fn is_terminal_stop(&self) -> bool {
        self.bits().intersects(
            StatusBits::STOPPED_BY_STOP | StatusBits::STOPPED_BY_HALT | StatusBits::SINGLE_STEP,
        )
    }

    /// Copy of this snapshot with the stop-and-signal bit cleared; used after
    /// a completed syscall relay has already re-armed the coprocessor.
    pub fn without_stop(&self) -> Self {
        Self {
            raw: self.raw & !StatusBits::STOPPED_BY_STOP.bits(),
        }
    }
}

/// Compose a raw status word for a stop-and-signal with the given code.
pub fn stop_status_raw(code: u16) -> u32 {
    StatusBits::STOPPED_BY_STOP.bits() | ((code as u32 & STOP_CODE_MASK) << STOP_CODE_SHIFT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_code_round_trips_through_raw_status() {
        let st = StopStatus::from_raw(stop_status_raw(0x2104));
        assert!(st.stopped_by_stop());
        assert!(!st.running());
        assert_eq!(st.stop_code(), 0x2104);
    }

    #[test]
    fn terminal_stop_covers_halt_and_single_step() {
        assert!(StopStatus::from_raw(StatusBits::STOPPED_BY_HALT.bits()).is_terminal_stop());
        assert!(StopStatus::from_raw(StatusBits::SINGLE_STEP.bits()).is_terminal_stop());
        assert!(!StopStatus::from_raw(StatusBits::RUNNING.bits()).is_terminal_stop());
    }

    #[test]
    fn without_stop_clears_only_the_stop_bit() {
        let raw = stop_status_raw(0x2104) | StatusBits::ISOLATED_STATE.bits();
        let st = StopStatus::from_raw(raw).without_stop();
        assert!(!st.stopped_by_stop());
        assert!(st.isolated_state());
    }
}
