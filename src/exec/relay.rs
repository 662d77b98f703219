//! Host syscall relay.
//!
//! Coprocessor-resident code requests a host syscall by stopping with the
//! host-call stop code, leaving a pointer word at the reported program
//! counter whose value is the local-store offset of a fixed-layout relay
//! block. The relay copies the block out, runs the host syscall without
//! pinning the unit, writes the result back and re-arms the coprocessor.
//!
//! Restart-class host results are not encoded in ad-hoc PC arithmetic; the
//! translation is the total function [`complete_relay`].

use log::debug;
use nix::errno::Errno;

use crate::config::types::{CoprunError, Result};

/// Fixed ABI: result slot aliases the syscall-number word at offset 0,
/// followed by six argument words. All fields little-endian.
pub const RELAY_BLOCK_SIZE: u32 = 56;
pub const RELAY_ARG_COUNT: usize = 6;
pub const RELAY_RESULT_OFFSET: u32 = 0;

/// Relay block copied out of coprocessor local store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayBlock {
    pub nr: u64,
    pub args: [u64; RELAY_ARG_COUNT],
}

impl RelayBlock {
    pub fn parse(raw: &[u8; RELAY_BLOCK_SIZE as usize]) -> Self {
        let word = |i: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&raw[i * 8..i * 8 + 8]);
            u64::from_le_bytes(w)
        };
        let mut args = [0u64; RELAY_ARG_COUNT];
        for (i, arg) in args.iter_mut().enumerate() {
            *arg = word(i + 1);
        }
        Self { nr: word(0), args }
    }

    pub fn to_bytes(&self) -> [u8; RELAY_BLOCK_SIZE as usize] {
        let mut raw = [0u8; RELAY_BLOCK_SIZE as usize];
        raw[0..8].copy_from_slice(&self.nr.to_le_bytes());
        for (i, arg) in self.args.iter().enumerate() {
            raw[(i + 1) * 8..(i + 2) * 8].copy_from_slice(&arg.to_le_bytes());
        }
        raw
    }
}

/// Result classes a host syscall dispatch may produce. The four restart
/// variants mirror the host's signal-restart conventions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallOutcome {
    Done(i64),
    /// Re-execute the request transparently after the caller re-runs.
    RestartSys,
    RestartNoIntr,
    /// No handler-transparent restart possible; the coprocessor sees EINTR.
    RestartNoHand,
    RestartBlock,
}

/// Host syscall dispatcher seam. The table and argument ABI belong to the
/// host integration, not to this crate.
pub trait HostSyscalls: Send + Sync {
    fn is_supported(&self, nr: u64) -> bool;
    fn dispatch(&self, block: &RelayBlock) -> SyscallOutcome;
}

/// Progress of one relay round trip, kept explicit so an interruption always
/// leaves a well-defined resumable state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayPhase {
    NotStarted,
    /// The unit was unbound and the host syscall is (or was) in flight.
    AwaitingHostResult { saved_pc: u32 },
    Completed,
}

/// Write-back instruction derived from a host outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelayCompletion {
    /// Value to store in the result slot; `None` leaves the slot unwritten.
    pub write_back: Option<i64>,
    /// Program counter to resume at (possibly rewound to re-issue the stop).
    pub npc: u32,
    /// Whether `run()` must return `Interrupted` so the caller re-runs.
    pub interrupted: bool,
}

/// Total translation of host outcomes for a relay stopped at
/// `resume_pc = pc + 4`. Rewinding by 8 lands back on the stop that issued
/// the request, so a re-run re-executes it transparently.
pub fn complete_relay(outcome: SyscallOutcome, resume_pc: u32) -> RelayCompletion {
    match outcome {
        SyscallOutcome::Done(value) => RelayCompletion {
            write_back: Some(value),
            npc: resume_pc,
            interrupted: false,
        },
        SyscallOutcome::RestartSys | SyscallOutcome::RestartNoIntr => RelayCompletion {
            write_back: None,
            npc: resume_pc.wrapping_sub(8),
            interrupted: true,
        },
        SyscallOutcome::RestartNoHand | SyscallOutcome::RestartBlock => RelayCompletion {
            write_back: Some(-(Errno::EINTR as i32 as i64)),
            npc: resume_pc,
            interrupted: true,
        },
    }
}

/// Host syscall numbers understood by the native backend. The relay itself
/// is number-agnostic; these belong to the fixed external ABI.
pub mod nr {
    pub const NOOP: u64 = 0;
    pub const GETPID: u64 = 1;
    pub const CLOSE: u64 = 2;
    pub const DUP: u64 = 3;
    pub const LSEEK: u64 = 4;
}

/// Native dispatcher for the pointer-free subset of the table. Results use
/// the negative-errno convention; an EINTR from the host maps to
/// `RestartSys` so the stop is re-executed transparently.
pub struct NativeSyscalls;

impl NativeSyscalls {
    fn raw_dispatch(block: &RelayBlock) -> i64 {
        let ret = match block.nr {
            nr::NOOP => 0,
            nr::GETPID => (unsafe { libc::getpid() }) as i64,
            nr::CLOSE => (unsafe { libc::close(block.args[0] as i32) }) as i64,
            nr::DUP => (unsafe { libc::dup(block.args[0] as i32) }) as i64,
            nr::LSEEK => (unsafe {
                libc::lseek(
                    block.args[0] as i32,
                    block.args[1] as libc::off_t,
                    block.args[2] as i32,
                )
            }) as i64,
            other => {
                debug!("relay: unsupported host syscall {other}");
                return -(Errno::ENOSYS as i32 as i64);
            }
        };
        if ret < 0 {
            -(Errno::last() as i32 as i64)
        } else {
            ret
        }
    }
}

impl HostSyscalls for NativeSyscalls {
    fn is_supported(&self, nr: u64) -> bool {
        nr <= nr::LSEEK
    }

    fn dispatch(&self, block: &RelayBlock) -> SyscallOutcome {
        let ret = Self::raw_dispatch(block);
        if ret == -(Errno::EINTR as i32 as i64) {
            SyscallOutcome::RestartSys
        } else {
            SyscallOutcome::Done(ret)
        }
    }
}

/// Validate a relay pointer against the local store. Equality with the last
/// in-bounds position is accepted; one byte past is a protocol fault.
pub fn check_relay_pointer(ls_pointer: u32, local_store_size: u32) -> Result<()> {
    if local_store_size < RELAY_BLOCK_SIZE || ls_pointer > local_store_size - RELAY_BLOCK_SIZE {
        return Err(CoprunError::Fault(format!(
            "relay block pointer {ls_pointer:#x} outside local store of {local_store_size:#x} bytes"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_parse_and_encode_are_inverse() {
        let block = RelayBlock {
            nr: 4,
            args: [1, 2, 3, 4, 5, 6],
        };
        assert_eq!(RelayBlock::parse(&block.to_bytes()), block);
    }

    #[test]
    fn restart_table_matches_the_contract() {
        let eintr = -(Errno::EINTR as i32 as i64);

        let done = complete_relay(SyscallOutcome::Done(42), 0x104);
        assert_eq!(done.write_back, Some(42));
        assert_eq!(done.npc, 0x104);
        assert!(!done.interrupted);

        for outcome in [SyscallOutcome::RestartSys, SyscallOutcome::RestartNoIntr] {
            let c = complete_relay(outcome, 0x104);
            assert_eq!(c.write_back, None);
            assert_eq!(c.npc, 0x104 - 8);
            assert!(c.interrupted);
        }

        for outcome in [SyscallOutcome::RestartNoHand, SyscallOutcome::RestartBlock] {
            let c = complete_relay(outcome, 0x104);
            assert_eq!(c.write_back, Some(eintr));
            assert_eq!(c.npc, 0x104);
            assert!(c.interrupted);
        }
    }

    #[test]
    fn relay_pointer_bounds_accept_equal_reject_past() {
        assert!(check_relay_pointer(0x1000 - RELAY_BLOCK_SIZE, 0x1000).is_ok());
        assert!(matches!(
            check_relay_pointer(0x1000 - RELAY_BLOCK_SIZE + 1, 0x1000),
            Err(CoprunError::Fault(_))
        ));
        assert!(check_relay_pointer(0, RELAY_BLOCK_SIZE - 1).is_err());
    }

    #[test]
    fn native_backend_noop_and_getpid() {
        let native = NativeSyscalls;
        assert!(native.is_supported(nr::NOOP));
        assert!(!native.is_supported(999));

        let block = RelayBlock {
            nr: nr::NOOP,
            ..RelayBlock::default()
        };
        assert_eq!(native.dispatch(&block), SyscallOutcome::Done(0));

        let block = RelayBlock {
            nr: nr::GETPID,
            ..RelayBlock::default()
        };
        match native.dispatch(&block) {
            SyscallOutcome::Done(pid) => assert_eq!(pid, std::process::id() as i64),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn native_backend_maps_errno() {
        let native = NativeSyscalls;
        let block = RelayBlock {
            nr: nr::CLOSE,
            args: [u64::MAX, 0, 0, 0, 0, 0],
        };
        let expected = -(Errno::EBADF as i32 as i64);
        assert_eq!(native.dispatch(&block), SyscallOutcome::Done(expected));
    }
}
