//! Test infrastructure: scriptable doubles for the hardware seam, the host
//! syscall dispatcher and trap delivery. Used by unit and integration tests;
//! kept out of `#[cfg(test)]` so the `tests/` suite can reach it.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::config::types::{CoprunError, Result};
use crate::exec::fault::TrapSink;
use crate::exec::relay::{HostSyscalls, RelayBlock, SyscallOutcome};
use crate::hw::resource::{
    check_local_bounds, CoprocessorOps, PendingCondition, ResourceId, SavedImage,
    DMA_PURGE_COMPLETE, DMA_PURGE_REQUEST,
};
use crate::hw::status::{PrivMode, RunControl, StopStatus};

/// One recorded local-store access (offset, length, was_write).
pub type AccessRecord = (u32, usize, bool);

struct MockState {
    local_store: Vec<u8>,
    pc: u32,
    status: u32,
    status_script: VecDeque<u32>,
    run_control: RunControl,
    run_control_log: Vec<RunControl>,
    priv_mode: PrivMode,
    problem_state: bool,
    signal1: u32,
    signal2: u32,
    dma_control: u64,
    dma_stalled: bool,
    pending: Option<PendingCondition>,
    fail_next_run_control: bool,
    mappings_revoked: usize,
    accesses: Vec<AccessRecord>,
}

/// Fully scriptable coprocessor double.
///
/// Writing `RUNNABLE` to run control pops the next scripted status, modeling
/// the unit running until its next stop; with an empty script the status is
/// left unchanged.
pub struct MockCoprocessor {
    id: ResourceId,
    state: Mutex<MockState>,
}

impl MockCoprocessor {
    pub fn new(id: ResourceId, local_store_size: u32) -> Self {
        Self {
            id,
            state: Mutex::new(MockState {
                local_store: vec![0u8; local_store_size as usize],
                pc: 0,
                status: 0,
                status_script: VecDeque::new(),
                run_control: RunControl::empty(),
                run_control_log: Vec::new(),
                priv_mode: PrivMode::Normal,
                problem_state: true,
                signal1: 0,
                signal2: 0,
                dma_control: 0,
                dma_stalled: false,
                pending: None,
                fail_next_run_control: false,
                mappings_revoked: 0,
                accesses: Vec::new(),
            }),
        }
    }

    pub fn set_status_raw(&self, raw: u32) {
        self.state.lock().unwrap().status = raw;
    }

    /// Queue a status the unit reaches after its next arming.
    pub fn push_status_raw(&self, raw: u32) {
        self.state.lock().unwrap().status_script.push_back(raw);
    }

    pub fn set_pc(&self, pc: u32) {
        self.state.lock().unwrap().pc = pc;
    }

    pub fn set_pending(&self, cond: Option<PendingCondition>) {
        self.state.lock().unwrap().pending = cond;
    }

    pub fn stall_dma_purge(&self, stalled: bool) {
        self.state.lock().unwrap().dma_stalled = stalled;
    }

    pub fn fail_next_run_control(&self) {
        self.state.lock().unwrap().fail_next_run_control = true;
    }

    pub fn last_run_control(&self) -> Option<RunControl> {
        self.state.lock().unwrap().run_control_log.last().copied()
    }

    pub fn run_control_log(&self) -> Vec<RunControl> {
        self.state.lock().unwrap().run_control_log.clone()
    }

    pub fn priv_mode(&self) -> PrivMode {
        self.state.lock().unwrap().priv_mode
    }

    pub fn signals(&self) -> (u32, u32) {
        let st = self.state.lock().unwrap();
        (st.signal1, st.signal2)
    }

    pub fn mappings_revoked(&self) -> usize {
        self.state.lock().unwrap().mappings_revoked
    }

    pub fn accesses(&self) -> Vec<AccessRecord> {
        self.state.lock().unwrap().accesses.clone()
    }
}

impl CoprocessorOps for MockCoprocessor {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn local_store_size(&self) -> u32 {
        self.state.lock().unwrap().local_store.len() as u32
    }

    fn read_status(&self) -> StopStatus {
        StopStatus::from_raw(self.state.lock().unwrap().status)
    }

    fn read_run_control(&self) -> RunControl {
        self.state.lock().unwrap().run_control
    }

    fn write_run_control(&self, ctl: RunControl) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.fail_next_run_control {
            st.fail_next_run_control = false;
            return Err(CoprunError::ResourceFault(
                "injected run-control write failure".to_string(),
            ));
        }
        st.run_control_log.push(ctl);
        st.run_control = ctl;
        if ctl.contains(RunControl::RUNNABLE) {
            if let Some(next) = st.status_script.pop_front() {
                st.status = next;
            }
        }
        Ok(())
    }

    fn write_priv_mode(&self, mode: PrivMode) -> Result<()> {
        self.state.lock().unwrap().priv_mode = mode;
        Ok(())
    }

    fn problem_state(&self) -> bool {
        self.state.lock().unwrap().problem_state
    }

    fn set_problem_state(&self, enabled: bool) -> Result<()> {
        self.state.lock().unwrap().problem_state = enabled;
        Ok(())
    }

    fn write_signal1(&self, value: u32) -> Result<()> {
        self.state.lock().unwrap().signal1 = value;
        Ok(())
    }

    fn write_signal2(&self, value: u32) -> Result<()> {
        self.state.lock().unwrap().signal2 = value;
        Ok(())
    }

    fn read_pc(&self) -> u32 {
        self.state.lock().unwrap().pc
    }

    fn write_pc(&self, pc: u32) -> Result<()> {
        self.state.lock().unwrap().pc = pc;
        Ok(())
    }

    fn read_local(&self, offset: u32, buf: &mut [u8]) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        check_local_bounds(offset, buf.len(), st.local_store.len() as u32)?;
        st.accesses.push((offset, buf.len(), false));
        let start = offset as usize;
        buf.copy_from_slice(&st.local_store[start..start + buf.len()]);
        Ok(())
    }

    fn write_local(&self, offset: u32, data: &[u8]) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        check_local_bounds(offset, data.len(), st.local_store.len() as u32)?;
        st.accesses.push((offset, data.len(), true));
        let start = offset as usize;
        st.local_store[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_dma_control(&self) -> u64 {
        let st = self.state.lock().unwrap();
        if st.dma_stalled {
            0
        } else if st.dma_control & DMA_PURGE_REQUEST != 0 {
            DMA_PURGE_COMPLETE
        } else {
            st.dma_control
        }
    }

    fn write_dma_control(&self, value: u64) -> Result<()> {
        self.state.lock().unwrap().dma_control = value;
        Ok(())
    }

    fn revoke_mappings(&self) {
        self.state.lock().unwrap().mappings_revoked += 1;
    }

    fn pending_condition(&self) -> Option<PendingCondition> {
        self.state.lock().unwrap().pending
    }

    fn clear_pending_condition(&self) {
        self.state.lock().unwrap().pending = None;
    }

    fn restore_image(&self, image: &SavedImage) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let len = st.local_store.len().min(image.local_store.len());
        let src = image.local_store[..len].to_vec();
        st.local_store[..len].copy_from_slice(&src);
        st.pc = image.pc;
        st.status = image.status.raw();
        Ok(())
    }
}

/// Host dispatcher double with a scripted outcome queue. With an empty queue
/// every dispatch returns `Done(0)`.
#[derive(Default)]
pub struct ScriptedSyscalls {
    outcomes: Mutex<VecDeque<SyscallOutcome>>,
    unsupported: Mutex<HashSet<u64>>,
    dispatched: Mutex<Vec<RelayBlock>>,
}

impl ScriptedSyscalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_outcome(&self, outcome: SyscallOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn mark_unsupported(&self, nr: u64) {
        self.unsupported.lock().unwrap().insert(nr);
    }

    pub fn dispatched(&self) -> Vec<RelayBlock> {
        self.dispatched.lock().unwrap().clone()
    }
}

impl HostSyscalls for ScriptedSyscalls {
    fn is_supported(&self, nr: u64) -> bool {
        !self.unsupported.lock().unwrap().contains(&nr)
    }

    fn dispatch(&self, block: &RelayBlock) -> SyscallOutcome {
        self.dispatched.lock().unwrap().push(*block);
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SyscallOutcome::Done(0))
    }
}

/// Trap sink that counts deliveries instead of raising a signal.
#[derive(Default)]
pub struct RecordingTrapSink {
    delivered: AtomicUsize,
}

impl RecordingTrapSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }
}

impl TrapSink for RecordingTrapSink {
    fn deliver_trap(&self) {
        self.delivered.fetch_add(1, Ordering::SeqCst);
    }
}
