//! Software coprocessor model.
//!
//! Implements the full hardware contract over an in-memory device so the
//! engine can be driven end to end without silicon: a three-instruction
//! micro-ISA (nop, stop-and-signal, halt), an isolated-loader emulation with
//! configurable behavior, and the DMA-purge handshake.
//!
//! Execution is synchronous: arming the unit runs it to its next stop before
//! the register write returns. The run loop never observes the difference
//! through the polling stop wait.

use std::sync::Mutex;

use log::warn;

use crate::config::types::{CoprunError, Result};
use crate::hw::resource::{
    check_local_bounds, CoprocessorOps, PendingCondition, ResourceId, SavedImage,
    DMA_PURGE_COMPLETE, DMA_PURGE_REQUEST,
};
use crate::hw::status::{PrivMode, RunControl, StatusBits, StopStatus, STOP_CODE_SHIFT};

/// Instruction encodings of the simulated unit. Words are little-endian in
/// local store; the top byte selects the operation.
pub mod isa {
    /// Advance to the next word.
    pub fn nop() -> u32 {
        0x0000_0000
    }

    /// Stop-and-signal with a 14-bit code. The word following the
    /// instruction is left for host consumption (the relay pointer lives
    /// there by convention) and execution resumes after it.
    pub fn stop(code: u16) -> u32 {
        0x1000_0000 | (code as u32 & 0x3fff)
    }

    /// Halt the unit.
    pub fn halt() -> u32 {
        0x2000_0000
    }
}

/// How the emulated isolated loader behaves when isolation is requested.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SimLoaderMode {
    /// Enter isolation and run the local-store program isolated.
    #[default]
    Accept,
    /// Refuse the load: unit stops with the load-status bit raised.
    Refuse,
    /// Claim to run without entering isolation.
    FallOut,
    /// Never leave the loading state (for timeout exercises).
    Stall,
}

struct SimState {
    local_store: Vec<u8>,
    pc: u32,
    status: u32,
    run_control: RunControl,
    priv_mode: PrivMode,
    problem_state: bool,
    signal1: u32,
    signal2: u32,
    dma_control: u64,
    dma_stalled: bool,
    pending: Option<PendingCondition>,
    isolated_active: bool,
    loader_mode: SimLoaderMode,
}

/// One simulated physical unit.
pub struct SimCoprocessor {
    id: ResourceId,
    state: Mutex<SimState>,
}

/// Step bound per arming; a program that exceeds it is halted rather than
/// wedging the host in an unbounded stop wait.
const MAX_STEPS: u32 = 100_000;

impl SimCoprocessor {
    pub fn new(id: ResourceId, local_store_size: u32) -> Self {
        Self {
            id,
            state: Mutex::new(SimState {
                local_store: vec![0u8; local_store_size as usize],
                pc: 0,
                status: 0,
                run_control: RunControl::empty(),
                priv_mode: PrivMode::Normal,
                problem_state: true,
                signal1: 0,
                signal2: 0,
                dma_control: 0,
                dma_stalled: false,
                pending: None,
                isolated_active: false,
                loader_mode: SimLoaderMode::default(),
            }),
        }
    }

    pub fn set_loader_mode(&self, mode: SimLoaderMode) {
        self.state.lock().unwrap().loader_mode = mode;
    }

    pub fn stall_dma_purge(&self, stalled: bool) {
        self.state.lock().unwrap().dma_stalled = stalled;
    }

    /// Assemble `words` into local store at `offset`.
    pub fn load_program(&self, offset: u32, words: &[u32]) -> Result<()> {
        let mut bytes = Vec::with_capacity(words.len() * 4);
        for word in words {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        self.write_local(offset, &bytes)
    }

    fn fetch(state: &SimState) -> Option<u32> {
        let pc = state.pc as usize;
        let word = state.local_store.get(pc..pc + 4)?;
        Some(u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
    }

    fn execute(state: &mut SimState) {
        let preserved = state.status & StatusBits::ISOLATED_STATE.bits();
        state.status = preserved | StatusBits::RUNNING.bits();

        for _ in 0..MAX_STEPS {
            let Some(word) = Self::fetch(state) else {
                // Fetch past the end of local store: report a data fault and
                // stop without a stop reason.
                state.pending = Some(PendingCondition::DataFault { addr: state.pc });
                state.status = preserved;
                return;
            };

            match word >> 24 {
                0x10 => {
                    let code = word & 0x3fff;
                    state.pc = state.pc.wrapping_add(4);
                    state.status =
                        preserved | StatusBits::STOPPED_BY_STOP.bits() | (code << STOP_CODE_SHIFT);
                    return;
                }
                0x20 => {
                    state.pc = state.pc.wrapping_add(4);
                    state.status = preserved | StatusBits::STOPPED_BY_HALT.bits();
                    return;
                }
                _ => {
                    state.pc = state.pc.wrapping_add(4);
                }
            }

            if state.priv_mode == PrivMode::SingleStep {
                state.status = preserved | StatusBits::SINGLE_STEP.bits();
                return;
            }
        }

        warn!("simulated coprocessor exceeded {MAX_STEPS} steps, halting");
        state.status = preserved | StatusBits::STOPPED_BY_HALT.bits();
    }

    fn start_isolated_load(state: &mut SimState) {
        match state.loader_mode {
            SimLoaderMode::Accept => {
                state.isolated_active = true;
                state.status =
                    (StatusBits::RUNNING | StatusBits::ISOLATED_STATE).bits();
            }
            SimLoaderMode::Refuse => {
                state.status =
                    (StatusBits::ISOLATED_STATE | StatusBits::ISOLATED_LOAD_STATUS).bits();
            }
            SimLoaderMode::FallOut => {
                state.status = StatusBits::RUNNING.bits();
            }
            SimLoaderMode::Stall => {
                state.status = (StatusBits::RUNNING
                    | StatusBits::ISOLATED_STATE
                    | StatusBits::ISOLATED_LOAD_STATUS)
                    .bits();
            }
        }
    }
}

impl CoprocessorOps for SimCoprocessor {
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
        let mut state = self.state.lock().unwrap();
        state.run_control = ctl;

        if ctl.contains(RunControl::ISOLATE) && !state.isolated_active {
            Self::start_isolated_load(&mut state);
            return Ok(());
        }

        if ctl.contains(RunControl::RUNNABLE) {
            Self::execute(&mut state);
        } else {
            // Forced stop: drop the running bit, leave stop reasons alone.
            state.status &= !StatusBits::RUNNING.bits();
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
        let state = self.state.lock().unwrap();
        check_local_bounds(offset, buf.len(), state.local_store.len() as u32)?;
        let start = offset as usize;
        buf.copy_from_slice(&state.local_store[start..start + buf.len()]);
        Ok(())
    }

    fn write_local(&self, offset: u32, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        check_local_bounds(offset, data.len(), state.local_store.len() as u32)?;
        let start = offset as usize;
        state.local_store[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_dma_control(&self) -> u64 {
        let state = self.state.lock().unwrap();
        if state.dma_stalled {
            0
        } else if state.dma_control & DMA_PURGE_REQUEST != 0 {
            DMA_PURGE_COMPLETE
        } else {
            state.dma_control
        }
    }

    fn write_dma_control(&self, value: u64) -> Result<()> {
        self.state.lock().unwrap().dma_control = value;
        Ok(())
    }

    fn revoke_mappings(&self) {
        // The model has no host mappings to tear down.
    }

    fn pending_condition(&self) -> Option<PendingCondition> {
        self.state.lock().unwrap().pending
    }

    fn clear_pending_condition(&self) {
        self.state.lock().unwrap().pending = None;
    }

    fn restore_image(&self, image: &SavedImage) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if image.local_store.len() != state.local_store.len() {
            return Err(CoprunError::ResourceFault(format!(
                "saved image size {:#x} does not match local store size {:#x}",
                image.local_store.len(),
                state.local_store.len()
            )));
        }
        state.local_store.copy_from_slice(&image.local_store);
        state.pc = image.pc;
        state.status = image.status.raw();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_runs_to_its_stop_code() {
        let sim = SimCoprocessor::new(0, 0x1000);
        sim.load_program(0, &[isa::nop(), isa::stop(5)]).unwrap();
        sim.write_run_control(RunControl::RUNNABLE).unwrap();

        let status = sim.read_status();
        assert!(status.stopped_by_stop());
        assert_eq!(status.stop_code(), 5);
        // The pointer slot after the stop is skipped by the host, not by us.
        assert_eq!(sim.read_pc(), 8);
    }

    #[test]
    fn halt_sets_the_halt_bit() {
        let sim = SimCoprocessor::new(0, 0x1000);
        sim.load_program(0, &[isa::halt()]).unwrap();
        sim.write_run_control(RunControl::RUNNABLE).unwrap();
        assert!(sim.read_status().stopped_by_halt());
    }

    #[test]
    fn single_step_executes_one_instruction_per_arming() {
        let sim = SimCoprocessor::new(0, 0x1000);
        sim.load_program(0, &[isa::nop(), isa::nop(), isa::halt()])
            .unwrap();
        sim.write_priv_mode(PrivMode::SingleStep).unwrap();

        sim.write_run_control(RunControl::RUNNABLE).unwrap();
        assert!(sim.read_status().single_stepped());
        assert_eq!(sim.read_pc(), 4);

        sim.write_run_control(RunControl::RUNNABLE).unwrap();
        assert_eq!(sim.read_pc(), 8);

        // The halt takes effect even under single-step.
        sim.write_run_control(RunControl::RUNNABLE).unwrap();
        assert!(sim.read_status().stopped_by_halt());
    }

    #[test]
    fn fetch_past_local_store_raises_a_data_fault() {
        let sim = SimCoprocessor::new(0, 0x10);
        sim.load_program(0, &[isa::nop(), isa::nop(), isa::nop(), isa::nop()])
            .unwrap();
        sim.write_run_control(RunControl::RUNNABLE).unwrap();
        assert!(matches!(
            sim.pending_condition(),
            Some(PendingCondition::DataFault { addr: 0x10 })
        ));
        assert!(!sim.read_status().running());
    }

    #[test]
    fn refused_isolated_load_reports_load_status() {
        let sim = SimCoprocessor::new(0, 0x1000);
        sim.set_loader_mode(SimLoaderMode::Refuse);
        sim.write_run_control(RunControl::RUNNABLE | RunControl::ISOLATE)
            .unwrap();
        let status = sim.read_status();
        assert!(!status.running());
        assert!(status.isolated_state());
        assert!(status.isolated_load_status());
    }

    #[test]
    fn accepted_isolated_load_runs_the_program_isolated() {
        let sim = SimCoprocessor::new(0, 0x1000);
        sim.load_program(0, &[isa::halt()]).unwrap();
        sim.write_run_control(RunControl::RUNNABLE | RunControl::ISOLATE)
            .unwrap();
        assert!(sim.read_status().running());
        assert!(sim.read_status().isolated_state());

        // Re-arming after the load runs the program under isolation.
        sim.write_run_control(RunControl::RUNNABLE | RunControl::ISOLATE)
            .unwrap();
        let status = sim.read_status();
        assert!(status.stopped_by_halt());
        assert!(status.isolated_state());
    }
}
