//! Top-level execution engine.
//!
//! `Engine::run` drives one execution request through the full state machine:
//! serialize against other runs on the same context, bind a coprocessor,
//! initialize (bootstrapping isolated mode when asked), wait for stops,
//! classify them into syscall relay / exception relay / reacquisition /
//! completion, and finalize with a pc/status pair from which re-invocation is
//! always correct.

use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{bounded, select, tick, Sender};
use log::{debug, warn};
use nix::errno::Errno;
use uuid::Uuid;

use crate::config::types::{CoprunError, EngineConfig, Result, RunOutcome};
use crate::exec::bootstrap::{setup_isolated, IsolatedBoot, LoaderImage};
use crate::exec::fault::{FaultHandler, LoggingFaultHandler, NativeTrapSink, TrapSink};
use crate::exec::relay::{
    check_relay_pointer, complete_relay, HostSyscalls, NativeSyscalls, RelayBlock, RelayPhase,
    SyscallOutcome, RELAY_BLOCK_SIZE, RELAY_RESULT_OFFSET,
};
use crate::hw::resource::{CoprocessorOps, PendingCondition};
use crate::hw::status::{
    PrivMode, RunControl, StopStatus, STOP_CODE_DEBUG_TRAP, STOP_CODE_HOST_CALL,
};
use crate::observability::trace::{EngineMetrics, TraceEvent, TraceEventKind, TraceSink};
use crate::sched::context::Context;
use crate::sched::ownership::OwnershipTable;
use crate::sched::wait::{block_on, CancelToken, WaitOutcome};

/// How a completed relay round trip left the run.
enum Relayed {
    /// Result written, unit re-armed; keep waiting for the next stop.
    Rearmed,
    /// Restart-class result: the unit is re-armed but the caller must be
    /// told to re-run.
    Interrupted,
}

/// Execution engine multiplexing registered coprocessors across contexts.
pub struct Engine {
    config: EngineConfig,
    table: OwnershipTable,
    syscalls: Arc<dyn HostSyscalls>,
    faults: Arc<dyn FaultHandler>,
    trap_sink: Arc<dyn TrapSink>,
    loader: OnceLock<LoaderImage>,
    trace: Option<Arc<dyn TraceSink>>,
    metrics: EngineMetrics,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            table: OwnershipTable::new(),
            syscalls: Arc::new(NativeSyscalls),
            faults: Arc::new(LoggingFaultHandler),
            trap_sink: Arc::new(NativeTrapSink),
            loader: OnceLock::new(),
            trace: None,
            metrics: EngineMetrics::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a physical unit with the ownership table.
    pub fn add_coprocessor(&self, res: Arc<dyn CoprocessorOps>) -> Result<()> {
        self.table.register(res)
    }

    pub fn set_host_syscalls(&mut self, syscalls: Arc<dyn HostSyscalls>) {
        self.syscalls = syscalls;
    }

    pub fn set_fault_handler(&mut self, faults: Arc<dyn FaultHandler>) {
        self.faults = faults;
    }

    pub fn set_trap_sink(&mut self, sink: Arc<dyn TrapSink>) {
        self.trap_sink = sink;
    }

    pub fn set_trace_sink(&mut self, sink: Arc<dyn TraceSink>) {
        self.trace = Some(sink);
    }

    /// Register the trusted loader image. Isolated-mode runs fail
    /// `Unsupported` until this has been called; it may be called once.
    pub fn register_isolated_loader(&self, image: LoaderImage) -> Result<()> {
        self.loader
            .set(image)
            .map_err(|_| CoprunError::Config("isolated loader already registered".to_string()))
    }

    pub fn isolated_loader(&self) -> Option<&LoaderImage> {
        self.loader.get()
    }

    /// The ownership table, exposed for external schedulers (preemption).
    pub fn ownership(&self) -> &OwnershipTable {
        &self.table
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Execute one request on `ctx`, starting (or resuming) at `entry`.
    ///
    /// Runs synchronously on the calling thread. Every suspension point
    /// observes `token`; cancellation surfaces as `RunOutcome::Interrupted`
    /// with the context left consistent for a retry from the recorded pc.
    pub fn run(
        &self,
        ctx: &Arc<Context>,
        entry: u32,
        token: &CancelToken,
    ) -> Result<RunOutcome> {
        let interval = self.config.wait_poll_interval;

        // Serialize against concurrent run() calls on the same context. The
        // guard is dropped last, after finalization below.
        let _run_guard = ctx.lock_run(token, interval)?;

        let run_id = Uuid::new_v4();
        self.bump(&self.metrics.runs_started);
        self.trace(run_id, ctx, TraceEventKind::RunStarted { entry });

        ctx.reset_event_return();
        let mut res = self.acquire(ctx, run_id, token)?;
        ctx.set_pc(entry);

        let tick_timer = TickTimer::arm(Arc::clone(ctx), self.config.tick_interval);

        // A run interrupted mid-relay leaves the unit stopped at its request;
        // arming it would clobber the stop. Classification below picks the
        // pending relay up directly.
        let pending_relay = {
            let status = res.read_status();
            !status.running()
                && status.stopped_by_stop()
                && status.stop_code() == STOP_CODE_HOST_CALL
        };
        if pending_relay {
            debug!(
                "context {}: resuming with a relay stop pending, skipping arm",
                ctx.id()
            );
        } else if let Err(e) = self.run_init(ctx, res.as_ref(), entry) {
            tick_timer.stop();
            self.table.release(ctx);
            self.trace(
                run_id,
                ctx,
                TraceEventKind::Finalized {
                    interrupted: false,
                    raw_status: None,
                    pc: entry,
                },
            );
            return Err(e);
        }
        self.trace(
            run_id,
            ctx,
            TraceEventKind::Initialized {
                isolated: ctx.flags().isolated,
            },
        );

        let mut interrupted = false;
        let mut fault: Option<CoprunError> = None;

        loop {
            // The sole long-duration suspension of the state machine.
            let status = match self.wait_for_stop(ctx, &res, token) {
                WaitOutcome::Cancelled => {
                    // Exit immediately; the binding is deliberately kept so a
                    // retry resumes without rebinding.
                    interrupted = true;
                    break;
                }
                WaitOutcome::Stopped(status) => status,
            };
            let stop_pc = if ctx.binding_revoked() {
                ctx.pc()
            } else {
                res.read_pc()
            };
            self.trace(
                run_id,
                ctx,
                TraceEventKind::Stopped {
                    raw_status: status.raw(),
                    pc: stop_pc,
                },
            );

            // Stop-and-signal carrying the host-call code: relay it.
            if !ctx.binding_revoked()
                && status.stopped_by_stop()
                && status.stop_code() == STOP_CODE_HOST_CALL
            {
                self.bump(&self.metrics.relays);
                match self.process_host_call(ctx, run_id, &mut res, token) {
                    Ok(Relayed::Rearmed) => {
                        self.trace(
                            run_id,
                            ctx,
                            TraceEventKind::RelayCompleted { interrupted: false },
                        );
                        continue;
                    }
                    Ok(Relayed::Interrupted) => {
                        self.trace(
                            run_id,
                            ctx,
                            TraceEventKind::RelayCompleted { interrupted: true },
                        );
                        interrupted = true;
                        break;
                    }
                    Err(CoprunError::Interrupted) => {
                        interrupted = true;
                        break;
                    }
                    Err(e) => {
                        fault = Some(e);
                        break;
                    }
                }
            }

            // Fault-like or asynchronous pending condition: relay it out.
            if !ctx.binding_revoked() {
                if let Some(cond) = res.pending_condition() {
                    if let PendingCondition::AsyncError { events } = cond {
                        ctx.or_event_return(events);
                    }
                    self.bump(&self.metrics.exceptions_relayed);
                    self.trace(run_id, ctx, TraceEventKind::ExceptionRelayed);
                    let handled = self.faults.handle(ctx, &cond);
                    res.clear_pending_condition();
                    if handled.is_err() || token.is_cancelled() {
                        interrupted = true;
                        break;
                    }
                }
            }

            // The external scheduler took the unit away: rebind and resume.
            if ctx.binding_revoked() {
                self.bump(&self.metrics.reacquisitions);
                self.trace(run_id, ctx, TraceEventKind::ReacquireStarted);
                match self.reacquire(ctx, run_id, token) {
                    Ok(rebound) => {
                        res = rebound;
                        continue;
                    }
                    Err(e) => {
                        let prior_terminal = ctx.last_status().is_some_and(|st| {
                            st.is_terminal_stop()
                                && !(st.stopped_by_stop()
                                    && st.stop_code() == STOP_CODE_HOST_CALL)
                        });
                        if !prior_terminal {
                            debug!("reacquisition failed: {e}");
                            interrupted = true;
                        }
                        break;
                    }
                }
            }

            if token.is_cancelled() {
                interrupted = true;
                break;
            }

            // No classification branch diverted us and the unit is stopped:
            // this stop is terminal.
            if !status.running() {
                break;
            }
        }

        tick_timer.stop();
        let (final_status, final_pc) = self.run_fini(ctx);
        let events = ctx.event_return();

        // Debug-trap stop code: deliver a synchronous trap to the controlling
        // thread and report the run interrupted even though the stop would
        // otherwise be terminal.
        let debug_trap = final_status
            .is_some_and(|st| st.stopped_by_stop() && st.stop_code() == STOP_CODE_DEBUG_TRAP);

        let outcome = if debug_trap {
            self.trap_sink.deliver_trap();
            Ok(RunOutcome::Interrupted {
                npc: final_pc,
                events,
            })
        } else if let Some(e) = fault {
            Err(e)
        } else if !interrupted {
            Ok(RunOutcome::Stopped {
                status: final_status.unwrap_or_else(|| StopStatus::from_raw(0)),
                npc: final_pc,
                events,
            })
        } else {
            // Cancelled, but if the unit already reached a reportable
            // terminal stop the caller gets that stop, not Interrupted.
            let reportable = final_status.is_some_and(|st| {
                st.stopped_by_halt()
                    || st.single_stepped()
                    || (st.stopped_by_stop() && st.stop_code() != STOP_CODE_HOST_CALL)
            });
            match (reportable, final_status) {
                (true, Some(status)) => Ok(RunOutcome::Stopped {
                    status,
                    npc: final_pc,
                    events,
                }),
                _ => Ok(RunOutcome::Interrupted {
                    npc: final_pc,
                    events,
                }),
            }
        };

        match &outcome {
            Ok(RunOutcome::Stopped { .. }) => {
                self.bump(&self.metrics.runs_completed);
                self.table.release(ctx);
            }
            Ok(RunOutcome::Interrupted { .. }) => {
                self.bump(&self.metrics.runs_interrupted);
            }
            Err(_) => {
                self.table.release(ctx);
            }
        }

        self.trace(
            run_id,
            ctx,
            TraceEventKind::Finalized {
                interrupted: matches!(&outcome, Ok(RunOutcome::Interrupted { .. })),
                raw_status: final_status.map(|st| st.raw()),
                pc: final_pc,
            },
        );

        outcome
        // _run_guard drops here: the run lock is released last.
    }

    /// Bind a unit, reusing a binding an interrupted run left in place.
    fn acquire(
        &self,
        ctx: &Context,
        run_id: Uuid,
        token: &CancelToken,
    ) -> Result<Arc<dyn CoprocessorOps>> {
        if let Some(res) = ctx.bound_resource() {
            self.trace(
                run_id,
                ctx,
                TraceEventKind::ResourceBound { resource: res.id() },
            );
            return Ok(res);
        }
        let res = self
            .table
            .acquire(ctx, token, self.config.wait_poll_interval)?;
        self.trace(
            run_id,
            ctx,
            TraceEventKind::ResourceBound { resource: res.id() },
        );
        Ok(res)
    }

    fn run_init(&self, ctx: &Context, res: &dyn CoprocessorOps, entry: u32) -> Result<()> {
        if ctx.flags().isolated {
            let boot = if !res.read_status().isolated_state() {
                setup_isolated(res, self.loader.get(), &self.config)?
            } else {
                IsolatedBoot::Entered
            };
            // A denied or invalid load has already parked the unit in the
            // state the generic stop classification will report; only a
            // healthy isolated unit gets (re)armed here, preserving an
            // isolated-exit request the caller may have parked in run
            // control.
            if boot == IsolatedBoot::Entered {
                let mut ctl =
                    res.read_run_control() & (RunControl::RUNNABLE | RunControl::ISOLATE);
                if ctl.is_empty() {
                    ctl = RunControl::RUNNABLE;
                }
                res.write_run_control(ctl)?;
            }
        } else {
            let mode = if ctx.flags().single_step {
                PrivMode::SingleStep
            } else {
                PrivMode::Normal
            };
            res.write_priv_mode(mode)?;
            res.write_pc(entry)?;
            res.write_run_control(RunControl::RUNNABLE)?;
        }
        Ok(())
    }

    fn wait_for_stop(
        &self,
        ctx: &Context,
        res: &Arc<dyn CoprocessorOps>,
        token: &CancelToken,
    ) -> WaitOutcome {
        let outcome = block_on(token, self.config.wait_poll_interval, || {
            if ctx.binding_revoked() {
                return Some(
                    ctx.last_status()
                        .unwrap_or_else(|| StopStatus::from_raw(0)),
                );
            }
            let status = res.read_status();
            if !status.running() || res.pending_condition().is_some() {
                Some(status)
            } else {
                None
            }
        });
        match outcome {
            Some(status) => WaitOutcome::Stopped(status),
            None => WaitOutcome::Cancelled,
        }
    }

    /// One relay round trip; see the relay module for the wire protocol.
    fn process_host_call(
        &self,
        ctx: &Arc<Context>,
        run_id: Uuid,
        res: &mut Arc<dyn CoprocessorOps>,
        token: &CancelToken,
    ) -> Result<Relayed> {
        let pc = res.read_pc() & !3;

        let mut word = [0u8; 4];
        res.read_local(pc, &mut word)?;
        let ls_pointer = u32::from_le_bytes(word);

        if let Err(e) = check_relay_pointer(ls_pointer, res.local_store_size()) {
            // Bounds violations are surfaced through the exception relay and
            // then unwind the whole run.
            let _ = self
                .faults
                .handle(ctx, &PendingCondition::DataFault { addr: ls_pointer });
            return Err(e);
        }

        let mut raw = [0u8; RELAY_BLOCK_SIZE as usize];
        res.read_local(ls_pointer, &mut raw)?;
        let block = RelayBlock::parse(&raw);
        self.trace(run_id, ctx, TraceEventKind::RelayStarted { nr: block.nr });

        let resume_pc = pc.wrapping_add(4);

        let outcome = if self.syscalls.is_supported(block.nr) {
            // Run the host syscall without pinning the unit.
            self.table.release(ctx);
            let phase = RelayPhase::AwaitingHostResult { saved_pc: resume_pc };
            let outcome = self.syscalls.dispatch(&block);
            match self
                .table
                .acquire(ctx, token, self.config.wait_poll_interval)
            {
                Ok(rebound) => *res = rebound,
                Err(e) => {
                    // The relay stays incomplete; the caller must not resume
                    // the coprocessor.
                    warn!("relay abandoned in {phase:?}: reacquisition failed: {e}");
                    return Err(CoprunError::Interrupted);
                }
            }
            outcome
        } else {
            SyscallOutcome::Done(-(Errno::ENOSYS as i32 as i64))
        };

        let completion = complete_relay(outcome, resume_pc);
        if let Some(value) = completion.write_back {
            res.write_local(ls_pointer + RELAY_RESULT_OFFSET, &value.to_le_bytes())?;
        }
        res.write_pc(completion.npc)?;
        res.write_run_control(RunControl::RUNNABLE)?;

        Ok(if completion.interrupted {
            Relayed::Interrupted
        } else {
            Relayed::Rearmed
        })
    }

    /// Give the old unit back (recording final state) and bind a fresh one,
    /// re-running initialization at the recorded pc.
    fn reacquire(
        &self,
        ctx: &Arc<Context>,
        run_id: Uuid,
        token: &CancelToken,
    ) -> Result<Arc<dyn CoprocessorOps>> {
        self.table.release(ctx);
        let res = self.acquire(ctx, run_id, token)?;
        self.run_init(ctx, res.as_ref(), ctx.pc())?;
        Ok(res)
    }

    /// Capture the pc/status pair every exit path must leave behind.
    fn run_fini(&self, ctx: &Context) -> (Option<StopStatus>, u32) {
        if !ctx.binding_revoked() {
            if let Some(res) = ctx.bound_resource() {
                let status = res.read_status();
                let pc = res.read_pc();
                ctx.record_exit(Some(status), pc);
                return (Some(status), pc);
            }
        }
        (ctx.last_status(), ctx.pc())
    }

    fn bump(&self, counter: &std::sync::atomic::AtomicU64) {
        counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    fn trace(&self, run_id: Uuid, ctx: &Context, kind: TraceEventKind) {
        if let Some(sink) = &self.trace {
            sink.record(TraceEvent {
                run_id,
                context_id: ctx.id(),
                at: Utc::now(),
                kind,
            });
        }
    }
}

/// Periodic scheduler tick armed for the duration of one run.
struct TickTimer {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl TickTimer {
    fn arm(ctx: Arc<Context>, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = bounded(1);
        ctx.set_tick_active(true);
        let handle = std::thread::spawn(move || {
            let ticker = tick(interval);
            loop {
                select! {
                    recv(ticker) -> _ => ctx.note_tick(),
                    recv(stop_rx) -> _ => break,
                }
            }
            ctx.set_tick_active(false);
        });
        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::status::{stop_status_raw, StatusBits};
    use crate::sched::context::ContextFlags;
    use crate::testing::{MockCoprocessor, RecordingTrapSink};
    use std::time::Duration;

    fn quick_engine() -> Engine {
        Engine::new(EngineConfig {
            wait_poll_interval: Duration::from_millis(1),
            tick_interval: Duration::from_millis(5),
            ..EngineConfig::default()
        })
    }

    #[test]
    fn run_without_registered_units_is_resource_unavailable() {
        let engine = quick_engine();
        let ctx = Context::new(ContextFlags::default());
        let err = engine
            .run(&ctx, 0, &CancelToken::new())
            .err()
            .unwrap();
        assert!(matches!(err, CoprunError::ResourceUnavailable(_)));
    }

    #[test]
    fn halt_stop_completes_and_releases_the_unit() {
        let engine = quick_engine();
        let unit = Arc::new(MockCoprocessor::new(0, 0x1000));
        unit.push_status_raw(StatusBits::STOPPED_BY_HALT.bits());
        engine.add_coprocessor(unit.clone()).unwrap();

        let ctx = Context::new(ContextFlags::default());
        let outcome = engine.run(&ctx, 0x80, &CancelToken::new()).unwrap();
        match outcome {
            RunOutcome::Stopped { status, .. } => assert!(status.stopped_by_halt()),
            other => panic!("unexpected outcome {other:?}"),
        }
        // Released at finalization, so a second context can bind.
        assert!(ctx.bound_resource().is_none());
        assert_eq!(engine.metrics().snapshot().runs_completed, 1);
        assert!(!ctx.tick_timer_active());
    }

    #[test]
    fn debug_trap_stop_code_forces_interrupted_and_delivers_trap() {
        let mut engine = quick_engine();
        let sink = Arc::new(RecordingTrapSink::new());
        engine.set_trap_sink(sink.clone());

        let unit = Arc::new(MockCoprocessor::new(0, 0x1000));
        unit.push_status_raw(stop_status_raw(STOP_CODE_DEBUG_TRAP));
        engine.add_coprocessor(unit).unwrap();

        let ctx = Context::new(ContextFlags::default());
        let outcome = engine.run(&ctx, 0, &CancelToken::new()).unwrap();
        assert!(outcome.is_interrupted());
        assert_eq!(sink.delivered(), 1);
    }

    #[test]
    fn failed_run_control_write_aborts_the_run() {
        let engine = quick_engine();
        let unit = Arc::new(MockCoprocessor::new(0, 0x1000));
        unit.fail_next_run_control();
        engine.add_coprocessor(unit).unwrap();

        let ctx = Context::new(ContextFlags::default());
        let err = engine.run(&ctx, 0, &CancelToken::new()).err().unwrap();
        assert!(matches!(err, CoprunError::ResourceFault(_)));
        // The unit went back to the pool despite the failure.
        assert!(ctx.bound_resource().is_none());
    }
}
