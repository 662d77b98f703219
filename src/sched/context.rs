//! Logical execution contexts.
//!
//! A `Context` is the host-visible representation of one task wanting to
//! execute on a coprocessor. It is created by the caller's context manager;
//! the run loop mutates it only while holding its run-serialization lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::config::types::{CoprunError, Result};
use crate::hw::resource::{CoprocessorOps, SavedImage};
use crate::hw::status::StopStatus;
use crate::sched::wait::CancelToken;

/// Mode flags fixed at context creation.
#[derive(Clone, Copy, Debug, Default)]
pub struct ContextFlags {
    /// Run trusted code under the isolated bootstrap before user code.
    pub isolated: bool,
    /// Execute one instruction per arming.
    pub single_step: bool,
}

#[derive(Default)]
struct CtxState {
    pc: u32,
    event_return: u32,
    last_status: Option<StopStatus>,
    binding: Option<Arc<dyn CoprocessorOps>>,
    saved_image: Option<SavedImage>,
}

/// One logical execution unit.
pub struct Context {
    id: Uuid,
    flags: ContextFlags,
    run_held: Mutex<bool>,
    run_cond: Condvar,
    state: Mutex<CtxState>,
    binding_revoked: AtomicBool,
    ticks: AtomicU64,
    tick_active: AtomicBool,
}

impl Context {
    pub fn new(flags: ContextFlags) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            flags,
            run_held: Mutex::new(false),
            run_cond: Condvar::new(),
            state: Mutex::new(CtxState::default()),
            binding_revoked: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            tick_active: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn flags(&self) -> ContextFlags {
        self.flags
    }

    /// Program counter recorded at the last well-defined exit point.
    pub fn pc(&self) -> u32 {
        self.state.lock().unwrap().pc
    }

    pub fn last_status(&self) -> Option<StopStatus> {
        self.state.lock().unwrap().last_status
    }

    /// Take the run-serialization lock; concurrent `run()` calls on the same
    /// context queue here. The wait itself is a cancellation point.
    pub fn lock_run(&self, token: &CancelToken, interval: Duration) -> Result<RunGuard<'_>> {
        let mut held = self.run_held.lock().unwrap();
        loop {
            if !*held {
                *held = true;
                return Ok(RunGuard { ctx: self });
            }
            if token.is_cancelled() {
                return Err(CoprunError::Interrupted);
            }
            let (guard, _) = self.run_cond.wait_timeout(held, interval).unwrap();
            held = guard;
        }
    }

    pub(crate) fn set_pc(&self, pc: u32) {
        self.state.lock().unwrap().pc = pc;
    }

    pub(crate) fn record_exit(&self, status: Option<StopStatus>, pc: u32) {
        let mut st = self.state.lock().unwrap();
        st.pc = pc;
        if status.is_some() {
            st.last_status = status;
        }
    }

    pub(crate) fn reset_event_return(&self) {
        self.state.lock().unwrap().event_return = 0;
    }

    pub(crate) fn or_event_return(&self, bits: u32) {
        self.state.lock().unwrap().event_return |= bits;
    }

    pub fn event_return(&self) -> u32 {
        self.state.lock().unwrap().event_return
    }

    pub(crate) fn bind(&self, res: Arc<dyn CoprocessorOps>) {
        let mut st = self.state.lock().unwrap();
        st.binding = Some(res);
        self.binding_revoked.store(false, Ordering::SeqCst);
    }

    pub(crate) fn take_binding(&self) -> Option<Arc<dyn CoprocessorOps>> {
        self.state.lock().unwrap().binding.take()
    }

    /// Current binding, if any. A relation, not ownership: the ownership
    /// table decides who holds the physical unit.
    pub fn bound_resource(&self) -> Option<Arc<dyn CoprocessorOps>> {
        self.state.lock().unwrap().binding.clone()
    }

    pub(crate) fn mark_binding_revoked(&self) {
        self.binding_revoked.store(true, Ordering::SeqCst);
    }

    pub fn binding_revoked(&self) -> bool {
        self.binding_revoked.load(Ordering::SeqCst)
    }

    pub(crate) fn save_image(&self, image: SavedImage) {
        let mut st = self.state.lock().unwrap();
        st.pc = image.pc;
        st.last_status = Some(image.status);
        st.saved_image = Some(image);
    }

    pub(crate) fn take_saved_image(&self) -> Option<SavedImage> {
        self.state.lock().unwrap().saved_image.take()
    }

    pub(crate) fn note_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Scheduler ticks observed across the context's lifetime.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub(crate) fn set_tick_active(&self, active: bool) {
        self.tick_active.store(active, Ordering::SeqCst);
    }

    pub fn tick_timer_active(&self) -> bool {
        self.tick_active.load(Ordering::SeqCst)
    }
}

/// RAII guard for the run-serialization lock.
pub struct RunGuard<'a> {
    ctx: &'a Context,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.ctx.run_held.lock().unwrap();
        *held = false;
        self.ctx.run_cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn run_lock_serializes_and_releases_on_drop() {
        let ctx = Context::new(ContextFlags::default());
        let token = CancelToken::new();
        let interval = Duration::from_millis(1);

        let guard = ctx.lock_run(&token, interval).unwrap();

        let contender = {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || {
                let token = CancelToken::new();
                ctx.lock_run(&token, Duration::from_millis(1)).map(|_| ())
            })
        };

        thread::sleep(Duration::from_millis(20));
        drop(guard);
        assert!(contender.join().unwrap().is_ok());
    }

    #[test]
    fn run_lock_wait_is_cancellable() {
        let ctx = Context::new(ContextFlags::default());
        let token = CancelToken::new();
        let _guard = ctx.lock_run(&token, Duration::from_millis(1)).unwrap();

        let cancelled = CancelToken::new();
        cancelled.cancel();
        let err = ctx
            .lock_run(&cancelled, Duration::from_millis(1))
            .err()
            .unwrap();
        assert!(matches!(err, CoprunError::Interrupted));
    }
}
