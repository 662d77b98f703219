//! Explicit coprocessor ownership table.
//!
//! Which context owns which physical unit is tracked here, never in ambient
//! globals. Acquisition blocks (cancellably) until a unit is free; release
//! and preemption snapshot the device state into the context so a later bind,
//! possibly to a different unit, resumes exactly where the context stopped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use uuid::Uuid;

use crate::config::types::{CoprunError, Result};
use crate::hw::resource::{CoprocessorOps, ResourceId, SavedImage};
use crate::hw::status::RunControl;
use crate::sched::context::Context;
use crate::sched::wait::{block_on, CancelToken};

#[derive(Default)]
struct TableInner {
    resources: HashMap<ResourceId, Arc<dyn CoprocessorOps>>,
    free: Vec<ResourceId>,
    bound: HashMap<ResourceId, Uuid>,
}

/// Ownership table with atomic acquire/release.
#[derive(Default)]
pub struct OwnershipTable {
    inner: Mutex<TableInner>,
}

impl OwnershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a physical unit. Handles live for the table's lifetime.
    pub fn register(&self, res: Arc<dyn CoprocessorOps>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let id = res.id();
        if inner.resources.contains_key(&id) {
            return Err(CoprunError::Config(format!(
                "coprocessor {id} already registered"
            )));
        }
        inner.resources.insert(id, res);
        inner.free.push(id);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().resources.is_empty()
    }

    /// Bind `ctx` to a free unit, blocking indefinitely until one is
    /// available. The wait is a cancellation point. Saved device state from a
    /// previous binding is restored into the new unit before returning.
    pub fn acquire(
        &self,
        ctx: &Context,
        token: &CancelToken,
        interval: Duration,
    ) -> Result<Arc<dyn CoprocessorOps>> {
        if self.is_empty() {
            return Err(CoprunError::ResourceUnavailable(
                "no coprocessors registered".to_string(),
            ));
        }

        let res = block_on(token, interval, || self.try_take(ctx.id()))
            .ok_or(CoprunError::Interrupted)?;

        if let Some(image) = ctx.take_saved_image() {
            if let Err(e) = res.restore_image(&image) {
                // Undo the reservation so the unit is not leaked.
                self.put_back(res.id());
                return Err(e);
            }
        }
        ctx.bind(Arc::clone(&res));
        debug!("context {} bound to coprocessor {}", ctx.id(), res.id());
        Ok(res)
    }

    fn try_take(&self, owner: Uuid) -> Option<Arc<dyn CoprocessorOps>> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.free.pop()?;
        inner.bound.insert(id, owner);
        Some(Arc::clone(&inner.resources[&id]))
    }

    fn put_back(&self, id: ResourceId) {
        let mut inner = self.inner.lock().unwrap();
        inner.bound.remove(&id);
        inner.free.push(id);
    }

    /// Release `ctx`'s binding, snapshotting device state (local store, pc,
    /// status) into the context for a later rebind. No-op when unbound.
    pub fn release(&self, ctx: &Context) {
        let Some(res) = ctx.take_binding() else {
            return;
        };
        match snapshot(res.as_ref()) {
            Ok(image) => ctx.save_image(image),
            Err(e) => warn!(
                "failed to snapshot coprocessor {} on release: {e}",
                res.id()
            ),
        }
        self.put_back(res.id());
        debug!("context {} released coprocessor {}", ctx.id(), res.id());
    }

    /// External-scheduler preemption: stop the unit, snapshot its state into
    /// the owning context, mark the binding revoked and return the unit to
    /// the free pool. Returns false when the context holds no binding.
    ///
    /// The run loop detects the revocation at its next wakeup and goes
    /// through reacquisition; preemption is detected, not excluded.
    pub fn preempt(&self, ctx: &Context) -> bool {
        let Some(res) = ctx.take_binding() else {
            return false;
        };
        if let Err(e) = res.write_run_control(RunControl::empty()) {
            warn!("preempt: failed to stop coprocessor {}: {e}", res.id());
        }
        match snapshot(res.as_ref()) {
            Ok(image) => ctx.save_image(image),
            Err(e) => warn!(
                "preempt: failed to snapshot coprocessor {}: {e}",
                res.id()
            ),
        }
        ctx.mark_binding_revoked();
        self.put_back(res.id());
        debug!("context {} preempted off coprocessor {}", ctx.id(), res.id());
        true
    }
}

fn snapshot(res: &dyn CoprocessorOps) -> Result<SavedImage> {
    let mut local_store = vec![0u8; res.local_store_size() as usize];
    res.read_local(0, &mut local_store)?;
    Ok(SavedImage {
        local_store,
        pc: res.read_pc(),
        status: res.read_status(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::context::ContextFlags;
    use crate::testing::MockCoprocessor;
    use std::thread;

    fn table_with_unit(id: ResourceId) -> (OwnershipTable, Arc<MockCoprocessor>) {
        let table = OwnershipTable::new();
        let unit = Arc::new(MockCoprocessor::new(id, 0x1000));
        table.register(Arc::clone(&unit) as Arc<dyn CoprocessorOps>).unwrap();
        (table, unit)
    }

    #[test]
    fn acquire_without_registered_units_fails_fast() {
        let table = OwnershipTable::new();
        let ctx = Context::new(ContextFlags::default());
        let err = table
            .acquire(&ctx, &CancelToken::new(), Duration::from_millis(1))
            .err()
            .unwrap();
        assert!(matches!(err, CoprunError::ResourceUnavailable(_)));
    }

    #[test]
    fn second_acquire_blocks_until_release() {
        let (table, _unit) = table_with_unit(0);
        let table = Arc::new(table);
        let first = Context::new(ContextFlags::default());
        let second = Context::new(ContextFlags::default());

        table
            .acquire(&first, &CancelToken::new(), Duration::from_millis(1))
            .unwrap();

        let waiter = {
            let table = Arc::clone(&table);
            let second = Arc::clone(&second);
            thread::spawn(move || {
                table
                    .acquire(&second, &CancelToken::new(), Duration::from_millis(1))
                    .map(|res| res.id())
            })
        };

        thread::sleep(Duration::from_millis(20));
        table.release(&first);
        assert_eq!(waiter.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn acquire_wait_is_cancellable() {
        let (table, _unit) = table_with_unit(0);
        let first = Context::new(ContextFlags::default());
        table
            .acquire(&first, &CancelToken::new(), Duration::from_millis(1))
            .unwrap();

        let token = CancelToken::new();
        token.cancel();
        let second = Context::new(ContextFlags::default());
        let err = table
            .acquire(&second, &token, Duration::from_millis(1))
            .err()
            .unwrap();
        assert!(matches!(err, CoprunError::Interrupted));
    }

    #[test]
    fn preempt_stops_unit_and_marks_revocation() {
        let (table, unit) = table_with_unit(3);
        let ctx = Context::new(ContextFlags::default());
        table
            .acquire(&ctx, &CancelToken::new(), Duration::from_millis(1))
            .unwrap();
        unit.set_pc(0x40);

        assert!(table.preempt(&ctx));
        assert!(ctx.binding_revoked());
        assert_eq!(ctx.pc(), 0x40);
        assert_eq!(unit.last_run_control(), Some(RunControl::empty()));
        // Unit is free again for someone else.
        let other = Context::new(ContextFlags::default());
        assert!(table
            .acquire(&other, &CancelToken::new(), Duration::from_millis(1))
            .is_ok());
    }

    #[test]
    fn rebind_restores_saved_local_store_and_pc() {
        let (table, unit) = table_with_unit(0);
        let ctx = Context::new(ContextFlags::default());
        let res = table
            .acquire(&ctx, &CancelToken::new(), Duration::from_millis(1))
            .unwrap();
        res.write_local(0x10, &[0xAA, 0xBB]).unwrap();
        unit.set_pc(0x104);
        table.release(&ctx);

        // Scribble over the unit to prove the image is what comes back.
        unit.write_local(0x10, &[0, 0]).unwrap();
        unit.set_pc(0);

        let res = table
            .acquire(&ctx, &CancelToken::new(), Duration::from_millis(1))
            .unwrap();
        let mut buf = [0u8; 2];
        res.read_local(0x10, &mut buf).unwrap();
        assert_eq!(buf, [0xAA, 0xBB]);
        assert_eq!(res.read_pc(), 0x104);
    }
}
