//! Cancellation plumbing for blocking suspension points.
//!
//! Every place the run loop may suspend (run-lock acquisition, resource
//! acquisition, the stop wait) polls a predicate under a shared
//! [`CancelToken`], so cancellation is observed within one poll interval and
//! never mid-mutation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::types::{CoprunError, Result};
use crate::hw::status::StopStatus;

/// Cooperative cancellation handle shared between the host thread inside
/// `run()` and whoever controls it.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Error-typed check for use with `?` inside the engine.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CoprunError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Result of the long stop wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Stopped(StopStatus),
    Cancelled,
}

/// Poll `predicate` at `interval` until it yields a value or the token is
/// cancelled. The predicate is consulted before the first sleep, so an
/// already-satisfied wait never suspends.
pub fn block_on<T>(
    token: &CancelToken,
    interval: Duration,
    mut predicate: impl FnMut() -> Option<T>,
) -> Option<T> {
    loop {
        if let Some(value) = predicate() {
            return Some(value);
        }
        if token.is_cancelled() {
            return None;
        }
        std::thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn block_on_returns_value_without_sleeping_when_ready() {
        let token = CancelToken::new();
        let got = block_on(&token, Duration::from_secs(60), || Some(7));
        assert_eq!(got, Some(7));
    }

    #[test]
    fn block_on_observes_cancellation() {
        let token = CancelToken::new();
        token.cancel();
        let got: Option<()> = block_on(&token, Duration::from_millis(1), || None);
        assert_eq!(got, None);
    }

    #[test]
    fn block_on_polls_until_predicate_fires() {
        let token = CancelToken::new();
        let calls = AtomicU32::new(0);
        let got = block_on(&token, Duration::from_millis(1), || {
            if calls.fetch_add(1, Ordering::SeqCst) >= 3 {
                Some(())
            } else {
                None
            }
        });
        assert_eq!(got, Some(()));
    }
}
