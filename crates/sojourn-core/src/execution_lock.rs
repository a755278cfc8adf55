// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hand-off mutex serializing operations on one instance.
//!
//! Unlike a plain mutex, [`ExecutionLock::exit`] passes ownership straight
//! to the next waiter, and can keep the lock when nobody waits so that an
//! instance with runnable work keeps executing.
//!
//! Every contended acquisition is bracketed by [`ExecutionLock::setup_waiter`]
//! and, when it gives up, [`ExecutionLock::cleanup_waiter`]:
//!
//! ```ignore
//! let waiter = lock.setup_waiter(false);
//! lock.enter_async(&waiter, timeout).await?;
//! // ... critical section ...
//! lock.exit(false);
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::error::{CoreError, Result};
use crate::sync::{AsyncWaitHandle, lock};

/// What [`ExecutionLock::exit`] did with the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Nobody waited; the lock is free.
    Released,
    /// The first waiter now owns the lock.
    HandedOff,
    /// Nobody waited and the caller asked to keep it; the caller still owns the lock.
    Kept,
}

/// Queue position of one acquisition attempt.
#[derive(Debug, Default)]
pub struct LockWaiter {
    signal: AsyncWaitHandle,
}

#[derive(Debug, Default)]
struct LockState {
    owned: bool,
    waiters: VecDeque<Arc<LockWaiter>>,
}

#[derive(Debug, Default)]
pub struct ExecutionLock {
    state: Mutex<LockState>,
}

impl ExecutionLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self) -> bool {
        lock(&self.state).owned
    }

    pub fn waiter_count(&self) -> usize {
        lock(&self.state).waiters.len()
    }

    pub fn try_enter(&self) -> bool {
        let mut state = lock(&self.state);
        if state.owned {
            false
        } else {
            state.owned = true;
            true
        }
    }

    /// Queue a waiter. Abort-priority waiters go to the front.
    pub fn setup_waiter(&self, abort_priority: bool) -> Arc<LockWaiter> {
        let waiter = Arc::new(LockWaiter::default());
        let mut state = lock(&self.state);
        if abort_priority {
            state.waiters.push_front(waiter.clone());
        } else {
            state.waiters.push_back(waiter.clone());
        }
        waiter
    }

    /// Remove a waiter that gave up. Returns `false` if it had already been
    /// handed the lock, in which case the caller owns it.
    pub fn cleanup_waiter(&self, waiter: &Arc<LockWaiter>) -> bool {
        let mut state = lock(&self.state);
        match state.waiters.iter().position(|w| Arc::ptr_eq(w, waiter)) {
            Some(position) => {
                state.waiters.remove(position);
                true
            }
            None => false,
        }
    }

    /// Take the lock immediately if it is free, dequeuing `waiter`.
    fn enter_if_free(&self, waiter: &Arc<LockWaiter>) -> bool {
        let mut state = lock(&self.state);
        if state.owned {
            return false;
        }
        state.owned = true;
        if let Some(position) = state.waiters.iter().position(|w| Arc::ptr_eq(w, waiter)) {
            state.waiters.remove(position);
        }
        true
    }

    /// Block the current thread until `waiter` owns the lock.
    pub fn enter(&self, waiter: &Arc<LockWaiter>, timeout: Duration) -> Result<()> {
        if self.enter_if_free(waiter) {
            return Ok(());
        }
        if waiter.signal.wait_blocking(timeout) || !self.cleanup_waiter(waiter) {
            return Ok(());
        }
        Err(CoreError::timeout("acquire execution lock", timeout))
    }

    /// Wait asynchronously until `waiter` owns the lock.
    ///
    /// Dropping the future before it completes gives the waiter up; a lock
    /// handed to it in the meantime is passed on.
    pub async fn enter_async(&self, waiter: &Arc<LockWaiter>, timeout: Duration) -> Result<()> {
        if self.enter_if_free(waiter) {
            return Ok(());
        }

        let mut pending = PendingWaiter {
            lock: self,
            waiter,
            armed: true,
        };
        let signaled = waiter.signal.wait(timeout).await;
        pending.armed = false;

        if signaled || !self.cleanup_waiter(waiter) {
            return Ok(());
        }
        debug!(?timeout, "Timed out waiting for execution lock");
        Err(CoreError::timeout("acquire execution lock", timeout))
    }

    /// Give up the lock.
    ///
    /// The first queued waiter is handed the lock. Without waiters the lock
    /// is kept when `keep_if_no_waiters` is set and released otherwise.
    pub fn exit(&self, keep_if_no_waiters: bool) -> ExitOutcome {
        let mut state = lock(&self.state);
        if let Some(next) = state.waiters.pop_front() {
            next.signal.set();
            ExitOutcome::HandedOff
        } else if keep_if_no_waiters {
            ExitOutcome::Kept
        } else {
            state.owned = false;
            ExitOutcome::Released
        }
    }
}

struct PendingWaiter<'a> {
    lock: &'a ExecutionLock,
    waiter: &'a Arc<LockWaiter>,
    armed: bool,
}

impl Drop for PendingWaiter<'_> {
    fn drop(&mut self) {
        if self.armed && !self.lock.cleanup_waiter(self.waiter) {
            self.lock.exit(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_enter_and_release() {
        let lock = ExecutionLock::new();
        assert!(lock.try_enter());
        assert!(!lock.try_enter());
        assert_eq!(lock.exit(false), ExitOutcome::Released);
        assert!(lock.try_enter());
    }

    #[test]
    fn test_keep_without_waiters() {
        let lock = ExecutionLock::new();
        assert!(lock.try_enter());
        assert_eq!(lock.exit(true), ExitOutcome::Kept);
        assert!(lock.is_locked());
        assert!(!lock.try_enter());
    }

    #[test]
    fn test_enter_times_out_and_dequeues() {
        let lock = ExecutionLock::new();
        assert!(lock.try_enter());

        let waiter = lock.setup_waiter(false);
        let err = lock.enter(&waiter, Duration::from_millis(20)).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(lock.waiter_count(), 0);
        assert_eq!(lock.exit(false), ExitOutcome::Released);
    }

    #[test]
    fn test_free_lock_is_taken_by_waiter() {
        let lock = ExecutionLock::new();
        let waiter = lock.setup_waiter(false);
        lock.enter(&waiter, Duration::ZERO).unwrap();
        assert!(lock.is_locked());
        assert_eq!(lock.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_abort_priority_waiter_goes_first() {
        let lock = ExecutionLock::new();
        assert!(lock.try_enter());

        let normal = lock.setup_waiter(false);
        let abort = lock.setup_waiter(true);

        assert_eq!(lock.exit(false), ExitOutcome::HandedOff);
        lock.enter_async(&abort, Duration::from_secs(1)).await.unwrap();
        assert!(!normal.signal.is_set());

        assert_eq!(lock.exit(false), ExitOutcome::HandedOff);
        lock.enter_async(&normal, Duration::from_secs(1)).await.unwrap();
        assert_eq!(lock.exit(false), ExitOutcome::Released);
    }

    #[tokio::test]
    async fn test_dropped_waiter_passes_lock_on() {
        let lock = Arc::new(ExecutionLock::new());
        assert!(lock.try_enter());

        let first = lock.setup_waiter(false);
        let second = lock.setup_waiter(false);
        {
            let attempt = lock.enter_async(&first, Duration::from_secs(5));
            tokio::pin!(attempt);
            assert!(futures_poll_once(attempt.as_mut()).await.is_none());
            assert_eq!(lock.exit(false), ExitOutcome::HandedOff);
        }

        lock.enter_async(&second, Duration::from_secs(1)).await.unwrap();
        assert!(lock.is_locked());
        assert_eq!(lock.waiter_count(), 0);
    }

    async fn futures_poll_once<F: std::future::Future + Unpin>(fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            out = fut => Some(out),
            _ = std::future::ready(()) => None,
        }
    }
}
