// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Small synchronization helpers shared by the directory, persistence
//! contexts and controllers.

use std::future::Future;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::warn;

/// Lock a std mutex, recovering the guard if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run `future` on the current runtime without waiting for it.
pub(crate) fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => warn!("No async runtime available; background task dropped"),
    }
}

/// Tracks the remaining budget of an operation-wide timeout.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutHelper {
    original: Duration,
    deadline: Option<Instant>,
}

impl TimeoutHelper {
    pub fn new(timeout: Duration) -> Self {
        Self {
            original: timeout,
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub fn original(&self) -> Duration {
        self.original
    }

    /// Time left before the deadline; zero once it has passed.
    pub fn remaining(&self) -> Duration {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

/// A manual-reset event that can be awaited or blocked on.
///
/// Once set it stays set until [`AsyncWaitHandle::reset`]; waiters that lose a
/// race between their timeout and the signal still observe the signal.
#[derive(Debug, Default)]
pub struct AsyncWaitHandle {
    signaled: Mutex<bool>,
    condvar: Condvar,
    notify: Notify,
}

impl AsyncWaitHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *lock(&self.signaled) = true;
        self.condvar.notify_all();
        self.notify.notify_waiters();
    }

    pub fn reset(&self) {
        *lock(&self.signaled) = false;
    }

    pub fn is_set(&self) -> bool {
        *lock(&self.signaled)
    }

    /// Wait asynchronously; returns `false` if the timeout elapsed first.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_set() {
                return true;
            }

            tokio::select! {
                _ = &mut notified => continue,
                _ = &mut sleep => return self.is_set(),
            }
        }
    }

    /// Block the current thread; returns `false` if the timeout elapsed first.
    pub fn wait_blocking(&self, timeout: Duration) -> bool {
        let helper = TimeoutHelper::new(timeout);
        let mut signaled = lock(&self.signaled);
        while !*signaled {
            let remaining = helper.remaining();
            if remaining.is_zero() {
                return false;
            }
            let (guard, _) = self
                .condvar
                .wait_timeout(signaled, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            signaled = guard;
        }
        true
    }
}
