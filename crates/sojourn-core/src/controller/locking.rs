// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution lock protocol of the controller.
//!
//! Contended acquisitions ask the engine to pause. Releasing the lock either
//! resumes the engine, hands the lock to an idle waiter, or passes it to the
//! next queued operation. While the engine runs, it owns the lock; the paused
//! notification takes it back.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use super::{ControllerState, InstanceController, InstanceState};
use crate::engine::{EngineState, TrackingRecord};
use crate::error::{CoreError, Result};
use crate::execution_lock::ExitOutcome;
use crate::sync::{AsyncWaitHandle, TimeoutHelper, lock};

/// Ownership of an instance's execution lock. Dropping it releases the lock
/// through [`InstanceController::release_lock`].
pub(crate) struct LockGuard<'a> {
    controller: &'a InstanceController,
    pub(super) owned: bool,
    pub(super) persisted_by_idle: bool,
}

impl<'a> LockGuard<'a> {
    fn owned(controller: &'a InstanceController) -> Self {
        Self {
            controller,
            owned: true,
            persisted_by_idle: false,
        }
    }

    /// Release now; the guard can be re-armed by a later acquisition.
    pub(super) fn release(&mut self) {
        self.controller
            .release_lock(&mut self.owned, self.persisted_by_idle);
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Operation waiting for the engine to become persistable.
#[derive(Debug, Default)]
pub(crate) struct CanPersistWaiter {
    event: AsyncWaitHandle,
    owns_lock: AtomicBool,
}

impl CanPersistWaiter {
    pub(super) fn signal(&self, owns_lock: bool) {
        self.owns_lock.store(owns_lock, Ordering::SeqCst);
        self.event.set();
    }
}

/// Counts a contended acquisition until it gets the lock or gives up.
struct ActiveOperation<'a>(&'a InstanceController);

impl Drop for ActiveOperation<'_> {
    fn drop(&mut self) {
        let mut state = lock(&self.0.state);
        state.active_operations = state.active_operations.saturating_sub(1);
    }
}

impl InstanceController {
    pub(crate) async fn acquire_lock(
        &self,
        timeout: Duration,
        abort_priority: bool,
        skip_pause: bool,
    ) -> Result<LockGuard<'_>> {
        self.enter_lock(timeout, abort_priority, skip_pause).await?;
        Ok(LockGuard::owned(self))
    }

    async fn enter_lock(&self, timeout: Duration, abort_priority: bool, skip_pause: bool) -> Result<()> {
        if self.executor.try_enter() {
            return Ok(());
        }

        let waiter = {
            let mut state = lock(&self.state);
            state.active_operations += 1;
            self.executor.setup_waiter(abort_priority)
        };
        let _active = ActiveOperation(self);
        if !skip_pause {
            self.engine.request_pause();
        }
        self.executor.enter_async(&waiter, timeout).await
    }

    pub(super) fn release_lock(&self, owned: &mut bool, persisted_by_idle: bool) {
        if !*owned {
            return;
        }
        *owned = false;
        self.ready.set();

        let idle = self.engine.state() == EngineState::Idle;
        let (resume, released) = {
            let mut state = lock(&self.state);
            state.has_data_to_persist = !persisted_by_idle;

            let runnable = state.state == InstanceState::Active && state.is_runnable && !idle;
            if runnable && state.active_operations == 0 {
                state.engine_running = true;
                (true, false)
            } else if (idle || state.state != InstanceState::Active)
                && Self::notify_next_idle_waiter(&mut state)
            {
                (false, false)
            } else {
                match self.executor.exit(runnable) {
                    ExitOutcome::Kept => {
                        // The waiter we saw timed out; nobody else will run the engine.
                        state.engine_running = true;
                        (true, false)
                    }
                    ExitOutcome::HandedOff => (false, false),
                    ExitOutcome::Released => (false, true),
                }
            }
        };

        if resume {
            self.resume_engine();
        } else if released {
            self.start_unload_policy_if_necessary();
        }
    }

    fn resume_engine(&self) {
        debug!(instance_id = %self.instance_id, "Resuming engine");
        if self.engine.state() == EngineState::Complete {
            if let Some(controller) = self.self_ref.upgrade() {
                crate::sync::spawn_detached(async move { controller.on_notify_paused().await });
            }
        } else {
            self.engine.run();
        }
    }

    fn notify_next_idle_waiter(state: &mut ControllerState) -> bool {
        // Nothing goes idle again once the instance leaves Active.
        if state.state != InstanceState::Active {
            Self::prepare_next_idle_waiters(state);
        }
        match state.idle_waiters.pop_front() {
            Some(waiter) => {
                waiter.set();
                true
            }
            None => false,
        }
    }

    pub(super) fn prepare_next_idle_waiters(state: &mut ControllerState) {
        let next = std::mem::take(&mut state.next_idle_waiters);
        state.idle_waiters.extend(next);
    }

    /// Take the lock once the engine is idle, running a fresh instance first.
    pub(super) async fn acquire_lock_on_idle(&self, timeout: Duration) -> Result<LockGuard<'_>> {
        let helper = TimeoutHelper::new(timeout);
        let mut guard = self.acquire_lock(helper.remaining(), false, false).await?;

        let waiter = {
            let mut state = lock(&self.state);
            if state.state == InstanceState::Active && !state.is_runnable && state.transaction.is_none() {
                state.is_runnable = true;
            }
            if state.state == InstanceState::Active && self.engine.state() == EngineState::Runnable {
                let waiter = Arc::new(AsyncWaitHandle::new());
                state.idle_waiters.push_back(waiter.clone());
                Some(waiter)
            } else {
                None
            }
        };
        let Some(waiter) = waiter else {
            return Ok(guard);
        };

        guard.release();
        if !waiter.wait(helper.remaining()).await {
            let mut state = lock(&self.state);
            if let Some(position) = state.idle_waiters.iter().position(|w| Arc::ptr_eq(w, &waiter)) {
                state.idle_waiters.remove(position);
                return Err(CoreError::timeout("acquire lock on idle", helper.original()));
            }
        }
        guard.owned = true;
        Ok(guard)
    }

    /// Park until the engine reaches a persistable point.
    ///
    /// Returns holding the lock. An idle engine is waited on through a
    /// can-persist waiter; otherwise the lock is cycled so the engine can run.
    pub(super) async fn wait_for_can_persist(&self, guard: &mut LockGuard<'_>, timeout: Duration) -> Result<()> {
        let helper = TimeoutHelper::new(timeout);
        loop {
            self.ensure_not_torn_down()?;
            if self.engine.is_persistable() {
                return Ok(());
            }
            self.engine.pause_when_persistable();

            let waiter = if self.engine.state() == EngineState::Idle {
                let waiter = Arc::new(CanPersistWaiter::default());
                lock(&self.state).can_persist_waiters.push(waiter.clone());
                Some(waiter)
            } else {
                None
            };
            guard.release();

            let handed_lock = match waiter {
                Some(waiter) => {
                    if !waiter.event.wait(helper.remaining()).await {
                        let mut state = lock(&self.state);
                        if let Some(position) = state
                            .can_persist_waiters
                            .iter()
                            .position(|w| Arc::ptr_eq(w, &waiter))
                        {
                            state.can_persist_waiters.remove(position);
                            return Err(CoreError::timeout("wait for persistable", helper.original()));
                        }
                    }
                    waiter.owns_lock.load(Ordering::SeqCst)
                }
                None => {
                    tokio::task::yield_now().await;
                    false
                }
            };

            if !handed_lock {
                self.enter_lock(helper.remaining(), false, true).await?;
            }
            guard.owned = true;
        }
    }

    fn notify_can_persist_waiters(&self, guard: &mut LockGuard<'_>) {
        if !self.engine.is_persistable() {
            return;
        }
        let mut state = lock(&self.state);
        for waiter in state.can_persist_waiters.drain(..) {
            let hand_off = std::mem::replace(&mut guard.owned, false);
            waiter.signal(hand_off);
        }
    }

    pub(super) fn take_engine_lock(&self) -> Option<LockGuard<'_>> {
        let mut state = lock(&self.state);
        if std::mem::take(&mut state.engine_running) {
            Some(LockGuard::owned(self))
        } else {
            None
        }
    }

    /// The engine stopped running.
    ///
    /// This is where an instance leaves "running": completion is raised, an
    /// engine-side abort is applied, or idle handling wakes buffered
    /// receives and persist waiters.
    pub(crate) async fn on_notify_paused(&self) {
        let mut guard = match self.take_engine_lock() {
            Some(guard) => guard,
            None => {
                let timeout = self.services.settings.lock_timeout;
                match self.acquire_lock(timeout, false, true).await {
                    Ok(guard) => guard,
                    Err(err) => {
                        warn!(instance_id = %self.instance_id, error = %err, "Could not take the lock after an engine pause");
                        return;
                    }
                }
            }
        };

        if let Err(err) = self.handle_paused(&mut guard).await {
            warn!(instance_id = %self.instance_id, error = %err, "Handling an engine pause failed");
            self.abort_core(&err.to_string(), true);
        }
    }

    async fn handle_paused(&self, guard: &mut LockGuard<'_>) -> Result<()> {
        let engine_state = self.engine.state();
        let (raise_complete, raise_idle) = {
            let mut state = lock(&self.state);
            let raise_complete = engine_state == EngineState::Complete && !state.has_raised_completed;
            let raise_idle = engine_state == EngineState::Idle
                && !state.has_raised_completed
                && state.state != InstanceState::Aborted;
            if raise_complete || raise_idle {
                Self::prepare_next_idle_waiters(&mut state);
            }
            if raise_complete {
                state.has_raised_completed = true;
                state.state = InstanceState::Completed;
            }
            (raise_complete, raise_idle)
        };

        if raise_complete {
            self.record_completion();
            self.engine.track(TrackingRecord::Completed);
            self.flush_tracking().await?;
            self.on_completed();
        } else if engine_state == EngineState::Aborted {
            self.abort_core("workflow engine aborted", true);
        } else if raise_idle {
            debug!(instance_id = %self.instance_id, "Instance idle");
            self.engine.track(TrackingRecord::Idle);
            self.flush_tracking().await?;
            if let Some(manager) = &self.services.buffered_receive {
                let keys = self.context().map(|c| c.keys()).unwrap_or_default();
                manager.retry(&keys, &self.engine.bookmarks());
            }
            self.notify_can_persist_waiters(guard);
        } else {
            self.notify_can_persist_waiters(guard);
        }
        Ok(())
    }
}
