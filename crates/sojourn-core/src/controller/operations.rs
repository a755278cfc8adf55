// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control operations: run, suspend, unsuspend, terminate, cancel, abandon,
//! update, key association and bookmark resumption.
//!
//! Each public operation takes the execution lock, validates the state,
//! attaches the caller's transaction, acts on the engine and flushes
//! tracking. The `*_locked` cores assume the lock is held so that the
//! unhandled exception policy can run them from the engine's turn.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::locking::LockGuard;
use super::transaction::ControllerEnlistment;
use super::{ControllerState, InstanceController, InstanceState};
use crate::config::UnhandledExceptionAction;
use crate::engine::TrackingRecord;
use crate::error::{CoreError, Result};
use crate::model::{Bookmark, BookmarkResumptionResult, InstanceKey};
use crate::sync::{AsyncWaitHandle, TimeoutHelper, lock};
use crate::transaction::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ControlOperation {
    Run,
    Suspend,
    Unsuspend,
    Terminate,
    Cancel,
    Update,
}

impl ControlOperation {
    fn name(self) -> &'static str {
        match self {
            ControlOperation::Run => "run",
            ControlOperation::Suspend => "suspend",
            ControlOperation::Unsuspend => "unsuspend",
            ControlOperation::Terminate => "terminate",
            ControlOperation::Cancel => "cancel",
            ControlOperation::Update => "update",
        }
    }

    fn allowed_while_suspended(self) -> bool {
        matches!(
            self,
            ControlOperation::Suspend
                | ControlOperation::Unsuspend
                | ControlOperation::Terminate
                | ControlOperation::Cancel
        )
    }
}

impl InstanceController {
    // -----------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------

    fn validate(
        &self,
        state: &ControllerState,
        operation: ControlOperation,
        transaction: Option<&Transaction>,
    ) -> Result<()> {
        if let Some(attached) = state.transaction
            && Some(attached) != transaction.map(Transaction::id)
        {
            return Err(CoreError::TransactedLock {
                instance_id: self.instance_id,
                operation: operation.name(),
            });
        }
        match state.state {
            InstanceState::Unloaded => Err(CoreError::InstanceUnloaded {
                instance_id: self.instance_id,
            }),
            InstanceState::Completed | InstanceState::Aborted => Err(CoreError::InstanceNotFound {
                instance_id: Some(self.instance_id),
            }),
            InstanceState::Suspended if !operation.allowed_while_suspended() => {
                Err(CoreError::InstanceSuspended {
                    instance_id: self.instance_id,
                    operation: operation.name(),
                })
            }
            _ => Ok(()),
        }
    }

    pub(super) fn throw_if_aborted(&self, state: &ControllerState) -> Result<()> {
        if state.state == InstanceState::Aborted {
            return Err(CoreError::InstanceAborted {
                instance_id: self.instance_id,
                reason: state.abort_reason.clone().unwrap_or_default(),
            });
        }
        Ok(())
    }

    fn throw_if_terminated_or_completed(&self, state: &ControllerState) -> Result<()> {
        if !state.has_raised_completed {
            return Ok(());
        }
        Err(match &state.termination_reason {
            Some(reason) => CoreError::InstanceTerminated {
                instance_id: self.instance_id,
                reason: reason.clone(),
            },
            None => CoreError::InstanceCompleted {
                instance_id: self.instance_id,
            },
        })
    }

    pub(super) fn throw_if_unloaded(&self, state: &ControllerState) -> Result<()> {
        if state.state == InstanceState::Unloaded {
            return Err(CoreError::InstanceUnloaded {
                instance_id: self.instance_id,
            });
        }
        Ok(())
    }

    fn throw_if_suspended(&self, state: &ControllerState, operation: &'static str) -> Result<()> {
        if state.state == InstanceState::Suspended {
            return Err(CoreError::InstanceSuspended {
                instance_id: self.instance_id,
                operation,
            });
        }
        Ok(())
    }

    pub(super) fn ensure_not_torn_down(&self) -> Result<()> {
        let state = lock(&self.state);
        self.throw_if_aborted(&state)?;
        self.throw_if_unloaded(&state)
    }

    /// `Ok(false)` means the operation is a no-op in the current state.
    pub(super) fn validate_for(&self, operation: ControlOperation, transaction: Option<&Transaction>) -> Result<bool> {
        let state = lock(&self.state);
        match operation {
            ControlOperation::Run => {
                let running = state.state == InstanceState::Active && state.is_runnable;
                if state.has_raised_completed || running || state.transaction.is_some() {
                    return Ok(false);
                }
                self.validate(&state, operation, transaction)?;
                self.throw_if_aborted(&state)?;
                self.throw_if_unloaded(&state)?;
                self.throw_if_suspended(&state, operation.name())?;
            }
            ControlOperation::Unsuspend => {
                if state.state == InstanceState::Active {
                    return Ok(false);
                }
                self.validate(&state, operation, transaction)?;
                self.throw_if_aborted(&state)?;
                self.throw_if_terminated_or_completed(&state)?;
                self.throw_if_unloaded(&state)?;
            }
            ControlOperation::Cancel => {
                if state.has_raised_completed {
                    return Ok(false);
                }
                self.validate(&state, operation, transaction)?;
                self.throw_if_aborted(&state)?;
                self.throw_if_unloaded(&state)?;
            }
            ControlOperation::Suspend | ControlOperation::Terminate | ControlOperation::Update => {
                self.validate(&state, operation, transaction)?;
                self.throw_if_aborted(&state)?;
                self.throw_if_terminated_or_completed(&state)?;
                self.throw_if_unloaded(&state)?;
            }
        }
        Ok(true)
    }

    /// Bind the instance to `transaction` until it resolves.
    fn attach_transaction(&self, transaction: Option<&Transaction>) -> Result<()> {
        let Some(transaction) = transaction else {
            return Ok(());
        };
        {
            let mut state = lock(&self.state);
            if state.transaction.is_some() {
                return Ok(());
            }
            state.transaction = Some(transaction.id());
            state.is_runnable = false;
        }

        let enlistment = Arc::new(ControllerEnlistment::new(self.self_ref.clone()));
        if let Err(err) = transaction.enlist_volatile(enlistment) {
            lock(&self.state).transaction = None;
            return Err(err.into());
        }
        debug!(instance_id = %self.instance_id, transaction = %transaction.id(), "Transaction attached");
        Ok(())
    }

    async fn flush_unless_aborted(&self) -> Result<()> {
        if self.state() == InstanceState::Aborted {
            return Ok(());
        }
        self.flush_tracking().await
    }

    fn clear_suspended_context(&self) {
        if let Some(context) = self.context()
            && context.is_suspended()
        {
            context.set_suspended(false, None);
        }
    }

    // -----------------------------------------------------------------
    // Run
    // -----------------------------------------------------------------

    /// Make the instance runnable; the engine starts once the lock is released.
    #[instrument(skip(self, transaction), fields(instance_id = %self.instance_id))]
    pub async fn run(&self, transaction: Option<&Transaction>, timeout: Duration) -> Result<()> {
        let _guard = self.acquire_lock(timeout, false, false).await?;
        if !self.validate_for(ControlOperation::Run, transaction)? {
            return Ok(());
        }
        self.attach_transaction(transaction)?;
        {
            let mut state = lock(&self.state);
            if state.transaction.is_none() {
                state.is_runnable = true;
                state.state = InstanceState::Active;
            }
        }
        self.flush_unless_aborted().await
    }

    // -----------------------------------------------------------------
    // Suspend / Unsuspend
    // -----------------------------------------------------------------

    /// Suspend at the next persistable point. Suspending a suspended
    /// instance updates the reason.
    #[instrument(skip(self, transaction), fields(instance_id = %self.instance_id))]
    pub async fn suspend(&self, reason: &str, transaction: Option<&Transaction>, timeout: Duration) -> Result<()> {
        let helper = TimeoutHelper::new(timeout);
        {
            let mut guard = self.acquire_lock(helper.remaining(), false, false).await?;
            self.suspend_locked(&mut guard, reason, transaction, helper.remaining())
                .await?;
        }
        self.complete_pending_operations();
        Ok(())
    }

    async fn suspend_locked(
        &self,
        guard: &mut LockGuard<'_>,
        reason: &str,
        transaction: Option<&Transaction>,
        timeout: Duration,
    ) -> Result<()> {
        if !self.validate_for(ControlOperation::Suspend, transaction)? {
            return Ok(());
        }
        self.attach_transaction(transaction)?;
        self.wait_for_can_persist(guard, timeout).await?;

        if let Some(context) = self.context() {
            context.set_suspended(true, Some(reason.to_string()));
        }
        lock(&self.state).state = InstanceState::Suspended;
        self.engine.track(TrackingRecord::Suspended {
            reason: reason.to_string(),
        });
        // A suspend from inside the engine's turn must stop the engine too.
        self.engine.request_pause();
        info!(instance_id = %self.instance_id, %reason, "Instance suspended");

        self.flush_unless_aborted().await
    }

    #[instrument(skip(self, transaction), fields(instance_id = %self.instance_id))]
    pub async fn unsuspend(&self, transaction: Option<&Transaction>, timeout: Duration) -> Result<()> {
        let _guard = self.acquire_lock(timeout, false, false).await?;
        if !self.validate_for(ControlOperation::Unsuspend, transaction)? {
            return Ok(());
        }
        self.attach_transaction(transaction)?;
        {
            let mut state = lock(&self.state);
            if state.transaction.is_none() {
                state.is_runnable = true;
            }
            state.state = InstanceState::Active;
        }
        self.clear_suspended_context();
        self.engine.track(TrackingRecord::Unsuspended);
        info!(instance_id = %self.instance_id, "Instance unsuspended");

        self.flush_unless_aborted().await
    }

    // -----------------------------------------------------------------
    // Terminate / Cancel
    // -----------------------------------------------------------------

    /// Terminate the workflow. Completion is raised once the engine has run
    /// the termination; under a transaction, after the commit.
    #[instrument(skip(self, transaction), fields(instance_id = %self.instance_id))]
    pub async fn terminate(&self, reason: &str, transaction: Option<&Transaction>, timeout: Duration) -> Result<()> {
        {
            let _guard = self.acquire_lock(timeout, false, false).await?;
            self.terminate_locked(reason, transaction).await?;
        }
        self.complete_pending_operations();
        Ok(())
    }

    async fn terminate_locked(&self, reason: &str, transaction: Option<&Transaction>) -> Result<()> {
        if !self.validate_for(ControlOperation::Terminate, transaction)? {
            return Ok(());
        }
        self.attach_transaction(transaction)?;

        self.engine.terminate(reason);
        self.clear_suspended_context();
        {
            let mut state = lock(&self.state);
            state.termination_reason = Some(reason.to_string());
            if state.transaction.is_none() {
                state.is_runnable = true;
                state.state = InstanceState::Active;
            }
        }
        self.engine.track(TrackingRecord::Terminated {
            reason: reason.to_string(),
        });
        info!(instance_id = %self.instance_id, %reason, "Instance terminated");

        self.flush_unless_aborted().await
    }

    #[instrument(skip(self, transaction), fields(instance_id = %self.instance_id))]
    pub async fn cancel(&self, transaction: Option<&Transaction>, timeout: Duration) -> Result<()> {
        {
            let _guard = self.acquire_lock(timeout, false, false).await?;
            self.cancel_locked(transaction).await?;
        }
        self.complete_pending_operations();
        Ok(())
    }

    async fn cancel_locked(&self, transaction: Option<&Transaction>) -> Result<()> {
        if !self.validate_for(ControlOperation::Cancel, transaction)? {
            return Ok(());
        }
        self.attach_transaction(transaction)?;

        self.engine.schedule_cancel();
        self.clear_suspended_context();
        {
            let mut state = lock(&self.state);
            if state.transaction.is_none() {
                state.is_runnable = true;
                state.state = InstanceState::Active;
            } else {
                state.transacted_cancel = true;
            }
        }
        self.engine.track(TrackingRecord::Canceled);
        info!(instance_id = %self.instance_id, "Instance cancellation scheduled");

        self.flush_unless_aborted().await
    }

    // -----------------------------------------------------------------
    // Abandon
    // -----------------------------------------------------------------

    /// Unlock the durable record without saving and abort the instance.
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn abandon(&self, reason: &str, timeout: Duration) -> Result<()> {
        self.abandon_core(reason, true, timeout).await
    }

    /// Abandon from the unload policy. Without tracking, an instance that
    /// made progress since its last idle persist is left alone.
    pub(super) async fn abandon_core(&self, reason: &str, should_track: bool, timeout: Duration) -> Result<()> {
        let helper = TimeoutHelper::new(timeout);
        let _guard = self.acquire_lock(helper.remaining(), false, false).await?;
        self.abandon_locked(reason, should_track, helper.remaining()).await
    }

    async fn abandon_locked(&self, reason: &str, should_track: bool, timeout: Duration) -> Result<()> {
        let has_data_to_persist = {
            let state = lock(&self.state);
            if state.state == InstanceState::Aborted {
                return Ok(());
            }
            state.has_data_to_persist
        };
        if !should_track && has_data_to_persist {
            debug!(instance_id = %self.instance_id, "Instance has unsaved progress, keeping it loaded");
            self.recover_last_reference();
            return Ok(());
        }

        if let Some(context) = self.context()
            && let Err(err) = context.release(None, timeout).await
        {
            self.abort_core(reason, should_track);
            return Err(err);
        }
        if !should_track {
            self.engine.track(TrackingRecord::Unloaded);
        }
        self.abort_core(reason, should_track);
        Ok(())
    }

    /// Mark the durable record suspended, unlock it and abort the instance.
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn abandon_and_suspend(&self, reason: &str, timeout: Duration) -> Result<()> {
        let _guard = self.acquire_lock(timeout, false, false).await?;
        self.abandon_and_suspend_locked(reason).await
    }

    async fn abandon_and_suspend_locked(&self, reason: &str) -> Result<()> {
        if self.state() == InstanceState::Aborted {
            return Ok(());
        }
        let result = match self.context() {
            Some(context) => {
                context
                    .update_suspend_metadata(reason, self.services.settings.persist_timeout)
                    .await
            }
            None => Ok(()),
        };
        if result.is_ok() {
            self.engine.track(TrackingRecord::Suspended {
                reason: reason.to_string(),
            });
        }
        self.abort_core(reason, true);
        result
    }

    // -----------------------------------------------------------------
    // Update / keys
    // -----------------------------------------------------------------

    /// Apply a definition update map through the engine.
    #[instrument(skip(self, update_map, transaction), fields(instance_id = %self.instance_id))]
    pub async fn update(
        &self,
        update_map: &Value,
        transaction: Option<&Transaction>,
        timeout: Duration,
    ) -> Result<()> {
        let _guard = self.acquire_lock(timeout, false, false).await?;
        if !self.validate_for(ControlOperation::Update, transaction)? {
            return Ok(());
        }
        self.attach_transaction(transaction)?;
        self.engine
            .apply_update(update_map)
            .map_err(|reason| CoreError::UpdateFailed {
                instance_id: self.instance_id,
                reason,
            })?;
        info!(instance_id = %self.instance_id, "Instance updated");
        self.flush_unless_aborted().await
    }

    /// Associate correlation keys through the persistence context.
    #[instrument(skip(self, keys, transaction), fields(instance_id = %self.instance_id, count = keys.len()))]
    pub async fn associate_keys(
        &self,
        keys: Vec<InstanceKey>,
        transaction: Option<&Transaction>,
        timeout: Duration,
    ) -> Result<()> {
        let helper = TimeoutHelper::new(timeout);
        let _guard = self.acquire_lock(helper.remaining(), false, false).await?;
        {
            let state = lock(&self.state);
            self.throw_if_suspended(&state, "associate keys")?;
        }
        let context = self.context_or_gone()?;
        context
            .associate_keys(keys, transaction, helper.remaining())
            .await
    }

    // -----------------------------------------------------------------
    // Bookmarks
    // -----------------------------------------------------------------

    fn bookmarks_invalid(&self) -> Option<BookmarkResumptionResult> {
        let state = lock(&self.state);
        if state.has_raised_completed {
            Some(BookmarkResumptionResult::NotFound)
        } else if matches!(
            state.state,
            InstanceState::Unloaded | InstanceState::Aborted | InstanceState::Suspended
        ) {
            Some(BookmarkResumptionResult::NotReady)
        } else {
            None
        }
    }

    /// Resume `bookmark` with `value` once the instance is idle.
    #[instrument(skip(self, value), fields(instance_id = %self.instance_id, bookmark = %bookmark))]
    pub async fn resume_bookmark(
        &self,
        bookmark: &Bookmark,
        value: Value,
        timeout: Duration,
    ) -> Result<BookmarkResumptionResult> {
        let helper = TimeoutHelper::new(timeout);
        if !self.try_acquire_reference(helper.remaining()).await? {
            return Err(CoreError::InstanceUnloaded {
                instance_id: self.instance_id,
            });
        }
        let result = self.resume_bookmark_core(bookmark, value, &helper).await;
        self.release_reference();
        result
    }

    async fn resume_bookmark_core(
        &self,
        bookmark: &Bookmark,
        value: Value,
        helper: &TimeoutHelper,
    ) -> Result<BookmarkResumptionResult> {
        if !self.ready.wait(helper.remaining()).await {
            return Err(CoreError::timeout("wait for instance ready", helper.original()));
        }
        let mut guard = self.acquire_lock_on_idle(helper.remaining()).await?;

        loop {
            if let Some(result) = self.bookmarks_invalid() {
                return Ok(result);
            }
            let result = self.engine.schedule_bookmark_resumption(bookmark, value.clone());
            if result != BookmarkResumptionResult::NotReady || self.services.buffered_receive.is_some() {
                debug!(?result, "Bookmark resumption scheduled");
                return Ok(result);
            }

            // Not reachable yet; try again after the next idle pause.
            let waiter = Arc::new(AsyncWaitHandle::new());
            lock(&self.state).next_idle_waiters.push(waiter.clone());
            guard.release();
            if !waiter.wait(helper.remaining()).await {
                let mut state = lock(&self.state);
                let queued = remove_waiter(&mut state.next_idle_waiters, &waiter) || {
                    match state.idle_waiters.iter().position(|w| Arc::ptr_eq(w, &waiter)) {
                        Some(position) => {
                            state.idle_waiters.remove(position);
                            true
                        }
                        None => false,
                    }
                };
                if queued {
                    return Err(CoreError::timeout("resume bookmark", helper.original()));
                }
            }
            guard.owned = true;
        }
    }

    // -----------------------------------------------------------------
    // Unhandled exceptions
    // -----------------------------------------------------------------

    /// Apply the configured [`UnhandledExceptionAction`] during the engine's turn.
    pub(crate) async fn on_unhandled_exception(&self, message: String) {
        let mut guard = match self.take_engine_lock() {
            Some(guard) => guard,
            None => match self
                .acquire_lock(self.services.settings.lock_timeout, false, true)
                .await
            {
                Ok(guard) => guard,
                Err(err) => {
                    warn!(instance_id = %self.instance_id, error = %err, "Could not take the lock for an unhandled exception");
                    self.abort_instance(message, false);
                    return;
                }
            },
        };

        let action = self.services.settings.unhandled_exception_action;
        warn!(instance_id = %self.instance_id, %message, action = action.as_str(), "Unhandled exception in workflow");
        self.engine.track(TrackingRecord::UnhandledException {
            message: message.clone(),
        });
        if let Err(err) = self.flush_tracking().await {
            warn!(instance_id = %self.instance_id, error = %err, "Failed to flush tracking records");
        }
        self.fault_pending_requests(CoreError::UnhandledException {
            instance_id: self.instance_id,
            message: message.clone(),
        });

        let result = match action {
            UnhandledExceptionAction::Cancel => self.cancel_locked(None).await,
            UnhandledExceptionAction::Terminate => self.terminate_locked(&message, None).await,
            UnhandledExceptionAction::AbandonAndSuspend if self.can_persist => {
                lock(&self.state).is_runnable = false;
                self.abandon_and_suspend_locked(&message).await
            }
            UnhandledExceptionAction::AbandonAndSuspend | UnhandledExceptionAction::Abandon => {
                lock(&self.state).is_runnable = false;
                let timeout = self.services.settings.persist_timeout;
                self.abandon_locked(&message, true, timeout).await
            }
        };
        if let Err(err) = result {
            warn!(instance_id = %self.instance_id, error = %err, "Unhandled exception policy failed");
            self.abort_core(&message, true);
        }
        if matches!(
            action,
            UnhandledExceptionAction::Cancel | UnhandledExceptionAction::Terminate
        ) {
            guard.release();
            self.complete_pending_operations();
        }
    }
}

fn remove_waiter(waiters: &mut Vec<Arc<AsyncWaitHandle>>, waiter: &Arc<AsyncWaitHandle>) -> bool {
    match waiters.iter().position(|w| Arc::ptr_eq(w, waiter)) {
        Some(position) => {
            waiters.remove(position);
            true
        }
        None => false,
    }
}
