// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persist, unload and release of a loaded instance.
//!
//! Saves only happen at a persistable point of the engine. An unload of a
//! completed instance becomes a delete of its durable record.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::locking::LockGuard;
use super::{InstanceController, InstanceState};
use crate::directory::InstanceDirectory;
use crate::engine::{EngineState, TrackingRecord};
use crate::error::{CoreError, Result};
use crate::model::{CompletionState, InstanceData, SaveStatus, names};
use crate::persistence::{CommunicationState, PersistenceContext};
use crate::pipeline::PersistencePipeline;
use crate::sync::{TimeoutHelper, lock};
use crate::transaction::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PersistenceOperation {
    Save,
    Unload,
    Delete,
}

impl PersistenceOperation {
    fn save_status(self) -> SaveStatus {
        match self {
            PersistenceOperation::Save => SaveStatus::Locked,
            PersistenceOperation::Unload => SaveStatus::Unlocked,
            PersistenceOperation::Delete => SaveStatus::Completed,
        }
    }

    fn tracking_record(self) -> TrackingRecord {
        match self {
            PersistenceOperation::Save => TrackingRecord::Persisted,
            PersistenceOperation::Unload => TrackingRecord::Unloaded,
            PersistenceOperation::Delete => TrackingRecord::Deleted,
        }
    }
}

/// A save pipeline registered with the directory for as long as it runs.
struct PipelineRegistration {
    directory: Option<Arc<InstanceDirectory>>,
    pipeline: Arc<PersistencePipeline>,
}

impl Drop for PipelineRegistration {
    fn drop(&mut self) {
        if let Some(directory) = &self.directory {
            directory.unregister_pipeline(self.pipeline.id());
        }
    }
}

impl InstanceController {
    /// Save the instance and keep it loaded and locked.
    #[instrument(skip(self, transaction), fields(instance_id = %self.instance_id))]
    pub async fn persist(&self, transaction: Option<&Transaction>, timeout: Duration) -> Result<()> {
        self.unload_or_persist(PersistenceOperation::Save, transaction, false, timeout)
            .await?;
        Ok(())
    }

    /// Save the instance unlocked and drop it from memory. A completed
    /// instance is deleted instead.
    #[instrument(skip(self, transaction), fields(instance_id = %self.instance_id))]
    pub async fn unload(&self, transaction: Option<&Transaction>, timeout: Duration) -> Result<()> {
        let helper = TimeoutHelper::new(timeout);
        let unloaded = self
            .unload_or_persist(PersistenceOperation::Unload, transaction, false, helper.remaining())
            .await?;
        if unloaded {
            self.close_context(transaction, helper.remaining()).await?;
        }
        Ok(())
    }

    /// Idle-time save; gives up rather than wait for the engine.
    pub(crate) async fn try_persist(&self, timeout: Duration) -> Result<bool> {
        self.unload_or_persist(PersistenceOperation::Save, None, true, timeout)
            .await
    }

    /// Shared path of persist and unload.
    ///
    /// With `is_try` the operation gives up instead of waiting: when the
    /// engine is not persistable, when an unload target is busy, or when
    /// someone else still holds a reference. Returns whether it saved.
    pub(crate) async fn unload_or_persist(
        &self,
        operation: PersistenceOperation,
        transaction: Option<&Transaction>,
        is_try: bool,
        timeout: Duration,
    ) -> Result<bool> {
        let helper = TimeoutHelper::new(timeout);
        let mut guard = self.acquire_lock(helper.remaining(), false, false).await?;
        let result = self
            .unload_or_persist_locked(&mut guard, operation, transaction, is_try, &helper)
            .await;
        guard.persisted_by_idle =
            is_try && operation == PersistenceOperation::Save && matches!(result, Ok(true));
        result
    }

    async fn unload_or_persist_locked(
        &self,
        guard: &mut LockGuard<'_>,
        mut operation: PersistenceOperation,
        transaction: Option<&Transaction>,
        is_try: bool,
        helper: &TimeoutHelper,
    ) -> Result<bool> {
        if !self.validate_for_persistence(operation)? {
            return Ok(false);
        }
        if !self.engine.is_persistable() {
            if is_try {
                return Ok(false);
            }
            self.wait_for_can_persist(guard, helper.remaining()).await?;
            if !self.validate_for_persistence(operation)? {
                return Ok(false);
            }
        }

        let mut released_last = false;
        if operation == PersistenceOperation::Unload {
            let busy = self.state() != InstanceState::Suspended && self.engine.state() != EngineState::Idle;
            if busy && is_try {
                return Ok(false);
            }
            released_last = self.try_release_last_reference();
            if !released_last && is_try {
                return Ok(false);
            }
            if self.engine.state() == EngineState::Complete {
                operation = PersistenceOperation::Delete;
            }
        }

        let result = self.save_locked(operation, transaction, helper).await;
        if result.is_err() && released_last {
            self.recover_last_reference();
        }
        result.map(|()| true)
    }

    /// `Ok(false)` means there is nothing left to unload.
    fn validate_for_persistence(&self, operation: PersistenceOperation) -> Result<bool> {
        let state = lock(&self.state);
        if operation != PersistenceOperation::Save && state.state == InstanceState::Unloaded {
            return Ok(false);
        }
        self.throw_if_aborted(&state)?;
        match operation {
            PersistenceOperation::Save => {
                self.throw_if_unloaded(&state)?;
                if !self.can_persist {
                    return Err(CoreError::invalid_operation(format!(
                        "instance '{}' has no instance store to persist to",
                        self.instance_id
                    )));
                }
            }
            PersistenceOperation::Unload | PersistenceOperation::Delete => {
                if !self.can_persist && self.engine.state() != EngineState::Complete {
                    return Err(CoreError::invalid_operation(format!(
                        "instance '{}' cannot be unloaded without an instance store",
                        self.instance_id
                    )));
                }
            }
        }
        Ok(true)
    }

    async fn save_locked(
        &self,
        operation: PersistenceOperation,
        transaction: Option<&Transaction>,
        helper: &TimeoutHelper,
    ) -> Result<()> {
        let context = self.context_or_gone()?;
        context.open();

        self.engine.track(operation.tracking_record());
        self.flush_tracking().await?;

        let data = self.collect_instance_data(&context, operation);
        let status = operation.save_status();
        let registration = self.register_save_pipeline(&context)?;

        let completion_transaction_required = operation == PersistenceOperation::Delete
            && self
                .creation_context()
                .is_some_and(|creation| creation.completion_transaction_required);
        let pipeline_transaction_required = registration
            .as_ref()
            .is_some_and(|r| r.pipeline.is_save_transaction_required());
        let owned_transaction = (transaction.is_none()
            && (completion_transaction_required || pipeline_transaction_required))
            .then(Transaction::new);
        let save_transaction = transaction.or(owned_transaction.as_ref());

        let saved = match &registration {
            Some(registration) => {
                let data = registration.pipeline.collect(data);
                match context
                    .save(Some(data.clone()), status, save_transaction, helper.remaining())
                    .await
                {
                    Ok(()) => registration.pipeline.on_saved(&data).await,
                    Err(err) => Err(err),
                }
            }
            None => {
                context
                    .save(Some(data), status, save_transaction, helper.remaining())
                    .await
            }
        };

        if let Some(owned) = &owned_transaction {
            match &saved {
                Ok(()) => owned.commit()?,
                Err(_) => owned.rollback(),
            }
        }
        saved?;

        {
            let mut state = lock(&self.state);
            if status != SaveStatus::Locked {
                state.is_runnable = false;
            }
            state.has_persisted_deleted = operation == PersistenceOperation::Delete;
        }
        if operation != PersistenceOperation::Save {
            self.mark_unloaded();
        }
        debug!(instance_id = %self.instance_id, ?operation, "Instance saved");
        Ok(())
    }

    fn collect_instance_data(&self, context: &PersistenceContext, operation: PersistenceOperation) -> InstanceData {
        let bookmarks: Vec<Value> = self
            .engine
            .bookmarks()
            .into_iter()
            .map(|bookmark| Value::String(bookmark.name))
            .collect();
        let mut data = InstanceData::new()
            .with(names::BOOKMARKS, Value::Array(bookmarks))
            .with(names::LAST_UPDATE, Value::String(Utc::now().to_rfc3339()));

        if operation == PersistenceOperation::Delete {
            let status = match self.completion_state() {
                Some(CompletionState::Faulted { .. }) => "Faulted",
                Some(CompletionState::Canceled) => "Canceled",
                _ => "Closed",
            };
            context.set_instance_status(status);
            return data;
        }

        data.values.extend(self.engine.prepare_for_serialization().values);
        if let Some(creation) = self.creation_context() {
            match serde_json::to_value(&creation) {
                Ok(value) => data.insert(names::CREATION_CONTEXT, value),
                Err(err) => warn!(instance_id = %self.instance_id, error = %err, "Creation context not saved"),
            }
        }
        let status = if self.engine.state() == EngineState::Idle {
            "Idle"
        } else {
            "Executing"
        };
        context.set_instance_status(status);
        data
    }

    fn register_save_pipeline(&self, context: &PersistenceContext) -> Result<Option<PipelineRegistration>> {
        let modules = &self.services.persistence_modules;
        if modules.is_empty() {
            return Ok(None);
        }
        let pipeline = Arc::new(PersistencePipeline::new(modules.clone()));
        let directory = context.directory();
        if let Some(directory) = &directory {
            directory.register_pipeline(&pipeline)?;
        }
        Ok(Some(PipelineRegistration { directory, pipeline }))
    }

    fn mark_unloaded(&self) {
        {
            let mut state = lock(&self.state);
            state.state = InstanceState::Unloaded;
            Self::prepare_next_idle_waiters(&mut state);
        }
        self.unload_policy.cancel();
        if self.engine.state() != EngineState::Complete {
            self.engine.abort(None);
        }
        info!(instance_id = %self.instance_id, "Instance unloaded");
    }

    /// Unlock the durable record and close the context of an unloaded instance.
    async fn close_context(&self, transaction: Option<&Transaction>, timeout: Duration) -> Result<()> {
        let _guard = self.acquire_lock(timeout, false, false).await?;
        let Some(context) = self.context() else {
            return Ok(());
        };
        if context.communication_state() == CommunicationState::Opened {
            context.release(transaction, timeout).await?;
            if transaction.is_none() {
                context.close();
            }
        }
        Ok(())
    }

    /// Unload the instance and close its context. Any failure aborts it.
    pub(crate) async fn release_instance(&self, is_try: bool, timeout: Duration) -> Result<bool> {
        let helper = TimeoutHelper::new(timeout);
        let _permit = self.acquire_reference_gate(helper.remaining()).await?;
        let result = self.release_instance_core(is_try, &helper).await;
        if let Err(err) = &result {
            self.abort_instance(err.to_string(), false);
        }
        result
    }

    async fn release_instance_core(&self, is_try: bool, helper: &TimeoutHelper) -> Result<bool> {
        let deleted = lock(&self.state).has_persisted_deleted;
        let unloaded = if deleted {
            true
        } else {
            match self
                .unload_or_persist(PersistenceOperation::Unload, None, is_try, helper.remaining())
                .await
            {
                Ok(unloaded) => unloaded,
                Err(CoreError::InstanceAborted { reason, .. }) => {
                    warn!(instance_id = %self.instance_id, %reason, "Instance aborted before it could be unloaded");
                    false
                }
                Err(err) => return Err(err),
            }
        };
        if unloaded {
            self.close_context(None, helper.remaining()).await?;
        }
        Ok(unloaded)
    }

    /// Drop an idle instance that was already persisted by the unload policy.
    pub(crate) async fn unlock_and_abort(&self, reason: &str, timeout: Duration) -> Result<()> {
        let helper = TimeoutHelper::new(timeout);
        let _permit = self.acquire_reference_gate(helper.remaining()).await?;
        if self.try_release_last_reference() {
            self.abandon_core(reason, false, helper.remaining()).await?;
        }
        Ok(())
    }
}
