// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Contract with the workflow execution engine.
//!
//! The controller drives an engine only through [`WorkflowEngine`] and never
//! looks at its internals. The engine reports back asynchronously through
//! the [`EngineNotifier`] it was created with.

pub mod mock;

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::controller::InstanceController;
use crate::model::{Bookmark, BookmarkResumptionResult, CompletionState, InstanceData, InstanceKey};

/// Execution state reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Has work to do.
    Runnable,
    /// Waiting on bookmarks.
    Idle,
    /// Finished; see [`WorkflowEngine::completion_state`].
    Complete,
    /// Aborted from inside the engine.
    Aborted,
}

/// Events the controller asks the engine to track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackingRecord {
    Idle,
    Persisted,
    Unloaded,
    Deleted,
    Suspended { reason: String },
    Unsuspended,
    Terminated { reason: String },
    Canceled,
    Aborted { reason: String },
    Completed,
    UnhandledException { message: String },
}

#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    fn state(&self) -> EngineState;

    /// Resume execution. The engine calls [`EngineNotifier::notify_paused`]
    /// once it stops.
    fn run(&self);

    /// Ask a running engine to stop at the next opportunity.
    fn request_pause(&self);

    /// Ask the engine to pause as soon as it reaches a persistable point.
    fn pause_when_persistable(&self) {}

    fn abort(&self, reason: Option<&str>);

    fn terminate(&self, reason: &str);

    fn schedule_cancel(&self);

    fn schedule_bookmark_resumption(
        &self,
        bookmark: &Bookmark,
        value: Value,
    ) -> BookmarkResumptionResult;

    fn bookmarks(&self) -> Vec<Bookmark>;

    fn is_persistable(&self) -> bool;

    /// Serialize the engine state for a save.
    fn prepare_for_serialization(&self) -> InstanceData;

    fn completion_state(&self) -> Option<CompletionState>;

    fn track(&self, _record: TrackingRecord) {}

    fn has_pending_tracking_records(&self) -> bool {
        false
    }

    async fn flush_tracking_records(&self, _timeout: Duration) -> Result<(), String> {
        Ok(())
    }

    /// Apply a definition update map. An error leaves the engine unchanged.
    fn apply_update(&self, _update: &Value) -> Result<(), String> {
        Err("this engine does not support updates".to_string())
    }
}

/// Creates engines for loaded or new instances.
pub trait EngineFactory: Send + Sync {
    /// `state` is the stored engine state; `None` for a new instance.
    fn create(
        &self,
        instance_id: Uuid,
        state: Option<&InstanceData>,
        notifier: EngineNotifier,
    ) -> Result<Arc<dyn WorkflowEngine>, String>;
}

/// Retries buffered out-of-order receives once an instance goes idle.
pub trait BufferedReceiveManager: Send + Sync {
    fn retry(&self, keys: &[InstanceKey], bookmarks: &[Bookmark]);

    fn abandon_buffered_receives(&self, keys: &[InstanceKey]);
}

/// Engine-side handle for reporting back to the controller.
///
/// Every notification is delivered on a spawned task, so engines may call
/// in from any context, including while holding their own locks.
#[derive(Clone, Default)]
pub struct EngineNotifier {
    target: Arc<OnceLock<Weak<InstanceController>>>,
}

impl EngineNotifier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bind(&self, controller: Weak<InstanceController>) {
        if self.target.set(controller).is_err() {
            warn!("Engine notifier was already bound");
        }
    }

    fn controller(&self) -> Option<Arc<InstanceController>> {
        self.target.get().and_then(Weak::upgrade)
    }

    /// The engine stopped: it is idle, complete, aborted or honored a pause.
    pub fn notify_paused(&self) {
        if let Some(controller) = self.controller() {
            crate::sync::spawn_detached(async move { controller.on_notify_paused().await });
        }
    }

    pub fn notify_unhandled_exception(&self, message: impl Into<String>) {
        let message = message.into();
        if let Some(controller) = self.controller() {
            crate::sync::spawn_detached(async move {
                controller.on_unhandled_exception(message).await
            });
        }
    }

    /// The engine cannot continue and wants the instance aborted.
    pub fn request_abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if let Some(controller) = self.controller() {
            controller.abort_instance(reason, false);
        }
    }
}
