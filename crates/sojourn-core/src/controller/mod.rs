// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-instance controller.
//!
//! An [`InstanceController`] owns the execution state of one loaded instance
//! and drives its [`WorkflowEngine`]. Every mutation happens while holding
//! the instance's [`ExecutionLock`]; bookkeeping (reference count, waiter
//! lists, pending operations) sits behind a separate mutex so that taking a
//! reference never waits on execution.
//!
//! ```text
//!            run / unsuspend / commit
//!   Active <-------------------------- Suspended
//!     │  ──────────── suspend ─────────────^
//!     │ engine completes      unload
//!     v                         │
//!   Completed      Aborted    Unloaded
//! ```
//!
//! The controller holds its persistence context weakly; the context owns the
//! controller.

mod locking;
mod operations;
mod pending;
mod persist;
mod transaction;

pub use self::pending::{PendingOperation, PendingRequest};

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{Semaphore, oneshot};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use self::locking::CanPersistWaiter;
use self::pending::PendingOperations;
use crate::config::{HostConfig, UnhandledExceptionAction, UnloadTimings};
use crate::engine::{BufferedReceiveManager, EngineFactory, EngineNotifier, TrackingRecord, WorkflowEngine};
use crate::error::{CoreError, Result};
use crate::execution_lock::ExecutionLock;
use crate::model::{CompletionState, CreationContext, InstanceData, names};
use crate::persistence::PersistenceContext;
use crate::pipeline::PersistenceModule;
use crate::store::InstanceView;
use crate::sync::{AsyncWaitHandle, lock};
use crate::transaction::TransactionId;
use crate::unload_policy::UnloadPolicy;

/// Lifecycle state of a loaded instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Active,
    Suspended,
    Completed,
    Aborted,
    /// Gone from memory; a fresh load may bring the instance back.
    Unloaded,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Active => "active",
            InstanceState::Suspended => "suspended",
            InstanceState::Completed => "completed",
            InstanceState::Aborted => "aborted",
            InstanceState::Unloaded => "unloaded",
        }
    }

    /// Active and Suspended instances can still change.
    pub fn is_live(&self) -> bool {
        matches!(self, InstanceState::Active | InstanceState::Suspended)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timeouts and policies applied by every controller of a directory.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub persist_timeout: Duration,
    pub track_timeout: Duration,
    pub lock_timeout: Duration,
    pub unload: UnloadTimings,
    pub unhandled_exception_action: UnhandledExceptionAction,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from(&HostConfig::default())
    }
}

impl From<&HostConfig> for ControllerSettings {
    fn from(config: &HostConfig) -> Self {
        Self {
            persist_timeout: config.persist_timeout,
            track_timeout: config.track_timeout,
            lock_timeout: config.lock_timeout,
            unload: config.unload,
            unhandled_exception_action: config.unhandled_exception_action,
        }
    }
}

/// Collaborators shared by the controllers of one directory.
pub struct InstanceServices {
    pub engine_factory: Arc<dyn EngineFactory>,
    pub settings: ControllerSettings,
    pub buffered_receive: Option<Arc<dyn BufferedReceiveManager>>,
    pub persistence_modules: Vec<Arc<dyn PersistenceModule>>,
}

impl InstanceServices {
    pub fn new(engine_factory: Arc<dyn EngineFactory>, settings: ControllerSettings) -> Self {
        Self {
            engine_factory,
            settings,
            buffered_receive: None,
            persistence_modules: Vec::new(),
        }
    }

    pub fn with_buffered_receive(mut self, manager: Arc<dyn BufferedReceiveManager>) -> Self {
        self.buffered_receive = Some(manager);
        self
    }

    pub fn with_persistence_module(mut self, module: Arc<dyn PersistenceModule>) -> Self {
        self.persistence_modules.push(module);
        self
    }

    /// A canceled store operation is worth retrying only when buffered
    /// receives can replay the message.
    pub(crate) fn retry_on_cancel(&self) -> bool {
        self.buffered_receive.is_some()
    }
}

impl std::fmt::Debug for InstanceServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceServices")
            .field("settings", &self.settings)
            .field("buffered_receive", &self.buffered_receive.is_some())
            .field("persistence_modules", &self.persistence_modules.len())
            .finish()
    }
}

struct ControllerState {
    state: InstanceState,
    is_runnable: bool,
    has_data_to_persist: bool,
    has_raised_completed: bool,
    has_persisted_deleted: bool,
    /// The execution lock is held on behalf of the running engine.
    engine_running: bool,
    transaction: Option<TransactionId>,
    transacted_cancel: bool,
    termination_reason: Option<String>,
    abort_reason: Option<String>,
    completion: Option<CompletionState>,
    creation_context: Option<CreationContext>,
    references: usize,
    active_operations: usize,
    idle_waiters: VecDeque<Arc<AsyncWaitHandle>>,
    next_idle_waiters: Vec<Arc<AsyncWaitHandle>>,
    can_persist_waiters: Vec<Arc<CanPersistWaiter>>,
    pending_operations: PendingOperations,
    pending_requests: HashMap<u64, oneshot::Sender<CoreError>>,
    next_request_id: u64,
}

pub struct InstanceController {
    instance_id: Uuid,
    self_ref: Weak<InstanceController>,
    context: Weak<PersistenceContext>,
    can_persist: bool,
    engine: Arc<dyn WorkflowEngine>,
    services: Arc<InstanceServices>,
    executor: ExecutionLock,
    reference_gate: Semaphore,
    ready: AsyncWaitHandle,
    unload_policy: UnloadPolicy,
    state: Mutex<ControllerState>,
}

impl InstanceController {
    /// Build the controller of a freshly loaded context and its engine.
    ///
    /// The controller starts with two references: one for the unload policy
    /// and one for the loader, who must release it.
    pub(crate) fn create(
        context: &Arc<PersistenceContext>,
        view: Option<&InstanceView>,
        services: Arc<InstanceServices>,
    ) -> Result<Arc<Self>> {
        let instance_id = context.instance_id();
        let stored: Option<&InstanceData> = view.filter(|v| v.is_initialized).map(|v| &v.data);

        let notifier = EngineNotifier::new();
        let engine = services
            .engine_factory
            .create(instance_id, stored, notifier.clone())
            .map_err(|details| CoreError::Persistence {
                operation: "create engine".to_string(),
                details,
            })?;

        let creation_context = stored
            .and_then(|data| data.get(names::CREATION_CONTEXT))
            .and_then(|value| match serde_json::from_value(value.clone()) {
                Ok(creation) => Some(creation),
                Err(err) => {
                    warn!(%instance_id, error = %err, "Ignoring malformed creation context");
                    None
                }
            });

        let state = if context.is_suspended() {
            InstanceState::Suspended
        } else {
            InstanceState::Active
        };
        let can_persist = context.can_persist();
        let unload = services.settings.unload;

        let controller = Arc::new_cyclic(|self_ref: &Weak<InstanceController>| Self {
            instance_id,
            self_ref: self_ref.clone(),
            context: Arc::downgrade(context),
            can_persist,
            engine,
            services,
            executor: ExecutionLock::new(),
            reference_gate: Semaphore::new(1),
            ready: AsyncWaitHandle::new(),
            unload_policy: UnloadPolicy::new(self_ref.clone(), unload, can_persist),
            state: Mutex::new(ControllerState {
                state,
                is_runnable: false,
                has_data_to_persist: false,
                has_raised_completed: false,
                has_persisted_deleted: false,
                engine_running: false,
                transaction: None,
                transacted_cancel: false,
                termination_reason: None,
                abort_reason: None,
                completion: None,
                creation_context,
                references: 2,
                active_operations: 0,
                idle_waiters: VecDeque::new(),
                next_idle_waiters: Vec::new(),
                can_persist_waiters: Vec::new(),
                pending_operations: PendingOperations::default(),
                pending_requests: HashMap::new(),
                next_request_id: 0,
            }),
        });
        notifier.bind(Arc::downgrade(&controller));

        // Nobody holds the execution lock yet.
        controller.ready.set();
        debug!(%instance_id, %state, "Instance controller created");
        Ok(controller)
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn state(&self) -> InstanceState {
        lock(&self.state).state
    }

    pub fn is_runnable(&self) -> bool {
        lock(&self.state).is_runnable
    }

    pub fn reference_count(&self) -> usize {
        lock(&self.state).references
    }

    pub fn is_locked(&self) -> bool {
        self.executor.is_locked()
    }

    pub fn attached_transaction(&self) -> Option<TransactionId> {
        lock(&self.state).transaction
    }

    pub fn completion_state(&self) -> Option<CompletionState> {
        lock(&self.state).completion.clone()
    }

    pub fn termination_reason(&self) -> Option<String> {
        lock(&self.state).termination_reason.clone()
    }

    pub fn abort_reason(&self) -> Option<String> {
        lock(&self.state).abort_reason.clone()
    }

    pub fn creation_context(&self) -> Option<CreationContext> {
        lock(&self.state).creation_context.clone()
    }

    /// Creation arguments of a new instance; saved with its state.
    pub fn set_creation_context(&self, creation_context: CreationContext) {
        lock(&self.state).creation_context = Some(creation_context);
    }

    pub fn engine(&self) -> &Arc<dyn WorkflowEngine> {
        &self.engine
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.services.settings
    }

    pub fn is_unload_policy_armed(&self) -> bool {
        self.unload_policy.is_armed()
    }

    pub(crate) fn context(&self) -> Option<Arc<PersistenceContext>> {
        self.context.upgrade()
    }

    fn context_or_gone(&self) -> Result<Arc<PersistenceContext>> {
        self.context().ok_or(CoreError::InstanceUnloaded {
            instance_id: self.instance_id,
        })
    }

    // -----------------------------------------------------------------
    // References
    // -----------------------------------------------------------------

    /// Take a reference unless teardown already claimed the last one.
    pub fn try_add_reference(&self) -> bool {
        let added = {
            let mut state = lock(&self.state);
            if state.references == 0 {
                false
            } else {
                state.references += 1;
                true
            }
        };
        if added {
            self.unload_policy.cancel();
        }
        added
    }

    /// Give back a reference. Returns the remaining count.
    pub fn release_reference(&self) -> usize {
        let remaining = {
            let mut state = lock(&self.state);
            if state.references > 1 {
                state.references -= 1;
            } else {
                warn!(instance_id = %self.instance_id, references = state.references, "Reference released below the baseline");
            }
            state.references
        };
        self.start_unload_policy_if_necessary();
        remaining
    }

    /// Take a reference, first waiting for any teardown in progress.
    pub async fn try_acquire_reference(&self, timeout: Duration) -> Result<bool> {
        let _permit = self.acquire_reference_gate(timeout).await?;
        Ok(self.try_add_reference())
    }

    pub(crate) async fn acquire_reference_gate(
        &self,
        timeout: Duration,
    ) -> Result<tokio::sync::SemaphorePermit<'_>> {
        match tokio::time::timeout(timeout, self.reference_gate.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(CoreError::OperationCanceled {
                detail: format!("instance '{}' is shutting down", self.instance_id),
            }),
            Err(_) => Err(CoreError::timeout("acquire instance reference", timeout)),
        }
    }

    /// Claim the final reference for teardown.
    pub(crate) fn try_release_last_reference(&self) -> bool {
        let mut state = lock(&self.state);
        if state.references == 1 {
            state.references = 0;
            true
        } else {
            false
        }
    }

    /// Undo [`Self::try_release_last_reference`] after an abandoned teardown.
    pub(crate) fn recover_last_reference(&self) {
        let mut state = lock(&self.state);
        if state.references == 0 {
            state.references = 1;
        }
    }

    pub(crate) fn start_unload_policy_if_necessary(&self) {
        let (start, suspended) = {
            let state = lock(&self.state);
            let start = state.references == 1
                && state.transaction.is_none()
                && state.state.is_live()
                && !self.executor.is_locked();
            (start, state.state == InstanceState::Suspended)
        };
        if start {
            self.unload_policy.begin(suspended);
        }
    }

    // -----------------------------------------------------------------
    // Abort
    // -----------------------------------------------------------------

    /// Abort the instance.
    ///
    /// `holds_lock` means the caller already owns the execution lock (the
    /// engine or a control operation). Otherwise the abort takes the lock
    /// with priority, in the background if it is contended.
    pub fn abort_instance(&self, reason: impl Into<String>, holds_lock: bool) {
        let reason = reason.into();
        if holds_lock {
            self.abort_core(&reason, true);
            return;
        }

        if self.executor.try_enter() {
            self.abort_core(&reason, true);
            let mut owned = true;
            self.release_lock(&mut owned, false);
            return;
        }

        let Some(controller) = self.self_ref.upgrade() else {
            return;
        };
        crate::sync::spawn_detached(async move {
            let timeout = controller.services.settings.lock_timeout;
            match controller.acquire_lock(timeout, true, false).await {
                Ok(guard) => {
                    controller.abort_core(&reason, true);
                    drop(guard);
                }
                Err(err) => {
                    warn!(instance_id = %controller.instance_id, error = %err, "Aborting without the execution lock");
                    controller.abort_core(&reason, true);
                }
            }
        });
    }

    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub(crate) fn abort_core(&self, reason: &str, track: bool) {
        let can_persist_waiters = {
            let mut state = lock(&self.state);
            if state.state == InstanceState::Aborted {
                return;
            }
            state.state = InstanceState::Aborted;
            state.abort_reason = Some(reason.to_string());
            state.is_runnable = false;
            Self::prepare_next_idle_waiters(&mut state);
            std::mem::take(&mut state.can_persist_waiters)
        };
        warn!(%reason, "Aborting instance");
        self.unload_policy.cancel();

        self.engine.abort(Some(reason));
        if track {
            self.engine.track(TrackingRecord::Aborted {
                reason: reason.to_string(),
            });
        }

        self.fault_pending_requests(CoreError::InstanceAborted {
            instance_id: self.instance_id,
            reason: reason.to_string(),
        });
        for waiter in can_persist_waiters {
            waiter.signal(false);
        }
        self.complete_pending_operations();

        if let Some(context) = self.context() {
            context.abort();
        }
    }

    /// The persistence context was torn down underneath the instance.
    pub(crate) fn on_persistence_context_aborted(&self) {
        let state = self.state();
        if matches!(state, InstanceState::Aborted | InstanceState::Unloaded) {
            return;
        }
        self.abort_instance("persistence context was aborted", false);
    }

    // -----------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------

    fn record_completion(&self) -> Option<CompletionState> {
        let completion = self.engine.completion_state();
        let mut state = lock(&self.state);
        if let Some(CompletionState::Faulted { reason }) = &completion
            && state.termination_reason.is_none()
        {
            state.termination_reason = Some(reason.clone());
        }
        state.completion = completion.clone();
        completion
    }

    /// The instance finished: fault every waiting request, then unload it.
    fn on_completed(&self) {
        let fault = match self.termination_reason() {
            Some(reason) => CoreError::InstanceTerminated {
                instance_id: self.instance_id,
                reason,
            },
            None => CoreError::InstanceCompleted {
                instance_id: self.instance_id,
            },
        };
        self.fault_pending_requests(fault);
        info!(instance_id = %self.instance_id, completion = ?self.completion_state(), "Instance completed");

        if let Some(controller) = self.self_ref.upgrade() {
            crate::sync::spawn_detached(async move {
                let timeout = controller.services.settings.persist_timeout;
                if let Err(err) = controller.release_instance(false, timeout).await {
                    warn!(instance_id = %controller.instance_id, error = %err, "Failed to unload completed instance");
                }
            });
        }
        self.complete_pending_operations();
    }

    async fn flush_tracking(&self) -> Result<()> {
        if !self.engine.has_pending_tracking_records() {
            return Ok(());
        }
        let timeout = self.services.settings.track_timeout;
        self.engine
            .flush_tracking_records(timeout)
            .await
            .map_err(|details| CoreError::Persistence {
                operation: "flush tracking records".to_string(),
                details,
            })
    }
}

impl std::fmt::Debug for InstanceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("InstanceController")
            .field("instance_id", &self.instance_id)
            .field("state", &state.state)
            .field("is_runnable", &state.is_runnable)
            .field("references", &state.references)
            .field("transaction", &state.transaction)
            .finish()
    }
}
