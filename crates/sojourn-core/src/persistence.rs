// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-instance persistence context.
//!
//! A [`PersistenceContext`] guards the storage operations of one instance
//! (save, release, key association, suspend metadata) and owns the
//! instance's transaction lock: at most one transaction may hold it, every
//! other caller queues in arrival order.
//!
//! Ownership runs one way: the directory owns contexts, a context owns its
//! controller, and both the controller and the enlistment objects hold only
//! weak references back.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::controller::InstanceController;
use crate::directory::InstanceDirectory;
use crate::error::{CoreError, Result};
use crate::model::{InstanceData, InstanceKey, SaveStatus, names};
use crate::store::{
    InstanceHandle, InstanceStore, InstanceView, SaveCommand, StoreCommand, StoreError,
};
use crate::sync::{AsyncWaitHandle, TimeoutHelper, lock};
use crate::transaction::{EnlistmentNotification, Transaction, TransactionId};

/// Communication state of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommunicationState {
    Created,
    Opened,
    Closing,
    Closed,
    Faulted,
}

/// Store and handle a context issues its commands through.
#[derive(Clone)]
pub(crate) struct StoreBinding {
    pub(crate) store: Arc<dyn InstanceStore>,
    pub(crate) handle: InstanceHandle,
}

struct TransactionWaiter {
    transaction: Option<TransactionId>,
    handle: Arc<AsyncWaitHandle>,
}

/// Mutable state of a context, guarded by the context's own lock.
struct ContextState {
    communication: CommunicationState,
    aborted: bool,
    is_locked: bool,
    is_initialized: bool,
    is_completed: bool,
    is_visible: bool,
    is_suspended: bool,
    suspend_reason: Option<String>,
    instance_status: Option<&'static str>,
    keys: HashMap<Uuid, InstanceKey>,
    keys_to_associate: HashMap<Uuid, InstanceKey>,
    keys_to_disassociate: HashMap<Uuid, InstanceKey>,
    lock_holder: Option<TransactionId>,
    lock_waiters: VecDeque<TransactionWaiter>,
    enlisted: HashSet<TransactionId>,
    detach_on_commit: Option<TransactionId>,
}

pub struct PersistenceContext {
    instance_id: Uuid,
    self_ref: Weak<PersistenceContext>,
    directory: Weak<InstanceDirectory>,
    binding: Option<StoreBinding>,
    keys_globally_consistent: bool,
    operation_gate: tokio::sync::Mutex<()>,
    state: Mutex<ContextState>,
    controller: Mutex<Option<Arc<InstanceController>>>,
}

impl PersistenceContext {
    /// Build a context for a freshly loaded (or in-memory created) instance.
    ///
    /// With a view the flags and keys come from storage; without one the
    /// context starts uninitialized and owns `keys`.
    pub(crate) fn new(
        instance_id: Uuid,
        directory: Weak<InstanceDirectory>,
        binding: Option<StoreBinding>,
        view: Option<&InstanceView>,
        keys: Vec<InstanceKey>,
        keys_globally_consistent: bool,
    ) -> Arc<Self> {
        let mut key_map: HashMap<Uuid, InstanceKey> = keys
            .into_iter()
            .map(|key| (key.value(), key))
            .collect();
        let (is_locked, is_initialized, is_suspended, suspend_reason) = match view {
            Some(view) => {
                for key in &view.keys {
                    key_map.insert(key.value(), key.clone());
                }
                (
                    view.is_locked,
                    view.is_initialized,
                    view.is_suspended(),
                    view.suspend_reason().map(str::to_string),
                )
            }
            None => (false, false, false, None),
        };

        Arc::new_cyclic(|self_ref| Self {
            instance_id,
            self_ref: self_ref.clone(),
            directory,
            binding,
            keys_globally_consistent,
            operation_gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(ContextState {
                communication: CommunicationState::Created,
                aborted: false,
                is_locked,
                is_initialized,
                is_completed: false,
                is_visible: false,
                is_suspended,
                suspend_reason,
                instance_status: None,
                keys: key_map,
                keys_to_associate: HashMap::new(),
                keys_to_disassociate: HashMap::new(),
                lock_holder: None,
                lock_waiters: VecDeque::new(),
                enlisted: HashSet::new(),
                detach_on_commit: None,
            }),
            controller: Mutex::new(None),
        })
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn can_persist(&self) -> bool {
        self.binding.is_some()
    }

    pub fn communication_state(&self) -> CommunicationState {
        lock(&self.state).communication
    }

    pub fn is_aborted(&self) -> bool {
        lock(&self.state).aborted
    }

    pub fn is_locked(&self) -> bool {
        lock(&self.state).is_locked
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.state).is_initialized
    }

    pub fn is_completed(&self) -> bool {
        lock(&self.state).is_completed
    }

    /// True while the directory has this context in its lookup tables.
    pub fn is_visible(&self) -> bool {
        lock(&self.state).is_visible
    }

    pub fn is_suspended(&self) -> bool {
        lock(&self.state).is_suspended
    }

    pub fn suspend_reason(&self) -> Option<String> {
        lock(&self.state).suspend_reason.clone()
    }

    /// Associated keys, including associations not yet saved.
    pub fn keys(&self) -> Vec<InstanceKey> {
        let state = lock(&self.state);
        let mut keys: Vec<InstanceKey> = state
            .keys
            .values()
            .chain(state.keys_to_associate.values())
            .filter(|key| !state.keys_to_disassociate.contains_key(&key.value()))
            .cloned()
            .collect();
        keys.sort_by_key(InstanceKey::value);
        keys
    }

    /// The transaction currently holding this context's transaction lock.
    pub fn transaction_lock_holder(&self) -> Option<TransactionId> {
        lock(&self.state).lock_holder
    }

    pub fn queued_enlistments(&self) -> usize {
        lock(&self.state).lock_waiters.len()
    }

    /// Live controller bound to this context, if any.
    pub fn controller(&self) -> Option<Arc<InstanceController>> {
        lock(&self.controller).clone()
    }

    pub(crate) fn bind_controller(&self, controller: Arc<InstanceController>) {
        *lock(&self.controller) = Some(controller);
    }

    pub(crate) fn directory(&self) -> Option<Arc<InstanceDirectory>> {
        self.directory.upgrade()
    }

    pub(crate) fn set_visible(&self, visible: bool) {
        lock(&self.state).is_visible = visible;
    }

    pub(crate) fn set_suspended(&self, suspended: bool, reason: Option<String>) {
        let mut state = lock(&self.state);
        state.is_suspended = suspended;
        state.suspend_reason = if suspended { reason } else { None };
    }

    /// Status written into instance metadata with the next save.
    pub(crate) fn set_instance_status(&self, status: &'static str) {
        lock(&self.state).instance_status = Some(status);
    }

    pub fn open(&self) {
        let mut state = lock(&self.state);
        if state.communication == CommunicationState::Created {
            state.communication = CommunicationState::Opened;
        }
    }

    /// Save instance data with the requested outcome.
    ///
    /// Pending key associations and suspend metadata travel with the save.
    /// Unless the instance stays locked, the caller's transaction (or a
    /// non-transactional turn) is queued on the transaction lock afterwards.
    #[instrument(skip(self, data, transaction), fields(instance_id = %self.instance_id))]
    pub async fn save(
        &self,
        data: Option<InstanceData>,
        status: SaveStatus,
        transaction: Option<&Transaction>,
        timeout: Duration,
    ) -> Result<()> {
        let helper = TimeoutHelper::new(timeout);
        {
            let _gate = self.enter_gate("save", &helper).await?;

            let command = {
                let state = lock(&self.state);
                self.ensure_usable(&state)?;
                if state.is_completed {
                    return Err(CoreError::invalid_operation(format!(
                        "instance '{}' is already completed",
                        self.instance_id
                    )));
                }
                if !state.is_visible {
                    return Err(CoreError::invalid_operation(format!(
                        "context for instance '{}' is not cached",
                        self.instance_id
                    )));
                }

                let mut metadata = BTreeMap::new();
                metadata.insert(
                    names::IS_SUSPENDED.to_string(),
                    Value::Bool(state.is_suspended),
                );
                metadata.insert(
                    names::SUSPEND_REASON.to_string(),
                    state
                        .suspend_reason
                        .clone()
                        .map(Value::String)
                        .unwrap_or(Value::Null),
                );
                if let Some(status) = state.instance_status {
                    metadata.insert(names::STATUS.to_string(), Value::from(status));
                }

                SaveCommand {
                    instance_data: data,
                    instance_metadata: metadata,
                    keys_to_associate: state.keys_to_associate.values().cloned().collect(),
                    keys_to_free: state.keys_to_disassociate.keys().copied().collect(),
                    unlock: status != SaveStatus::Locked,
                    complete: status == SaveStatus::Completed,
                }
            };

            self.execute_save("save", command, &helper).await?;

            let mut state = lock(&self.state);
            match status {
                SaveStatus::Locked => {
                    state.is_locked = true;
                    state.is_initialized = true;
                }
                SaveStatus::Unlocked => {
                    state.is_locked = false;
                    state.is_initialized = true;
                }
                SaveStatus::Completed => {
                    state.is_completed = true;
                    state.is_locked = false;
                }
            }
            let associated = std::mem::take(&mut state.keys_to_associate);
            state.keys.extend(associated);
            let freed = std::mem::take(&mut state.keys_to_disassociate);
            for key in freed.keys() {
                state.keys.remove(key);
            }
        }

        debug!(?status, "Instance saved");

        if status != SaveStatus::Locked {
            self.enlist(transaction, helper.remaining()).await?;
        }
        Ok(())
    }

    /// Unlock the durable record and detach from the directory.
    ///
    /// Under a transaction the detach happens when it commits.
    #[instrument(skip(self, transaction), fields(instance_id = %self.instance_id))]
    pub async fn release(&self, transaction: Option<&Transaction>, timeout: Duration) -> Result<()> {
        let helper = TimeoutHelper::new(timeout);
        {
            let _gate = self.enter_gate("release", &helper).await?;

            let needs_unlock = {
                let state = lock(&self.state);
                self.ensure_usable(&state)?;
                state.is_locked
            };

            if needs_unlock {
                let command = SaveCommand {
                    unlock: true,
                    ..Default::default()
                };
                self.execute_save("release", command, &helper).await?;
                lock(&self.state).is_locked = false;
            }
        }

        self.enlist(transaction, helper.remaining()).await?;

        let detach_now = {
            let mut state = lock(&self.state);
            state.keys_to_associate.clear();
            state.keys_to_disassociate.clear();
            match transaction {
                Some(transaction) if !state.aborted => {
                    state.detach_on_commit = Some(transaction.id());
                    false
                }
                _ => true,
            }
        };
        if detach_now {
            self.detach();
        }
        Ok(())
    }

    /// Associate correlation keys with this instance.
    #[instrument(skip(self, keys, transaction), fields(instance_id = %self.instance_id, count = keys.len()))]
    pub async fn associate_keys(
        &self,
        keys: Vec<InstanceKey>,
        transaction: Option<&Transaction>,
        timeout: Duration,
    ) -> Result<()> {
        for key in &keys {
            key.validate()?;
        }
        let helper = TimeoutHelper::new(timeout);

        self.enlist(transaction, helper.remaining()).await?;

        if let Some(directory) = self.directory.upgrade() {
            directory.try_add_associations(self, &keys)?;
        }

        let added = {
            let mut state = lock(&self.state);
            self.ensure_usable(&state)?;
            let mut added = Vec::new();
            for key in keys {
                if state.keys_to_disassociate.remove(&key.value()).is_some() {
                    continue;
                }
                if !state.keys.contains_key(&key.value()) {
                    added.push(key.clone());
                    state.keys_to_associate.insert(key.value(), key);
                }
            }
            added
        };

        if self.keys_globally_consistent && self.binding.is_some() && !added.is_empty() {
            let _gate = self.enter_gate("associate keys", &helper).await?;
            let command = SaveCommand {
                keys_to_associate: added.clone(),
                ..Default::default()
            };
            self.execute_save("associate keys", command, &helper).await?;
            let mut state = lock(&self.state);
            for key in added {
                state.keys_to_associate.remove(&key.value());
                state.keys.insert(key.value(), key);
            }
        }
        Ok(())
    }

    /// Drop key associations. Storage sees the change with the next save.
    pub fn disassociate_keys(&self, keys: &[InstanceKey]) {
        {
            let mut state = lock(&self.state);
            for key in keys {
                if state.keys_to_associate.remove(&key.value()).is_some() {
                    continue;
                }
                if state.keys.contains_key(&key.value()) {
                    state.keys_to_disassociate.insert(key.value(), key.clone());
                }
            }
        }
        if let Some(directory) = self.directory.upgrade() {
            directory.remove_associations(self, keys);
        }
    }

    /// Mark the durable record suspended and unlock it in one command.
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn update_suspend_metadata(&self, reason: &str, timeout: Duration) -> Result<()> {
        let helper = TimeoutHelper::new(timeout);
        let _gate = self.enter_gate("update suspend metadata", &helper).await?;
        {
            let state = lock(&self.state);
            self.ensure_usable(&state)?;
        }

        let mut metadata = BTreeMap::new();
        metadata.insert(names::IS_SUSPENDED.to_string(), Value::Bool(true));
        metadata.insert(names::SUSPEND_REASON.to_string(), Value::from(reason));
        metadata.insert(names::SUSPEND_EXCEPTION.to_string(), Value::from(reason));
        metadata.insert(names::STATUS.to_string(), Value::from("Suspended"));
        let command = SaveCommand {
            instance_metadata: metadata,
            unlock: true,
            ..Default::default()
        };
        self.execute_save("update suspend metadata", command, &helper)
            .await?;

        let mut state = lock(&self.state);
        state.is_locked = false;
        state.is_suspended = true;
        state.suspend_reason = Some(reason.to_string());
        Ok(())
    }

    /// Queue for the transaction lock.
    ///
    /// With a transaction the lock is taken for it and the context enlists
    /// in its outcome. Without one the call only waits for the lock to be
    /// free. A waiter granted the lock after the context was aborted returns
    /// normally; callers check [`Self::is_aborted`].
    pub async fn enlist(&self, transaction: Option<&Transaction>, timeout: Duration) -> Result<()> {
        let transaction_id = transaction.map(Transaction::id);
        let waiter = {
            let mut state = lock(&self.state);
            if state.aborted {
                return Ok(());
            }
            match state.lock_holder {
                Some(holder) if Some(holder) == transaction_id => None,
                None if state.lock_waiters.is_empty() => {
                    state.lock_holder = transaction_id;
                    None
                }
                _ => {
                    let handle = Arc::new(AsyncWaitHandle::new());
                    state.lock_waiters.push_back(TransactionWaiter {
                        transaction: transaction_id,
                        handle: handle.clone(),
                    });
                    Some(handle)
                }
            }
        };

        if let Some(handle) = waiter {
            debug!(instance_id = %self.instance_id, transaction = ?transaction_id, "Waiting for transaction lock");
            if !handle.wait(timeout).await {
                let mut state = lock(&self.state);
                if let Some(position) = state
                    .lock_waiters
                    .iter()
                    .position(|waiter| Arc::ptr_eq(&waiter.handle, &handle))
                {
                    state.lock_waiters.remove(position);
                    return Err(CoreError::timeout("enlist", timeout));
                }
                debug!(instance_id = %self.instance_id, "Transaction lock granted as the wait timed out");
            }
        }

        match transaction {
            Some(transaction) => self.ensure_enlisted(transaction),
            None => Ok(()),
        }
    }

    fn ensure_enlisted(&self, transaction: &Transaction) -> Result<()> {
        let id = transaction.id();
        {
            let mut state = lock(&self.state);
            if state.aborted || !state.enlisted.insert(id) {
                return Ok(());
            }
        }

        let enlistment = Arc::new(ContextEnlistment {
            context: self.self_ref.clone(),
            transaction: id,
        });
        if let Err(err) = transaction.enlist_volatile(enlistment) {
            lock(&self.state).enlisted.remove(&id);
            self.schedule_next_transaction_waiter(id);
            return Err(err.into());
        }
        debug!(instance_id = %self.instance_id, transaction = %id, "Context enlisted");
        Ok(())
    }

    /// Hand the transaction lock from `released` to the next waiters.
    ///
    /// Waiters without a transaction are let through without taking the
    /// lock. The first transactional waiter takes it, together with every
    /// directly following waiter of the same transaction.
    fn schedule_next_transaction_waiter(&self, released: TransactionId) {
        let mut state = lock(&self.state);
        if state.lock_holder != Some(released) {
            return;
        }
        state.lock_holder = None;

        while let Some(waiter) = state.lock_waiters.pop_front() {
            match waiter.transaction {
                None => waiter.handle.set(),
                Some(owner) => {
                    state.lock_holder = Some(owner);
                    waiter.handle.set();
                    while state
                        .lock_waiters
                        .front()
                        .is_some_and(|next| next.transaction == Some(owner))
                    {
                        if let Some(next) = state.lock_waiters.pop_front() {
                            next.handle.set();
                        }
                    }
                    break;
                }
            }
        }
    }

    /// Complete every queued enlistment; used when the context is removed for good.
    pub(crate) fn flush_transaction_waiters(&self) {
        let mut state = lock(&self.state);
        state.lock_holder = None;
        for waiter in state.lock_waiters.drain(..) {
            waiter.handle.set();
        }
    }

    fn on_transaction_outcome(&self, transaction: TransactionId, committed: bool) {
        let detach = {
            let mut state = lock(&self.state);
            state.enlisted.remove(&transaction);
            if state.detach_on_commit == Some(transaction) {
                state.detach_on_commit = None;
                committed
            } else {
                false
            }
        };

        if committed {
            if detach {
                self.detach();
            }
        } else {
            warn!(instance_id = %self.instance_id, %transaction, "Transaction did not commit, aborting context");
            self.abort();
        }
        self.schedule_next_transaction_waiter(transaction);
    }

    fn detach(&self) {
        match self.directory.upgrade() {
            Some(directory) => directory.remove_instance(self, false),
            None => self.set_visible(false),
        }
    }

    /// Tear the context down after a fault.
    ///
    /// Frees the storage handle, evicts the context for good and tells the
    /// controller. Idempotent.
    pub fn abort(&self) {
        {
            let mut state = lock(&self.state);
            if state.aborted {
                return;
            }
            state.aborted = true;
            if state.communication != CommunicationState::Faulted {
                state.communication = CommunicationState::Closed;
            }
        }
        info!(instance_id = %self.instance_id, "Aborting persistence context");

        if let Some(binding) = &self.binding {
            binding.store.free_handle(&binding.handle);
        }
        match self.directory.upgrade() {
            Some(directory) => directory.remove_instance(self, true),
            None => self.set_visible(false),
        }
        self.flush_transaction_waiters();

        if let Some(controller) = self.controller() {
            controller.on_persistence_context_aborted();
        }
    }

    /// Orderly close: evict from the directory and free the storage handle.
    pub fn close(&self) {
        {
            let mut state = lock(&self.state);
            if matches!(
                state.communication,
                CommunicationState::Closing | CommunicationState::Closed
            ) {
                return;
            }
            state.communication = CommunicationState::Closing;
        }

        if let Some(directory) = self.directory.upgrade() {
            directory.remove_instance(self, false);
        }
        if let Some(binding) = &self.binding {
            binding.store.free_handle(&binding.handle);
        }

        lock(&self.state).communication = CommunicationState::Closed;
        debug!(instance_id = %self.instance_id, "Persistence context closed");
    }

    fn fault(&self) {
        lock(&self.state).communication = CommunicationState::Faulted;
        self.abort();
    }

    fn ensure_usable(&self, state: &ContextState) -> Result<()> {
        if state.aborted || state.communication == CommunicationState::Faulted {
            return Err(CoreError::CommunicationObjectAborted {
                detail: format!("persistence context for '{}' was aborted", self.instance_id),
            });
        }
        if state.communication == CommunicationState::Closed {
            return Err(CoreError::CommunicationObjectAborted {
                detail: format!("persistence context for '{}' is closed", self.instance_id),
            });
        }
        Ok(())
    }

    async fn enter_gate(
        &self,
        operation: &'static str,
        helper: &TimeoutHelper,
    ) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        tokio::time::timeout(helper.remaining(), self.operation_gate.lock())
            .await
            .map_err(|_| CoreError::timeout(operation, helper.original()))
    }

    async fn execute_save(
        &self,
        operation: &'static str,
        command: SaveCommand,
        helper: &TimeoutHelper,
    ) -> Result<()> {
        let Some(binding) = &self.binding else {
            return Ok(());
        };

        match binding
            .store
            .execute(&binding.handle, StoreCommand::Save(command), helper.remaining())
            .await
        {
            Ok(_) => Ok(()),
            Err(StoreError::Timeout(timeout)) => {
                warn!(instance_id = %self.instance_id, operation, "Store command timed out, faulting context");
                self.fault();
                Err(CoreError::timeout(operation, timeout))
            }
            Err(StoreError::OperationCanceled) => Err(CoreError::CommunicationObjectAborted {
                detail: format!("{} canceled: instance handle was freed", operation),
            }),
            Err(err) => Err(err.into()),
        }
    }
}

impl std::fmt::Debug for PersistenceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("PersistenceContext")
            .field("instance_id", &self.instance_id)
            .field("communication", &state.communication)
            .field("is_locked", &state.is_locked)
            .field("is_initialized", &state.is_initialized)
            .field("is_completed", &state.is_completed)
            .field("is_visible", &state.is_visible)
            .field("lock_holder", &state.lock_holder)
            .finish()
    }
}

/// Enlistment of one context in one transaction.
///
/// Commit releases the context's transaction lock (and runs a scheduled
/// detach). Rollback and in-doubt abort the context, then release the lock.
struct ContextEnlistment {
    context: Weak<PersistenceContext>,
    transaction: TransactionId,
}

impl EnlistmentNotification for ContextEnlistment {
    fn commit(&self) {
        if let Some(context) = self.context.upgrade() {
            context.on_transaction_outcome(self.transaction, true);
        }
    }

    fn rollback(&self) {
        if let Some(context) = self.context.upgrade() {
            context.on_transaction_outcome(self.transaction, false);
        }
    }

    fn in_doubt(&self) {
        if let Some(context) = self.context.upgrade() {
            context.on_transaction_outcome(self.transaction, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CommandKind, MemoryStore};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn detached_context() -> Arc<PersistenceContext> {
        let context = PersistenceContext::new(
            Uuid::new_v4(),
            Weak::new(),
            None,
            None,
            vec![InstanceKey::new(Uuid::new_v4())],
            false,
        );
        context.open();
        context.set_visible(true);
        context
    }

    async fn stored_context(store: Arc<MemoryStore>) -> Arc<PersistenceContext> {
        let handle = InstanceHandle::new(Uuid::new_v4());
        let view = store
            .execute(
                &handle,
                StoreCommand::LoadOrCreate {
                    instance_id: None,
                    key: None,
                    associate_keys: Vec::new(),
                },
                TIMEOUT,
            )
            .await
            .unwrap();
        let context = PersistenceContext::new(
            view.instance_id.unwrap(),
            Weak::new(),
            Some(StoreBinding { store, handle }),
            Some(&view),
            Vec::new(),
            false,
        );
        context.open();
        context.set_visible(true);
        context
    }

    #[tokio::test]
    async fn test_completed_save_without_store() {
        let context = detached_context();

        context
            .save(Some(InstanceData::new()), SaveStatus::Completed, None, TIMEOUT)
            .await
            .unwrap();
        assert!(context.is_completed());
        assert!(!context.is_locked());

        let err = context
            .save(None, SaveStatus::Locked, None, TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_OPERATION");
        assert!(err.to_string().contains("already completed"));
    }

    #[tokio::test]
    async fn test_save_requires_visible_context() {
        let context = detached_context();
        context.set_visible(false);

        let err = context
            .save(None, SaveStatus::Locked, None, TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_OPERATION");
    }

    #[tokio::test]
    async fn test_locked_save_sets_flags() {
        let context = detached_context();
        assert!(!context.is_initialized());

        context
            .save(Some(InstanceData::new()), SaveStatus::Locked, None, TIMEOUT)
            .await
            .unwrap();
        assert!(context.is_initialized());
        assert!(context.is_locked());
    }

    #[tokio::test]
    async fn test_disassociate_pending_key_cancels_association() {
        let context = detached_context();
        let key = InstanceKey::new(Uuid::new_v4());

        context
            .associate_keys(vec![key.clone()], None, TIMEOUT)
            .await
            .unwrap();
        assert!(context.keys().contains(&key));

        context.disassociate_keys(std::slice::from_ref(&key));
        assert!(!context.keys().contains(&key));
    }

    #[tokio::test]
    async fn test_associate_rejects_nil_key() {
        let context = detached_context();
        let err = context
            .associate_keys(vec![InstanceKey::new(Uuid::nil())], None, TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_KEY");
    }

    #[tokio::test]
    async fn test_same_transaction_reenters_lock() {
        let context = detached_context();
        let transaction = Transaction::new();

        context.enlist(Some(&transaction), TIMEOUT).await.unwrap();
        context.enlist(Some(&transaction), TIMEOUT).await.unwrap();

        assert_eq!(context.transaction_lock_holder(), Some(transaction.id()));
        assert_eq!(transaction.enlistment_count(), 1);

        transaction.commit().unwrap();
        assert_eq!(context.transaction_lock_holder(), None);
        assert!(!context.is_aborted());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_transaction_waits_for_commit() {
        let context = detached_context();
        let first = Transaction::new();
        let second = Transaction::new();
        context.enlist(Some(&first), TIMEOUT).await.unwrap();

        let waiter = {
            let context = context.clone();
            let second = second.clone();
            tokio::spawn(async move { context.enlist(Some(&second), TIMEOUT).await })
        };
        while context.queued_enlistments() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!waiter.is_finished());

        first.commit().unwrap();
        waiter.await.unwrap().unwrap();
        assert_eq!(context.transaction_lock_holder(), Some(second.id()));
    }

    #[tokio::test]
    async fn test_enlist_timeout_leaves_queue() {
        let context = detached_context();
        let holder = Transaction::new();
        context.enlist(Some(&holder), TIMEOUT).await.unwrap();

        let other = Transaction::new();
        let err = context
            .enlist(Some(&other), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(context.queued_enlistments(), 0);
        assert_eq!(context.transaction_lock_holder(), Some(holder.id()));
    }

    #[tokio::test]
    async fn test_waiters_coalesce_by_transaction() {
        let context = detached_context();
        let holder = Transaction::new();
        let next = Transaction::new();
        let later = Transaction::new();
        context.enlist(Some(&holder), TIMEOUT).await.unwrap();

        let handles: Vec<Arc<AsyncWaitHandle>> = [None, Some(next.id()), Some(next.id()), Some(later.id())]
            .into_iter()
            .map(|transaction| {
                let handle = Arc::new(AsyncWaitHandle::new());
                lock(&context.state).lock_waiters.push_back(TransactionWaiter {
                    transaction,
                    handle: handle.clone(),
                });
                handle
            })
            .collect();

        context.schedule_next_transaction_waiter(holder.id());

        assert!(handles[0].is_set());
        assert!(handles[1].is_set());
        assert!(handles[2].is_set());
        assert!(!handles[3].is_set());
        assert_eq!(context.transaction_lock_holder(), Some(next.id()));
        assert_eq!(context.queued_enlistments(), 1);
    }

    #[tokio::test]
    async fn test_rollback_aborts_and_flushes_waiters() {
        let context = detached_context();
        let first = Transaction::new();
        context.enlist(Some(&first), TIMEOUT).await.unwrap();

        let waiting = Arc::new(AsyncWaitHandle::new());
        lock(&context.state).lock_waiters.push_back(TransactionWaiter {
            transaction: Some(TransactionId::new()),
            handle: waiting.clone(),
        });

        first.rollback();

        assert!(context.is_aborted());
        assert!(waiting.is_set());
        assert_eq!(context.queued_enlistments(), 0);
        assert_eq!(context.transaction_lock_holder(), None);
    }

    #[tokio::test]
    async fn test_transactional_release_detaches_on_commit() {
        let context = detached_context();
        let transaction = Transaction::new();

        context.release(Some(&transaction), TIMEOUT).await.unwrap();
        assert!(context.is_visible());

        transaction.commit().unwrap();
        assert!(!context.is_visible());
    }

    #[tokio::test]
    async fn test_release_unlocks_stored_instance() {
        let store = Arc::new(MemoryStore::new());
        let context = stored_context(store.clone()).await;
        assert!(context.is_locked());

        context.release(None, TIMEOUT).await.unwrap();

        assert!(!context.is_locked());
        assert!(!context.is_visible());
        assert_eq!(store.command_count(CommandKind::Save), 1);
    }

    #[tokio::test]
    async fn test_store_timeout_faults_context() {
        let store = Arc::new(MemoryStore::new());
        store.inject_fault(CommandKind::Save, StoreError::Timeout(Duration::from_millis(5)));
        let context = stored_context(store).await;

        let err = context
            .save(None, SaveStatus::Locked, None, TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(context.communication_state(), CommunicationState::Faulted);
        assert!(context.is_aborted());
    }

    #[tokio::test]
    async fn test_canceled_save_is_communication_abort() {
        let store = Arc::new(MemoryStore::new());
        store.inject_fault(CommandKind::Save, StoreError::OperationCanceled);
        let context = stored_context(store).await;

        let err = context
            .save(None, SaveStatus::Unlocked, None, TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "COMMUNICATION_OBJECT_ABORTED");
        assert!(!context.is_aborted());
    }
}
