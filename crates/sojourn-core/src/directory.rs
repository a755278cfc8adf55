// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance directory: the cache that resolves identities and correlation
//! keys to loaded persistence contexts.
//!
//! # Load protocol
//!
//! ```text
//!   probe cache ──hit──> enlist ──> (context, from_cache = true)
//!       │ miss
//!       ├── load of same identity in flight ──> wait, probe again
//!       v
//!   throttle slot ──> store command ──Conflict──> cached by id? else yield, probe again
//!       │ Loaded
//!       v
//!   pipeline hooks ──> context + controller ──> enlist ──> insert (evict stale)
//! ```
//!
//! Every exit from a physical load runs the same finalizer ([`LoadGuard`]),
//! which gives back the throttle slot and storage handle of anything that
//! did not make it into the cache and wakes callers waiting on the load.
//!
//! The cache, key map, in-flight loads and pipelines in use share one lock
//! that is never held across a storage call.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::HostConfig;
use crate::controller::{InstanceController, InstanceServices};
use crate::error::{CoreError, Result};
use crate::model::InstanceKey;
use crate::persistence::{PersistenceContext, StoreBinding};
use crate::pipeline::PersistencePipeline;
use crate::store::{InstanceHandle, InstanceStore, InstanceView, StoreCommand, StoreError};
use crate::sync::{AsyncWaitHandle, TimeoutHelper, lock};
use crate::throttle::InstanceThrottle;
use crate::transaction::Transaction;

/// What a caller wants loaded.
#[derive(Debug, Clone, Default)]
pub struct LoadRequest {
    pub instance_id: Option<Uuid>,
    pub key: Option<InstanceKey>,
    pub associate_keys: Vec<InstanceKey>,
    /// Lock any runnable instance instead of a specific one.
    pub any_runnable: bool,
}

impl LoadRequest {
    pub fn by_id(instance_id: Uuid) -> Self {
        Self {
            instance_id: Some(instance_id),
            ..Default::default()
        }
    }

    pub fn by_key(key: InstanceKey) -> Self {
        Self {
            key: Some(key),
            ..Default::default()
        }
    }

    /// A brand new instance with a generated id.
    pub fn new_instance() -> Self {
        Self::by_id(Uuid::new_v4())
    }

    pub fn any_runnable() -> Self {
        Self {
            any_runnable: true,
            ..Default::default()
        }
    }

    pub fn with_associated_keys(mut self, keys: Vec<InstanceKey>) -> Self {
        self.associate_keys = keys;
        self
    }

    fn validate(&self, can_create: bool) -> Result<()> {
        if let Some(key) = &self.key {
            key.validate()?;
        }
        for key in &self.associate_keys {
            key.validate()?;
        }
        if self.instance_id.is_some_and(|id| id.is_nil()) {
            return Err(CoreError::InvalidKey {
                reason: "instance id must not be nil".to_string(),
            });
        }
        if !self.any_runnable && !can_create && self.key.is_none() && self.instance_id.is_none() {
            return Err(CoreError::InvalidKey {
                reason: "a key or an instance id is required to load an instance".to_string(),
            });
        }
        Ok(())
    }

    fn load_key(&self) -> Option<LoadKey> {
        if self.any_runnable {
            return None;
        }
        match (&self.key, self.instance_id) {
            (Some(key), _) => Some(LoadKey::Key(key.value())),
            (None, Some(id)) => Some(LoadKey::Instance(id)),
            (None, None) => None,
        }
    }
}

/// Result of one physical load attempt against the store.
#[derive(Debug)]
pub enum LoadOutcome {
    Loaded(InstanceView),
    /// Another handle of this owner holds the instance; retry through the cache.
    Conflict { instance_id: Uuid },
    NotFound,
    Error(CoreError),
}

/// Directory sizing and key behavior.
#[derive(Debug, Clone)]
pub struct DirectoryOptions {
    pub max_instances: usize,
    pub keys_globally_consistent: bool,
    /// Address published with the store owner, reported to redirected callers.
    pub host_address: Option<String>,
}

impl Default for DirectoryOptions {
    fn default() -> Self {
        Self::from(&HostConfig::default())
    }
}

impl From<&HostConfig> for DirectoryOptions {
    fn from(config: &HostConfig) -> Self {
        Self {
            max_instances: config.max_instances,
            keys_globally_consistent: config.keys_globally_consistent,
            host_address: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LoadKey {
    Instance(Uuid),
    Key(Uuid),
}

#[derive(Default)]
struct DirectoryState {
    instances: HashMap<Uuid, Arc<PersistenceContext>>,
    keys: HashMap<Uuid, Arc<PersistenceContext>>,
    loads_in_progress: HashMap<LoadKey, Arc<AsyncWaitHandle>>,
    pipelines_in_use: HashMap<Uuid, Arc<PersistencePipeline>>,
    closed: bool,
    aborted: bool,
}

enum Probe {
    Cached(Arc<PersistenceContext>),
    Wait(Arc<AsyncWaitHandle>),
    Load,
}

enum Attempt {
    Loaded(Arc<PersistenceContext>),
    Conflict(Uuid),
}

pub struct InstanceDirectory {
    self_ref: Weak<InstanceDirectory>,
    owner_id: Uuid,
    store: Option<Arc<dyn InstanceStore>>,
    services: Arc<InstanceServices>,
    options: DirectoryOptions,
    throttle: InstanceThrottle,
    owner_handle: Mutex<Option<InstanceHandle>>,
    inner: Mutex<DirectoryState>,
}

impl InstanceDirectory {
    pub fn new(
        store: Option<Arc<dyn InstanceStore>>,
        services: Arc<InstanceServices>,
        options: DirectoryOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            owner_id: Uuid::new_v4(),
            store,
            services,
            throttle: InstanceThrottle::new(options.max_instances),
            options,
            owner_handle: Mutex::new(None),
            inner: Mutex::new(DirectoryState::default()),
        })
    }

    pub fn owner_id(&self) -> Uuid {
        self.owner_id
    }

    pub fn can_persist(&self) -> bool {
        self.store.is_some()
    }

    pub fn throttle(&self) -> &InstanceThrottle {
        &self.throttle
    }

    pub fn services(&self) -> &Arc<InstanceServices> {
        &self.services
    }

    pub fn cached_count(&self) -> usize {
        lock(&self.inner).instances.len()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }

    pub fn is_aborted(&self) -> bool {
        lock(&self.inner).aborted
    }

    /// Register this directory as an owner with the store.
    #[instrument(skip(self), fields(owner_id = %self.owner_id))]
    pub async fn open(&self, timeout: Duration) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let handle = InstanceHandle::new(self.owner_id);
        let mut metadata = BTreeMap::new();
        if let Some(address) = &self.options.host_address {
            metadata.insert("address".to_string(), Value::from(address.as_str()));
        }
        store
            .execute(&handle, StoreCommand::CreateOwner { metadata }, timeout)
            .await
            .map_err(|err| CoreError::from_store(err, self.services.retry_on_cancel()))?;
        *lock(&self.owner_handle) = Some(handle);
        info!("Instance directory opened");
        Ok(())
    }

    /// Resolve a cached context or load one, creating the instance if needed.
    pub async fn load_or_create(
        &self,
        request: LoadRequest,
        transaction: Option<&Transaction>,
        timeout: Duration,
    ) -> Result<(Arc<PersistenceContext>, bool)> {
        self.resolve(request, true, transaction, timeout).await
    }

    /// Resolve a cached context or load an existing instance.
    pub async fn load(
        &self,
        request: LoadRequest,
        transaction: Option<&Transaction>,
        timeout: Duration,
    ) -> Result<(Arc<PersistenceContext>, bool)> {
        self.resolve(request, false, transaction, timeout).await
    }

    #[instrument(
        skip(self, request, transaction),
        fields(
            instance_id = ?request.instance_id,
            key = ?request.key.as_ref().map(InstanceKey::value),
        )
    )]
    async fn resolve(
        &self,
        request: LoadRequest,
        can_create: bool,
        transaction: Option<&Transaction>,
        timeout: Duration,
    ) -> Result<(Arc<PersistenceContext>, bool)> {
        request.validate(can_create)?;
        let helper = TimeoutHelper::new(timeout);
        let load_key = request.load_key();

        loop {
            match self.probe(&request, load_key.as_ref(), can_create)? {
                Probe::Cached(context) => {
                    context.enlist(transaction, helper.remaining()).await?;
                    if context.is_aborted() {
                        debug!(instance_id = %context.instance_id(), "Cached context aborted while enlisting, retrying");
                        continue;
                    }
                    return Ok((context, true));
                }
                Probe::Wait(handle) => {
                    if !handle.wait(helper.remaining()).await {
                        return Err(CoreError::timeout("load instance", timeout));
                    }
                }
                Probe::Load => {
                    let mut guard = LoadGuard::new(self, load_key.clone());
                    let instance_id = match self
                        .load_once(&request, can_create, transaction, &helper, &mut guard)
                        .await?
                    {
                        Attempt::Loaded(context) => return Ok((context, false)),
                        Attempt::Conflict(instance_id) => instance_id,
                    };
                    drop(guard);

                    // The store may still map the key to an instance the
                    // cache no longer indexes under it.
                    let cached = lock(&self.inner).instances.get(&instance_id).cloned();
                    if let Some(context) = cached {
                        context.enlist(transaction, helper.remaining()).await?;
                        if !context.is_aborted() {
                            return Ok((context, true));
                        }
                    }
                    if helper.is_expired() {
                        return Err(CoreError::timeout("load instance", timeout));
                    }
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    fn probe(
        &self,
        request: &LoadRequest,
        load_key: Option<&LoadKey>,
        can_create: bool,
    ) -> Result<Probe> {
        let mut inner = lock(&self.inner);
        if inner.aborted || inner.closed {
            return Err(CoreError::OperationCanceled {
                detail: "instance directory is closed".to_string(),
            });
        }

        if let Some(context) = Self::lookup(&inner, request) {
            return Ok(Probe::Cached(context));
        }
        if self.store.is_none() && !can_create {
            return Err(CoreError::InstanceNotReady {
                instance_id: request.instance_id,
            });
        }

        if let Some(load_key) = load_key {
            if let Some(handle) = inner.loads_in_progress.get(load_key) {
                return Ok(Probe::Wait(handle.clone()));
            }
            inner
                .loads_in_progress
                .insert(load_key.clone(), Arc::new(AsyncWaitHandle::new()));
        }
        Ok(Probe::Load)
    }

    fn lookup(inner: &DirectoryState, request: &LoadRequest) -> Option<Arc<PersistenceContext>> {
        if let Some(context) = request
            .instance_id
            .and_then(|id| inner.instances.get(&id))
        {
            return Some(context.clone());
        }
        request
            .key
            .as_ref()
            .and_then(|key| inner.keys.get(&key.value()))
            .cloned()
    }

    /// One physical load. [`Attempt::Conflict`] means the store reported a
    /// handle conflict and the caller should go back through the cache.
    async fn load_once(
        &self,
        request: &LoadRequest,
        can_create: bool,
        transaction: Option<&Transaction>,
        helper: &TimeoutHelper,
        guard: &mut LoadGuard<'_>,
    ) -> Result<Attempt> {
        self.throttle.acquire(helper.remaining()).await?;
        guard.throttle_held = true;

        let (instance_id, binding, view) = match &self.store {
            Some(store) => {
                let handle = InstanceHandle::new(self.owner_id);
                guard.handle = Some(handle.clone());
                match self
                    .load_from_store(store.as_ref(), &handle, request, can_create, helper.remaining())
                    .await
                {
                    LoadOutcome::Loaded(view) => {
                        let instance_id = view.instance_id.or_else(|| handle.instance_id()).ok_or_else(|| {
                            CoreError::Persistence {
                                operation: "load".to_string(),
                                details: "store returned a view without an instance id".to_string(),
                            }
                        })?;
                        let binding = StoreBinding {
                            store: store.clone(),
                            handle,
                        };
                        (instance_id, Some(binding), Some(view))
                    }
                    LoadOutcome::Conflict { instance_id } => {
                        debug!(%instance_id, "Instance handle conflict, retrying through the cache");
                        return Ok(Attempt::Conflict(instance_id));
                    }
                    LoadOutcome::NotFound => {
                        return Err(CoreError::InstanceNotReady {
                            instance_id: request.instance_id,
                        });
                    }
                    LoadOutcome::Error(err) => return Err(err),
                }
            }
            None => (request.instance_id.unwrap_or_else(Uuid::new_v4), None, None),
        };

        if let Some(view) = &view
            && !self.services.persistence_modules.is_empty()
        {
            let pipeline = Arc::new(PersistencePipeline::new(
                self.services.persistence_modules.clone(),
            ));
            self.register_pipeline(&pipeline)?;
            guard.pipeline = Some(pipeline.id());
            pipeline.on_load(view).await?;
        }

        let keys: Vec<InstanceKey> = request
            .key
            .iter()
            .chain(request.associate_keys.iter())
            .cloned()
            .collect();
        let context = PersistenceContext::new(
            instance_id,
            self.self_ref.clone(),
            binding,
            view.as_ref(),
            keys,
            self.options.keys_globally_consistent,
        );
        guard.context = Some(context.clone());
        context.open();

        let controller = InstanceController::create(&context, view.as_ref(), self.services.clone())?;
        context.bind_controller(controller);

        context.enlist(transaction, helper.remaining()).await?;

        self.insert(&context)?;
        guard.cached = true;
        info!(
            instance_id = %instance_id,
            initialized = context.is_initialized(),
            "Instance loaded"
        );
        Ok(Attempt::Loaded(context))
    }

    async fn load_from_store(
        &self,
        store: &dyn InstanceStore,
        handle: &InstanceHandle,
        request: &LoadRequest,
        can_create: bool,
        timeout: Duration,
    ) -> LoadOutcome {
        let command = if request.any_runnable {
            StoreCommand::LoadRunnable
        } else if can_create {
            StoreCommand::LoadOrCreate {
                instance_id: request.instance_id,
                key: request.key.clone(),
                associate_keys: request.associate_keys.clone(),
            }
        } else if let Some(key) = &request.key {
            StoreCommand::LoadByKey {
                key: key.clone(),
                associate_keys: request.associate_keys.clone(),
            }
        } else if let Some(instance_id) = request.instance_id {
            StoreCommand::LoadById { instance_id }
        } else {
            return LoadOutcome::NotFound;
        };

        match store.execute(handle, command, timeout).await {
            Ok(view) => LoadOutcome::Loaded(view),
            Err(StoreError::HandleConflict { instance_id }) => LoadOutcome::Conflict { instance_id },
            Err(StoreError::InstanceNotReady { .. }) | Err(StoreError::KeyNotReady { .. }) => {
                LoadOutcome::NotFound
            }
            Err(err) => {
                LoadOutcome::Error(CoreError::from_store(err, self.services.retry_on_cancel()))
            }
        }
    }

    /// Put a loaded context in the cache, evicting any stale context found
    /// under the same identity or one of its keys.
    fn insert(&self, context: &Arc<PersistenceContext>) -> Result<()> {
        let instance_id = context.instance_id();
        let keys = context.keys();
        let stale = {
            let mut inner = lock(&self.inner);
            if inner.aborted || inner.closed {
                return Err(CoreError::OperationCanceled {
                    detail: "instance directory is closed".to_string(),
                });
            }

            let mut stale: Vec<Arc<PersistenceContext>> = Vec::new();
            if let Some(old) = inner.instances.get(&instance_id) {
                stale.push(old.clone());
            }
            for key in &keys {
                if let Some(old) = inner.keys.get(&key.value())
                    && !Arc::ptr_eq(old, context)
                    && !stale.iter().any(|s| Arc::ptr_eq(s, old))
                {
                    stale.push(old.clone());
                }
            }

            let mut evicted = Vec::new();
            for old in stale {
                let cached = inner
                    .instances
                    .get(&old.instance_id())
                    .is_some_and(|c| Arc::ptr_eq(c, &old));
                if cached {
                    inner.instances.remove(&old.instance_id());
                }
                inner.keys.retain(|_, c| !Arc::ptr_eq(c, &old));
                evicted.push((old, cached));
            }

            inner.instances.insert(instance_id, context.clone());
            for key in &keys {
                inner.keys.insert(key.value(), context.clone());
            }
            context.set_visible(true);
            evicted
        };

        for (old, cached) in stale {
            warn!(
                instance_id = %old.instance_id(),
                replacement = %instance_id,
                "Evicting stale instance context"
            );
            old.set_visible(false);
            if cached {
                self.throttle.release();
            }
            old.abort();
        }
        Ok(())
    }

    /// Snapshot of every cached context, for shutdown draining.
    pub fn get_contexts(&self) -> Result<Vec<Arc<PersistenceContext>>> {
        let inner = lock(&self.inner);
        if inner.aborted {
            return Err(CoreError::OperationCanceled {
                detail: "instance directory was aborted".to_string(),
            });
        }
        Ok(inner.instances.values().cloned().collect())
    }

    /// Map `keys` to `context`.
    ///
    /// Without a store, a key owned by another live context is a collision.
    /// With a store, the key is remapped and the store detects collisions
    /// when the association is saved.
    pub fn try_add_associations(&self, context: &PersistenceContext, keys: &[InstanceKey]) -> Result<()> {
        let mut inner = lock(&self.inner);
        let Some(owner) = inner
            .instances
            .get(&context.instance_id())
            .filter(|c| std::ptr::eq(Arc::as_ptr(c), context))
            .cloned()
        else {
            return Ok(());
        };

        for key in keys {
            if let Some(other) = inner.keys.get(&key.value())
                && !Arc::ptr_eq(other, &owner)
            {
                if self.store.is_none() {
                    return Err(CoreError::KeyCollision {
                        key: key.value(),
                        owner: Some(other.instance_id()),
                    });
                }
                debug!(
                    key = %key.value(),
                    from = %other.instance_id(),
                    to = %owner.instance_id(),
                    "Remapping key"
                );
            }
        }
        for key in keys {
            inner.keys.insert(key.value(), owner.clone());
        }
        Ok(())
    }

    pub fn remove_associations(&self, context: &PersistenceContext, keys: &[InstanceKey]) {
        let mut inner = lock(&self.inner);
        for key in keys {
            if inner
                .keys
                .get(&key.value())
                .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), context))
            {
                inner.keys.remove(&key.value());
            }
        }
    }

    /// Evict `context` from the cache with its keys and throttle slot.
    ///
    /// A permanent removal also completes every transaction waiter queued on
    /// the context.
    pub fn remove_instance(&self, context: &PersistenceContext, permanent: bool) {
        let removed = {
            let mut inner = lock(&self.inner);
            let cached = inner
                .instances
                .get(&context.instance_id())
                .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), context));
            if cached {
                inner.instances.remove(&context.instance_id());
            }
            inner.keys.retain(|_, c| !std::ptr::eq(Arc::as_ptr(c), context));
            cached
        };
        context.set_visible(false);

        if removed {
            self.throttle.release();
            debug!(instance_id = %context.instance_id(), permanent, "Instance removed from directory");
        }
        if permanent {
            context.flush_transaction_waiters();
        }
    }

    pub(crate) fn register_pipeline(&self, pipeline: &Arc<PersistencePipeline>) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.aborted {
            return Err(CoreError::OperationCanceled {
                detail: "instance directory was aborted".to_string(),
            });
        }
        inner.pipelines_in_use.insert(pipeline.id(), pipeline.clone());
        Ok(())
    }

    pub(crate) fn unregister_pipeline(&self, id: Uuid) {
        lock(&self.inner).pipelines_in_use.remove(&id);
    }

    /// Close the directory. A non-empty cache aborts it instead and fails.
    #[instrument(skip(self), fields(owner_id = %self.owner_id))]
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        let remaining = {
            let mut inner = lock(&self.inner);
            if inner.closed {
                return Ok(());
            }
            if inner.instances.is_empty() {
                inner.closed = true;
                None
            } else {
                Some(inner.instances.len())
            }
        };
        if let Some(count) = remaining {
            self.abort();
            return Err(CoreError::invalid_operation(format!(
                "instance directory closed with {} cached instances",
                count
            )));
        }

        let owner_handle = lock(&self.owner_handle).take();
        if let (Some(store), Some(handle)) = (&self.store, owner_handle) {
            let result = store.execute(&handle, StoreCommand::DeleteOwner, timeout).await;
            store.free_handle(&handle);
            result.map_err(|err| CoreError::from_store(err, false))?;
        }
        info!("Instance directory closed");
        Ok(())
    }

    /// Forcibly evict and abort every cached context and pipeline. Idempotent.
    pub fn abort(&self) {
        let (contexts, pipelines, waiters) = {
            let mut inner = lock(&self.inner);
            if inner.aborted {
                return;
            }
            inner.aborted = true;
            inner.closed = true;
            inner.keys.clear();
            (
                inner.instances.drain().map(|(_, c)| c).collect::<Vec<_>>(),
                inner.pipelines_in_use.drain().map(|(_, p)| p).collect::<Vec<_>>(),
                inner.loads_in_progress.drain().map(|(_, h)| h).collect::<Vec<_>>(),
            )
        };
        warn!(
            owner_id = %self.owner_id,
            instances = contexts.len(),
            "Aborting instance directory"
        );

        for context in contexts {
            context.set_visible(false);
            context.abort();
        }
        for pipeline in pipelines {
            pipeline.abort();
        }
        for waiter in waiters {
            waiter.set();
        }
        self.throttle.abort();

        if let (Some(store), Some(handle)) = (&self.store, lock(&self.owner_handle).take()) {
            store.free_handle(&handle);
        }
    }
}

/// Finalizer for one physical load; see the module docs.
struct LoadGuard<'a> {
    directory: &'a InstanceDirectory,
    load_key: Option<LoadKey>,
    throttle_held: bool,
    pipeline: Option<Uuid>,
    handle: Option<InstanceHandle>,
    context: Option<Arc<PersistenceContext>>,
    cached: bool,
}

impl<'a> LoadGuard<'a> {
    fn new(directory: &'a InstanceDirectory, load_key: Option<LoadKey>) -> Self {
        Self {
            directory,
            load_key,
            throttle_held: false,
            pipeline: None,
            handle: None,
            context: None,
            cached: false,
        }
    }
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        let directory = self.directory;
        if let Some(id) = self.pipeline.take() {
            directory.unregister_pipeline(id);
        }

        if !self.cached {
            if let Some(context) = self.context.take() {
                context.abort();
            } else if let (Some(store), Some(handle)) = (&directory.store, self.handle.take()) {
                store.free_handle(&handle);
            }
            if self.throttle_held {
                directory.throttle.release();
            }
        }

        if let Some(load_key) = self.load_key.take() {
            let waiters = lock(&directory.inner).loads_in_progress.remove(&load_key);
            if let Some(waiters) = waiters {
                waiters.set();
            }
        }
    }
}
