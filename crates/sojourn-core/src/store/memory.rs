// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process instance store.
//!
//! Keeps owners, instances and keys in memory with the same locking and
//! binding rules as the SQLite store. It also records every command it
//! executes and can inject faults or latency, which the directory and
//! controller tests rely on.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::{
    CommandKind, InstanceHandle, InstanceStore, InstanceView, SaveCommand, StoreCommand,
    StoreError,
};
use crate::model::{InstanceData, InstanceKey, names};
use crate::sync::lock;

/// One executed command, as recorded by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub kind: CommandKind,
    pub instance_id: Option<Uuid>,
    /// Save carried instance data.
    pub saved_data: bool,
    pub unlock: bool,
    pub complete: bool,
}

#[derive(Debug, Clone)]
struct StoredInstance {
    data: InstanceData,
    metadata: BTreeMap<String, Value>,
    lock_owner: Option<Uuid>,
    is_initialized: bool,
    is_completed: bool,
}

#[derive(Debug, Clone)]
struct StoredKey {
    instance_id: Uuid,
    metadata: BTreeMap<String, Value>,
    is_completed: bool,
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    handle_id: Uuid,
    owner_id: Uuid,
}

#[derive(Default)]
struct MemoryState {
    owners: HashMap<Uuid, BTreeMap<String, Value>>,
    instances: HashMap<Uuid, StoredInstance>,
    keys: HashMap<Uuid, StoredKey>,
    bindings: HashMap<Uuid, Binding>,
}

/// In-memory [`InstanceStore`].
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    log: Mutex<Vec<CommandRecord>>,
    faults: Mutex<HashMap<CommandKind, VecDeque<StoreError>>>,
    latency: Mutex<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every command by `latency` before it touches state.
    pub fn with_latency(self, latency: Duration) -> Self {
        *lock(&self.latency) = latency;
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// Fail the next command of `kind` with `error`.
    pub fn inject_fault(&self, kind: CommandKind, error: StoreError) {
        lock(&self.faults).entry(kind).or_default().push_back(error);
    }

    pub fn commands(&self) -> Vec<CommandRecord> {
        lock(&self.log).clone()
    }

    pub fn command_count(&self, kind: CommandKind) -> usize {
        lock(&self.log).iter().filter(|c| c.kind == kind).count()
    }

    pub fn saves_for(&self, instance_id: Uuid) -> Vec<CommandRecord> {
        lock(&self.log)
            .iter()
            .filter(|c| c.kind == CommandKind::Save && c.instance_id == Some(instance_id))
            .cloned()
            .collect()
    }

    /// Pre-populate an unlocked, initialized instance.
    pub fn seed_instance(&self, instance_id: Uuid, data: InstanceData, keys: &[InstanceKey]) {
        let mut state = lock(&self.state);
        state.instances.insert(
            instance_id,
            StoredInstance {
                data,
                metadata: BTreeMap::new(),
                lock_owner: None,
                is_initialized: true,
                is_completed: false,
            },
        );
        for key in keys {
            state.keys.insert(
                key.value(),
                StoredKey {
                    instance_id,
                    metadata: key.metadata().clone(),
                    is_completed: false,
                },
            );
        }
    }

    /// Lock an instance for a foreign owner, as another host would.
    pub fn lock_for_owner(&self, instance_id: Uuid, owner_id: Uuid, address: Option<&str>) {
        let mut state = lock(&self.state);
        let mut metadata = BTreeMap::new();
        if let Some(address) = address {
            metadata.insert("address".to_string(), Value::from(address));
        }
        state.owners.insert(owner_id, metadata);
        if let Some(instance) = state.instances.get_mut(&instance_id) {
            instance.lock_owner = Some(owner_id);
        }
        state.bindings.remove(&instance_id);
    }

    pub fn snapshot(&self, instance_id: Uuid) -> Option<InstanceView> {
        let state = lock(&self.state);
        state
            .instances
            .contains_key(&instance_id)
            .then(|| view_of(&state, instance_id))
    }

    pub fn lock_owner(&self, instance_id: Uuid) -> Option<Uuid> {
        lock(&self.state)
            .instances
            .get(&instance_id)
            .and_then(|i| i.lock_owner)
    }

    pub fn owner_count(&self) -> usize {
        lock(&self.state).owners.len()
    }

    fn take_fault(&self, kind: CommandKind) -> Option<StoreError> {
        lock(&self.faults).get_mut(&kind).and_then(VecDeque::pop_front)
    }

    fn record(&self, handle: &InstanceHandle, command: &StoreCommand) {
        let (saved_data, unlock, complete) = match command {
            StoreCommand::Save(save) => (save.instance_data.is_some(), save.unlock, save.complete),
            _ => (false, false, false),
        };
        let instance_id = match command {
            StoreCommand::LoadById { instance_id } => Some(*instance_id),
            StoreCommand::LoadOrCreate { instance_id, .. } => *instance_id,
            _ => handle.instance_id(),
        };
        lock(&self.log).push(CommandRecord {
            kind: command.kind(),
            instance_id,
            saved_data,
            unlock,
            complete,
        });
    }

    fn apply(
        &self,
        handle: &InstanceHandle,
        command: StoreCommand,
    ) -> Result<InstanceView, StoreError> {
        let mut state = lock(&self.state);
        let owner = handle.owner_id();

        match command {
            StoreCommand::CreateOwner { metadata } => {
                state.owners.insert(owner, metadata);
                Ok(InstanceView {
                    owner_id: Some(owner),
                    ..Default::default()
                })
            }
            StoreCommand::DeleteOwner => {
                state.owners.remove(&owner);
                for instance in state.instances.values_mut() {
                    if instance.lock_owner == Some(owner) {
                        instance.lock_owner = None;
                    }
                }
                state.bindings.retain(|_, b| b.owner_id != owner);
                Ok(InstanceView {
                    owner_id: Some(owner),
                    ..Default::default()
                })
            }
            StoreCommand::LoadById { instance_id } => {
                match state.instances.get(&instance_id) {
                    Some(instance) if !instance.is_completed => {}
                    _ => {
                        return Err(StoreError::InstanceNotReady {
                            instance_id: Some(instance_id),
                        });
                    }
                }
                lock_instance(&mut state, handle, instance_id)?;
                Ok(view_of(&state, instance_id))
            }
            StoreCommand::LoadByKey {
                key,
                associate_keys,
            } => {
                let instance_id = match state.keys.get(&key.value()) {
                    Some(stored) if !stored.is_completed => stored.instance_id,
                    _ => return Err(StoreError::KeyNotReady { key: key.value() }),
                };
                check_collisions(&state, instance_id, &associate_keys)?;
                lock_instance(&mut state, handle, instance_id)?;
                associate(&mut state, instance_id, &associate_keys);
                Ok(view_of(&state, instance_id))
            }
            StoreCommand::LoadOrCreate {
                instance_id,
                key,
                associate_keys,
            } => {
                let existing = match &key {
                    Some(key) => match state.keys.get(&key.value()) {
                        Some(stored) if stored.is_completed => {
                            return Err(StoreError::KeyNotReady { key: key.value() });
                        }
                        Some(stored) => Some(stored.instance_id),
                        None => None,
                    },
                    None => None,
                };
                let existing = existing.or_else(|| {
                    instance_id.filter(|id| state.instances.contains_key(id))
                });

                let mut keys: Vec<InstanceKey> = key.into_iter().collect();
                keys.extend(associate_keys);

                let instance_id = match existing {
                    Some(id) => {
                        if state.instances.get(&id).is_some_and(|i| i.is_completed) {
                            return Err(StoreError::InstanceNotReady {
                                instance_id: Some(id),
                            });
                        }
                        check_collisions(&state, id, &keys)?;
                        lock_instance(&mut state, handle, id)?;
                        id
                    }
                    None => {
                        let id = instance_id.unwrap_or_else(Uuid::new_v4);
                        check_collisions(&state, id, &keys)?;
                        state.instances.insert(
                            id,
                            StoredInstance {
                                data: InstanceData::new(),
                                metadata: BTreeMap::new(),
                                lock_owner: None,
                                is_initialized: false,
                                is_completed: false,
                            },
                        );
                        lock_instance(&mut state, handle, id)?;
                        id
                    }
                };
                associate(&mut state, instance_id, &keys);
                Ok(view_of(&state, instance_id))
            }
            StoreCommand::LoadRunnable => {
                let candidate = state
                    .instances
                    .iter()
                    .find(|(_, i)| {
                        i.lock_owner.is_none()
                            && i.is_initialized
                            && !i.is_completed
                            && i.metadata.get(names::STATUS).and_then(Value::as_str)
                                == Some("Runnable")
                    })
                    .map(|(id, _)| *id);
                let instance_id =
                    candidate.ok_or(StoreError::InstanceNotReady { instance_id: None })?;
                lock_instance(&mut state, handle, instance_id)?;
                Ok(view_of(&state, instance_id))
            }
            StoreCommand::Save(save) => {
                let instance_id = handle
                    .instance_id()
                    .ok_or(StoreError::InstanceNotReady { instance_id: None })?;
                save_instance(&mut state, handle, instance_id, save)?;
                Ok(view_of(&state, instance_id))
            }
        }
    }
}

fn lock_instance(
    state: &mut MemoryState,
    handle: &InstanceHandle,
    instance_id: Uuid,
) -> Result<(), StoreError> {
    let owner = handle.owner_id();
    let lock_owner = state
        .instances
        .get(&instance_id)
        .ok_or(StoreError::InstanceNotReady {
            instance_id: Some(instance_id),
        })?
        .lock_owner;

    if let Some(other) = lock_owner
        && other != owner
    {
        let address = state
            .owners
            .get(&other)
            .and_then(|m| m.get("address"))
            .and_then(Value::as_str)
            .map(str::to_string);
        return Err(StoreError::InstanceLocked {
            instance_id: Some(instance_id),
            owner_id: Some(other),
            address,
        });
    }

    if let Some(binding) = state.bindings.get(&instance_id)
        && binding.handle_id != handle.id()
    {
        return Err(StoreError::HandleConflict { instance_id });
    }

    if let Some(instance) = state.instances.get_mut(&instance_id) {
        instance.lock_owner = Some(owner);
    }
    state.bindings.insert(
        instance_id,
        Binding {
            handle_id: handle.id(),
            owner_id: owner,
        },
    );
    handle.bind(instance_id);
    Ok(())
}

fn check_collisions(
    state: &MemoryState,
    instance_id: Uuid,
    keys: &[InstanceKey],
) -> Result<(), StoreError> {
    for key in keys {
        if let Some(stored) = state.keys.get(&key.value())
            && stored.instance_id != instance_id
        {
            return Err(StoreError::KeyCollision {
                key: key.value(),
                owner: Some(stored.instance_id),
            });
        }
    }
    Ok(())
}

fn associate(state: &mut MemoryState, instance_id: Uuid, keys: &[InstanceKey]) {
    for key in keys {
        state.keys.entry(key.value()).or_insert_with(|| StoredKey {
            instance_id,
            metadata: key.metadata().clone(),
            is_completed: false,
        });
    }
}

fn save_instance(
    state: &mut MemoryState,
    handle: &InstanceHandle,
    instance_id: Uuid,
    save: SaveCommand,
) -> Result<(), StoreError> {
    let owner = handle.owner_id();
    let lock_owner = state
        .instances
        .get(&instance_id)
        .ok_or(StoreError::InstanceNotReady {
            instance_id: Some(instance_id),
        })?
        .lock_owner;
    if lock_owner.is_some_and(|o| o != owner) {
        return Err(StoreError::LockLost { instance_id });
    }
    if state
        .bindings
        .get(&instance_id)
        .is_some_and(|b| b.handle_id != handle.id())
    {
        return Err(StoreError::LockLost { instance_id });
    }
    check_collisions(state, instance_id, &save.keys_to_associate)?;

    associate(state, instance_id, &save.keys_to_associate);
    for key in &save.keys_to_free {
        if state.keys.get(key).is_some_and(|k| k.instance_id == instance_id) {
            state.keys.remove(key);
        }
    }

    let Some(instance) = state.instances.get_mut(&instance_id) else {
        return Err(StoreError::InstanceNotReady {
            instance_id: Some(instance_id),
        });
    };
    if let Some(data) = save.instance_data {
        instance.data = data;
        instance.is_initialized = true;
    }
    for (name, value) in save.instance_metadata {
        if value.is_null() {
            instance.metadata.remove(&name);
        } else {
            instance.metadata.insert(name, value);
        }
    }

    if save.complete {
        instance.is_completed = true;
        instance.data = InstanceData::new();
        instance.lock_owner = None;
        for key in state.keys.values_mut() {
            if key.instance_id == instance_id {
                key.is_completed = true;
            }
        }
        state.bindings.remove(&instance_id);
    } else if save.unlock {
        instance.lock_owner = None;
        state.bindings.remove(&instance_id);
    } else {
        instance.lock_owner = Some(owner);
        state.bindings.insert(
            instance_id,
            Binding {
                handle_id: handle.id(),
                owner_id: owner,
            },
        );
    }
    Ok(())
}

fn view_of(state: &MemoryState, instance_id: Uuid) -> InstanceView {
    let Some(instance) = state.instances.get(&instance_id) else {
        return InstanceView {
            instance_id: Some(instance_id),
            ..Default::default()
        };
    };
    let keys = state
        .keys
        .iter()
        .filter(|(_, k)| k.instance_id == instance_id && !k.is_completed)
        .map(|(value, k)| {
            let mut key = InstanceKey::new(*value);
            for (name, meta) in &k.metadata {
                key = key.with_metadata(name.clone(), meta.clone());
            }
            key
        })
        .collect();
    InstanceView {
        owner_id: instance.lock_owner,
        instance_id: Some(instance_id),
        data: instance.data.clone(),
        metadata: instance.metadata.clone(),
        keys,
        is_locked: instance.lock_owner.is_some(),
        is_initialized: instance.is_initialized,
        is_completed: instance.is_completed,
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn execute(
        &self,
        handle: &InstanceHandle,
        command: StoreCommand,
        timeout: Duration,
    ) -> Result<InstanceView, StoreError> {
        if !handle.is_valid() {
            return Err(StoreError::OperationCanceled);
        }

        let run = async {
            let latency = *lock(&self.latency);
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if !handle.is_valid() {
                return Err(StoreError::OperationCanceled);
            }
            self.record(handle, &command);
            if let Some(fault) = self.take_fault(command.kind()) {
                debug!(kind = ?command.kind(), error = %fault, "Injected store fault");
                return Err(fault);
            }
            self.apply(handle, command)
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(timeout)),
        }
    }

    fn free_handle(&self, handle: &InstanceHandle) {
        handle.invalidate();
        if let Some(instance_id) = handle.instance_id() {
            let mut state = lock(&self.state);
            if state
                .bindings
                .get(&instance_id)
                .is_some_and(|b| b.handle_id == handle.id())
            {
                state.bindings.remove(&instance_id);
            }
        }
    }
}
