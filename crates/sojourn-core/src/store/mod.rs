// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command-based instance store interface and backends.
//!
//! The directory and persistence contexts talk to durable storage only
//! through [`InstanceStore::execute`]. A handle is bound to an owner (the
//! hosting directory) and, after a successful load, to one instance. Failures
//! are reported as typed [`StoreError`]s which callers classify; they are
//! never surfaced unchanged to the caller of a directory or controller
//! operation.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use self::memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use self::sqlite::SqliteStore;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{InstanceData, InstanceKey, names};
use crate::sync::lock;

/// Storage-layer failures.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The instance is locked by another owner.
    #[error("instance {instance_id:?} is locked by owner {owner_id:?}")]
    InstanceLocked {
        instance_id: Option<Uuid>,
        owner_id: Option<Uuid>,
        address: Option<String>,
    },

    /// Another handle of the same owner is already bound to the instance.
    #[error("instance {instance_id} is already bound to another handle")]
    HandleConflict { instance_id: Uuid },

    /// The owner no longer holds the instance lock.
    #[error("lock on instance {instance_id} was lost")]
    LockLost { instance_id: Uuid },

    /// The instance does not exist (or is completed) and could not be created.
    #[error("instance {instance_id:?} is not ready")]
    InstanceNotReady { instance_id: Option<Uuid> },

    /// The key does not exist or is completed.
    #[error("key {key} is not ready")]
    KeyNotReady { key: Uuid },

    /// The key is associated with a different instance.
    #[error("key {key} is already associated with instance {owner:?}")]
    KeyCollision { key: Uuid, owner: Option<Uuid> },

    /// The handle was freed while the command was pending.
    #[error("operation canceled: instance handle is no longer valid")]
    OperationCanceled,

    #[error("store command timed out after {0:?}")]
    Timeout(Duration),

    #[error("store backend error during '{operation}': {details}")]
    Backend { operation: String, details: String },
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Backend {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    CreateOwner,
    LoadById,
    LoadByKey,
    LoadOrCreate,
    LoadRunnable,
    Save,
    DeleteOwner,
}

/// Persistence commands understood by every store.
#[derive(Debug, Clone)]
pub enum StoreCommand {
    CreateOwner {
        metadata: BTreeMap<String, Value>,
    },
    LoadById {
        instance_id: Uuid,
    },
    LoadByKey {
        key: InstanceKey,
        associate_keys: Vec<InstanceKey>,
    },
    LoadOrCreate {
        instance_id: Option<Uuid>,
        key: Option<InstanceKey>,
        associate_keys: Vec<InstanceKey>,
    },
    /// Lock any unlocked, initialized instance whose status is runnable.
    LoadRunnable,
    Save(SaveCommand),
    DeleteOwner,
}

impl StoreCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::CreateOwner { .. } => CommandKind::CreateOwner,
            Self::LoadById { .. } => CommandKind::LoadById,
            Self::LoadByKey { .. } => CommandKind::LoadByKey,
            Self::LoadOrCreate { .. } => CommandKind::LoadOrCreate,
            Self::LoadRunnable => CommandKind::LoadRunnable,
            Self::Save(_) => CommandKind::Save,
            Self::DeleteOwner => CommandKind::DeleteOwner,
        }
    }
}

/// Save command built by the persistence context.
#[derive(Debug, Clone, Default)]
pub struct SaveCommand {
    /// New instance data; `None` leaves stored data untouched.
    pub instance_data: Option<InstanceData>,
    /// Metadata entries to write; `Value::Null` removes an entry.
    pub instance_metadata: BTreeMap<String, Value>,
    pub keys_to_associate: Vec<InstanceKey>,
    pub keys_to_free: Vec<Uuid>,
    pub unlock: bool,
    pub complete: bool,
}

impl SaveCommand {
    pub fn is_unlock_only(&self) -> bool {
        self.unlock
            && !self.complete
            && self.instance_data.is_none()
            && self.keys_to_associate.is_empty()
            && self.keys_to_free.is_empty()
    }
}

/// Snapshot of an instance as seen by the store after a command.
#[derive(Debug, Clone, Default)]
pub struct InstanceView {
    pub owner_id: Option<Uuid>,
    pub instance_id: Option<Uuid>,
    pub data: InstanceData,
    pub metadata: BTreeMap<String, Value>,
    pub keys: Vec<InstanceKey>,
    pub is_locked: bool,
    pub is_initialized: bool,
    pub is_completed: bool,
}

impl InstanceView {
    pub fn is_suspended(&self) -> bool {
        self.metadata
            .get(names::IS_SUSPENDED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn suspend_reason(&self) -> Option<&str> {
        self.metadata.get(names::SUSPEND_REASON).and_then(Value::as_str)
    }
}

struct HandleInner {
    id: Uuid,
    owner_id: Uuid,
    instance_id: Mutex<Option<Uuid>>,
    valid: AtomicBool,
}

/// A store handle bound to an owner and, once loaded, to an instance.
#[derive(Clone)]
pub struct InstanceHandle {
    inner: Arc<HandleInner>,
}

impl InstanceHandle {
    pub fn new(owner_id: Uuid) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: Uuid::new_v4(),
                owner_id,
                instance_id: Mutex::new(None),
                valid: AtomicBool::new(true),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn owner_id(&self) -> Uuid {
        self.inner.owner_id
    }

    pub fn instance_id(&self) -> Option<Uuid> {
        *lock(&self.inner.instance_id)
    }

    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::SeqCst)
    }

    /// Record the instance this handle was bound to by a load.
    pub fn bind(&self, instance_id: Uuid) {
        *lock(&self.inner.instance_id) = Some(instance_id);
    }

    /// Mark the handle unusable; pending and future commands are canceled.
    pub fn invalidate(&self) {
        self.inner.valid.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("id", &self.inner.id)
            .field("owner_id", &self.inner.owner_id)
            .field("instance_id", &self.instance_id())
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Command-based durable instance store.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Execute one command against `handle`, failing with
    /// [`StoreError::Timeout`] once `timeout` elapses.
    async fn execute(
        &self,
        handle: &InstanceHandle,
        command: StoreCommand,
        timeout: Duration,
    ) -> Result<InstanceView, StoreError>;

    /// Invalidate the handle and drop its instance binding. The owner keeps
    /// the durable lock until it unlocks the instance or is deleted.
    fn free_handle(&self, handle: &InstanceHandle);
}
