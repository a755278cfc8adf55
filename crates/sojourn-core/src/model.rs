// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Identity, key and persisted-data types shared across the crate.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Qualified names used in instance data and metadata maps.
pub mod names {
    pub const WORKFLOW_STATE: &str = "{urn:sojourn:workflow}State";
    pub const STATUS: &str = "{urn:sojourn:workflow}Status";
    pub const CREATION_CONTEXT: &str = "{urn:sojourn:workflow}CreationContext";
    pub const BOOKMARKS: &str = "{urn:sojourn:workflow}Bookmarks";
    pub const LAST_UPDATE: &str = "{urn:sojourn:workflow}LastUpdate";
    pub const SUSPEND_REASON: &str = "{urn:sojourn:workflow}SuspendReason";
    pub const SUSPEND_EXCEPTION: &str = "{urn:sojourn:workflow}SuspendException";
    pub const IS_SUSPENDED: &str = "{urn:sojourn:workflow}IsSuspended";
}

/// Correlation key. Equality and hashing use the key value only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceKey {
    value: Uuid,
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
}

impl InstanceKey {
    pub fn new(value: Uuid) -> Self {
        Self {
            value,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, name: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(name.into(), value);
        self
    }

    pub fn value(&self) -> Uuid {
        self.value
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    pub fn is_valid(&self) -> bool {
        !self.value.is_nil()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(CoreError::InvalidKey {
                reason: "key value must not be nil".to_string(),
            })
        }
    }
}

impl PartialEq for InstanceKey {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for InstanceKey {}

impl Hash for InstanceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key-{}", self.value)
    }
}

/// Outcome requested from a save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveStatus {
    /// Save and keep the durable lock.
    Locked,
    /// Save and release the durable lock.
    Unlocked,
    /// Save as finished; the durable record is completed.
    Completed,
}

/// Serialized instance state, keyed by qualified name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceData {
    pub values: BTreeMap<String, Value>,
}

impl InstanceData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Named resumption point exposed by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bookmark {
    pub name: String,
}

impl Bookmark {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for Bookmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookmarkResumptionResult {
    Success,
    NotFound,
    NotReady,
}

/// How a completed instance finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionState {
    Closed,
    Canceled,
    Faulted { reason: String },
}

/// Arguments an instance was created with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreationContext {
    #[serde(default)]
    pub arguments: BTreeMap<String, Value>,
    /// Save the completed instance inside a transaction even without an ambient one.
    #[serde(default)]
    pub completion_transaction_required: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_key_identity_ignores_metadata() {
        let value = Uuid::new_v4();
        let plain = InstanceKey::new(value);
        let tagged = InstanceKey::new(value).with_metadata("origin", Value::from("orders"));

        assert_eq!(plain, tagged);
        let set: HashSet<_> = [plain, tagged].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_nil_key_is_invalid() {
        let key = InstanceKey::new(Uuid::nil());
        assert!(!key.is_valid());
        assert_eq!(key.validate().unwrap_err().error_code(), "INVALID_KEY");
    }

    #[test]
    fn test_creation_context_defaults_from_json() {
        let ctx: CreationContext = serde_json::from_str("{}").unwrap();
        assert!(ctx.arguments.is_empty());
        assert!(!ctx.completion_transaction_required);
    }
}
