// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for sojourn-core.
//!
//! [`CoreError`] is the fault vocabulary callers see. Storage-layer failures
//! ([`StoreError`]) are classified into it at the directory and controller
//! boundary and never leak past it.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;
use crate::transaction::TransactionError;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Faults raised by directory, persistence context and controller operations.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// The instance does not exist, or is no longer reachable (completed or aborted).
    #[error("Instance {} not found", display_id(.instance_id))]
    InstanceNotFound { instance_id: Option<Uuid> },

    /// The instance was terminated.
    #[error("Instance '{instance_id}' was terminated: {reason}")]
    InstanceTerminated { instance_id: Uuid, reason: String },

    /// The instance ran to completion.
    #[error("Instance '{instance_id}' has completed")]
    InstanceCompleted { instance_id: Uuid },

    /// The in-memory instance was unloaded; a fresh load may succeed.
    #[error("Instance '{instance_id}' has been unloaded")]
    InstanceUnloaded { instance_id: Uuid },

    /// The instance was aborted and cannot process further operations.
    #[error("Instance '{instance_id}' was aborted: {reason}")]
    InstanceAborted { instance_id: Uuid, reason: String },

    /// The operation is not allowed while the instance is suspended.
    #[error("Instance '{instance_id}' is suspended; '{operation}' is not allowed")]
    InstanceSuspended {
        instance_id: Uuid,
        operation: &'static str,
    },

    /// The instance cannot be created and was not found.
    #[error("Instance {} is not ready", display_id(.instance_id))]
    InstanceNotReady { instance_id: Option<Uuid> },

    /// The workflow raised an exception it did not handle.
    #[error("Instance '{instance_id}' raised an unhandled exception: {message}")]
    UnhandledException { instance_id: Uuid, message: String },

    /// Applying a definition update failed.
    #[error("Update of instance '{instance_id}' failed: {reason}")]
    UpdateFailed { instance_id: Uuid, reason: String },

    /// The instance is attached to a different transaction.
    #[error("Instance '{instance_id}' is locked by another transaction; '{operation}' rejected")]
    TransactedLock {
        instance_id: Uuid,
        operation: &'static str,
    },

    /// The instance is locked by another owner; the caller should redirect.
    #[error("Instance {} is locked by owner {}", display_id(.instance_id), display_id(.owner_id))]
    Redirection {
        instance_id: Option<Uuid>,
        owner_id: Option<Uuid>,
        address: Option<String>,
    },

    /// A correlation key or identity was malformed.
    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    /// A correlation key is already owned by another live instance.
    #[error("Key '{key}' is already associated with instance {}", display_id(.owner))]
    KeyCollision { key: Uuid, owner: Option<Uuid> },

    /// The storage handle was invalidated (shutdown, lock loss).
    #[error("Communication object aborted: {detail}")]
    CommunicationObjectAborted { detail: String },

    /// The directory was aborted while the call was in progress.
    #[error("Operation canceled: {detail}")]
    OperationCanceled { detail: String },

    /// The operation raced a teardown and may be retried.
    #[error("Operation should be retried: {detail}")]
    Retryable { detail: String },

    /// A wait exceeded its timeout.
    #[error("Operation '{operation}' timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The call violated an operation contract (for example saving a completed context).
    #[error("Invalid operation: {message}")]
    InvalidOperation { message: String },

    /// A storage failure that has no more specific classification.
    #[error("Persistence error during '{operation}': {details}")]
    Persistence { operation: String, details: String },

    /// Invalid host configuration.
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

fn display_id(id: &Option<Uuid>) -> String {
    match id {
        Some(id) => format!("'{}'", id),
        None => "<unknown>".to_string(),
    }
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            Self::InstanceTerminated { .. } => "INSTANCE_TERMINATED",
            Self::InstanceCompleted { .. } => "INSTANCE_COMPLETED",
            Self::InstanceUnloaded { .. } => "INSTANCE_UNLOADED",
            Self::InstanceAborted { .. } => "INSTANCE_ABORTED",
            Self::InstanceSuspended { .. } => "INSTANCE_SUSPENDED",
            Self::InstanceNotReady { .. } => "INSTANCE_NOT_READY",
            Self::UnhandledException { .. } => "UNHANDLED_EXCEPTION",
            Self::UpdateFailed { .. } => "UPDATE_FAILED",
            Self::TransactedLock { .. } => "TRANSACTED_LOCK",
            Self::Redirection { .. } => "REDIRECTION",
            Self::InvalidKey { .. } => "INVALID_KEY",
            Self::KeyCollision { .. } => "KEY_COLLISION",
            Self::CommunicationObjectAborted { .. } => "COMMUNICATION_OBJECT_ABORTED",
            Self::OperationCanceled { .. } => "OPERATION_CANCELED",
            Self::Retryable { .. } => "RETRYABLE",
            Self::Timeout { .. } => "TIMEOUT",
            Self::InvalidOperation { .. } => "INVALID_OPERATION",
            Self::Persistence { .. } => "PERSISTENCE_ERROR",
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
        }
    }

    /// Timeouts propagate unwrapped so callers can decide whether to retry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Faults that mean the instance is gone from this host.
    pub fn is_instance_gone(&self) -> bool {
        matches!(
            self,
            Self::InstanceAborted { .. }
                | Self::InstanceUnloaded { .. }
                | Self::InstanceNotFound { .. }
                | Self::CommunicationObjectAborted { .. }
        )
    }

    pub(crate) fn timeout(operation: &'static str, timeout: Duration) -> Self {
        Self::Timeout { operation, timeout }
    }

    pub(crate) fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Classify a storage failure into the caller-visible vocabulary.
    ///
    /// `retry_on_cancel` selects the buffered-receive behaviour: a cancelled
    /// store operation becomes [`CoreError::Retryable`] instead of
    /// [`CoreError::CommunicationObjectAborted`].
    pub fn from_store(err: StoreError, retry_on_cancel: bool) -> Self {
        match err {
            StoreError::InstanceLocked {
                instance_id,
                owner_id,
                address,
            } => Self::Redirection {
                instance_id,
                owner_id,
                address,
            },
            StoreError::InstanceNotReady { instance_id } => {
                Self::InstanceNotFound { instance_id }
            }
            StoreError::KeyNotReady { .. } => Self::InstanceNotFound { instance_id: None },
            StoreError::KeyCollision { key, owner } => Self::KeyCollision { key, owner },
            StoreError::OperationCanceled if retry_on_cancel => Self::Retryable {
                detail: "instance handle was freed".to_string(),
            },
            StoreError::OperationCanceled => Self::CommunicationObjectAborted {
                detail: "instance handle was freed".to_string(),
            },
            StoreError::LockLost { instance_id } => Self::CommunicationObjectAborted {
                detail: format!("lock on instance '{}' was lost", instance_id),
            },
            StoreError::HandleConflict { instance_id } => Self::Retryable {
                detail: format!("instance '{}' is bound to another handle", instance_id),
            },
            StoreError::Timeout(timeout) => Self::Timeout {
                operation: "store command",
                timeout,
            },
            StoreError::Backend { operation, details } => Self::Persistence {
                operation,
                details,
            },
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        CoreError::from_store(err, false)
    }
}

impl From<TransactionError> for CoreError {
    fn from(err: TransactionError) -> Self {
        match err {
            TransactionError::Aborted { id, reason } => Self::CommunicationObjectAborted {
                detail: format!("transaction {} aborted: {}", id, reason),
            },
            other => Self::InvalidOperation {
                message: other.to_string(),
            },
        }
    }
}
