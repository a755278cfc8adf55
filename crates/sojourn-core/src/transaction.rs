// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ambient transactions and the two-phase enlistment protocol.
//!
//! Transactions are identified by a [`TransactionId`] that stays stable for
//! the transaction's lifetime; every component compares transactions by id.
//! Enlisted participants receive [`EnlistmentNotification`] callbacks
//! synchronously from [`Transaction::commit`], [`Transaction::rollback`] and
//! [`Transaction::mark_in_doubt`].

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::sync::lock;

/// Stable identity of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Preparing,
    Committed,
    Aborted,
    InDoubt,
}

#[derive(Debug, Clone, Error)]
pub enum TransactionError {
    #[error("transaction {id} is not active ({status:?})")]
    NotActive {
        id: TransactionId,
        status: TransactionStatus,
    },

    #[error("transaction {id} aborted: {reason}")]
    Aborted { id: TransactionId, reason: String },
}

/// Participant in a transaction's two-phase commit.
pub trait EnlistmentNotification: Send + Sync {
    /// Phase one vote. Returning an error aborts the transaction.
    fn prepare(&self) -> Result<(), String> {
        Ok(())
    }

    fn commit(&self);

    fn rollback(&self);

    fn in_doubt(&self);
}

struct TransactionInner {
    id: TransactionId,
    state: Mutex<TransactionState>,
}

struct TransactionState {
    status: TransactionStatus,
    enlistments: Vec<Arc<dyn EnlistmentNotification>>,
}

/// Handle to an ambient transaction. Clones share the same transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                id: TransactionId::new(),
                state: Mutex::new(TransactionState {
                    status: TransactionStatus::Active,
                    enlistments: Vec::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    pub fn status(&self) -> TransactionStatus {
        lock(&self.inner.state).status
    }

    pub fn is_active(&self) -> bool {
        self.status() == TransactionStatus::Active
    }

    pub fn enlistment_count(&self) -> usize {
        lock(&self.inner.state).enlistments.len()
    }

    /// Register a participant for the outcome of this transaction.
    pub fn enlist_volatile(
        &self,
        notification: Arc<dyn EnlistmentNotification>,
    ) -> Result<(), TransactionError> {
        let mut state = lock(&self.inner.state);
        if state.status != TransactionStatus::Active {
            return Err(TransactionError::NotActive {
                id: self.inner.id,
                status: state.status,
            });
        }
        state.enlistments.push(notification);
        Ok(())
    }

    /// Run both commit phases. A failed prepare vote rolls every participant back.
    pub fn commit(&self) -> Result<(), TransactionError> {
        let enlistments = {
            let mut state = lock(&self.inner.state);
            if state.status != TransactionStatus::Active {
                return Err(TransactionError::NotActive {
                    id: self.inner.id,
                    status: state.status,
                });
            }
            state.status = TransactionStatus::Preparing;
            state.enlistments.clone()
        };

        for enlistment in &enlistments {
            if let Err(reason) = enlistment.prepare() {
                warn!(transaction = %self.inner.id, %reason, "Participant voted to abort");
                if let Some(enlistments) =
                    self.finish(&[TransactionStatus::Preparing], TransactionStatus::Aborted)
                {
                    for enlistment in &enlistments {
                        enlistment.rollback();
                    }
                }
                return Err(TransactionError::Aborted {
                    id: self.inner.id,
                    reason,
                });
            }
        }

        let Some(enlistments) =
            self.finish(&[TransactionStatus::Preparing], TransactionStatus::Committed)
        else {
            return Err(TransactionError::Aborted {
                id: self.inner.id,
                reason: "transaction ended while preparing".to_string(),
            });
        };
        debug!(transaction = %self.inner.id, participants = enlistments.len(), "Transaction committed");
        for enlistment in &enlistments {
            enlistment.commit();
        }
        Ok(())
    }

    pub fn rollback(&self) {
        let Some(enlistments) = self.finish(OPEN, TransactionStatus::Aborted) else {
            return;
        };
        debug!(transaction = %self.inner.id, participants = enlistments.len(), "Transaction rolled back");
        for enlistment in &enlistments {
            enlistment.rollback();
        }
    }

    /// The transaction manager lost track of the outcome.
    pub fn mark_in_doubt(&self) {
        let Some(enlistments) = self.finish(OPEN, TransactionStatus::InDoubt) else {
            return;
        };
        warn!(transaction = %self.inner.id, "Transaction outcome is in doubt");
        for enlistment in &enlistments {
            enlistment.in_doubt();
        }
    }

    /// Move to `status` only from one of `from`; the winner takes the participants.
    fn finish(
        &self,
        from: &[TransactionStatus],
        status: TransactionStatus,
    ) -> Option<Vec<Arc<dyn EnlistmentNotification>>> {
        let mut state = lock(&self.inner.state);
        if !from.contains(&state.status) {
            return None;
        }
        state.status = status;
        Some(std::mem::take(&mut state.enlistments))
    }
}

const OPEN: &[TransactionStatus] = &[TransactionStatus::Active, TransactionStatus::Preparing];

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Transaction {}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}
