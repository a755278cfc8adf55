// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outcome of the transaction a control operation attached to the instance.

use std::sync::Weak;

use tracing::{debug, warn};

use super::operations::ControlOperation;
use super::{InstanceController, InstanceState};
use crate::model::CompletionState;
use crate::sync::lock;
use crate::transaction::EnlistmentNotification;

/// Volatile enlistment that detaches the instance on prepare and makes it
/// runnable again once the transaction commits.
pub(super) struct ControllerEnlistment {
    controller: Weak<InstanceController>,
}

impl ControllerEnlistment {
    pub(super) fn new(controller: Weak<InstanceController>) -> Self {
        Self { controller }
    }
}

impl EnlistmentNotification for ControllerEnlistment {
    fn prepare(&self) -> Result<(), String> {
        if let Some(controller) = self.controller.upgrade() {
            lock(&controller.state).transaction = None;
        }
        Ok(())
    }

    fn commit(&self) {
        if let Some(controller) = self.controller.upgrade() {
            crate::sync::spawn_detached(async move { controller.transaction_committed().await });
        }
    }

    fn rollback(&self) {
        if let Some(controller) = self.controller.upgrade() {
            lock(&controller.state).transaction = None;
            controller.abort_instance("transaction rolled back", false);
        }
    }

    fn in_doubt(&self) {
        if let Some(controller) = self.controller.upgrade() {
            lock(&controller.state).transaction = None;
            controller.abort_instance("transaction outcome is in doubt", false);
        }
    }
}

impl InstanceController {
    async fn transaction_committed(&self) {
        if !self.try_add_reference() {
            return;
        }

        let (state, transacted_cancel, faulted) = {
            let state = lock(&self.state);
            (
                state.state,
                state.transacted_cancel,
                matches!(state.completion, Some(CompletionState::Faulted { .. })),
            )
        };

        let cancel_pending = state == InstanceState::Suspended && transacted_cancel;
        if cancel_pending || state == InstanceState::Active {
            match self
                .acquire_lock(self.services.settings.lock_timeout, false, false)
                .await
            {
                Ok(_guard) => {
                    let resume = cancel_pending
                        || matches!(self.validate_for(ControlOperation::Run, None), Ok(true));
                    if resume {
                        let mut state = lock(&self.state);
                        state.is_runnable = true;
                        state.state = InstanceState::Active;
                        state.transacted_cancel = false;
                    }
                    debug!(instance_id = %self.instance_id, resume, "Transaction committed");
                }
                Err(err) => {
                    warn!(instance_id = %self.instance_id, error = %err, "Could not resume instance after commit");
                }
            }
        } else if state == InstanceState::Unloaded && faulted {
            self.on_completed();
        }

        self.release_reference();
    }
}
