// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-session operation queues and in-flight requests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use super::InstanceController;
use crate::error::{CoreError, Result};
use crate::sync::{AsyncWaitHandle, lock};

#[derive(Debug, Default)]
struct QueuedOperation {
    started: AsyncWaitHandle,
}

/// FIFO queues of operations, one per session id.
#[derive(Debug, Default)]
pub(super) struct PendingOperations {
    sessions: HashMap<String, VecDeque<Arc<QueuedOperation>>>,
}

impl PendingOperations {
    fn push(&mut self, session_id: &str) -> Arc<QueuedOperation> {
        let operation = Arc::new(QueuedOperation::default());
        let queue = self.sessions.entry(session_id.to_string()).or_default();
        if queue.is_empty() {
            operation.started.set();
        }
        queue.push_back(operation.clone());
        operation
    }

    /// Returns `true` if the operation was still queued.
    fn remove(&mut self, session_id: &str, operation: &Arc<QueuedOperation>) -> bool {
        let Some(queue) = self.sessions.get_mut(session_id) else {
            return false;
        };
        let Some(position) = queue.iter().position(|op| Arc::ptr_eq(op, operation)) else {
            return false;
        };
        queue.remove(position);
        if position == 0
            && let Some(next) = queue.front()
        {
            next.started.set();
        }
        if queue.is_empty() {
            self.sessions.remove(session_id);
        }
        true
    }

    fn complete_all(&mut self) {
        for (_, queue) in self.sessions.drain() {
            for operation in queue {
                operation.started.set();
            }
        }
    }

    fn len(&self, session_id: &str) -> usize {
        self.sessions.get(session_id).map_or(0, VecDeque::len)
    }
}

/// Turn of one operation in its session's queue. Dropping it lets the next
/// operation of the session start.
#[derive(Debug)]
pub struct PendingOperation {
    controller: Weak<InstanceController>,
    session_id: String,
    operation: Arc<QueuedOperation>,
}

impl PendingOperation {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for PendingOperation {
    fn drop(&mut self) {
        if let Some(controller) = self.controller.upgrade() {
            lock(&controller.state)
                .pending_operations
                .remove(&self.session_id, &self.operation);
        }
    }
}

/// A request registered with the controller so that it is faulted, rather
/// than left hanging, when the instance aborts or completes.
pub struct PendingRequest {
    id: u64,
    controller: Weak<InstanceController>,
    fault: oneshot::Receiver<CoreError>,
}

impl PendingRequest {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The fault delivered so far, without waiting.
    pub fn try_fault(&mut self) -> Option<CoreError> {
        self.fault.try_recv().ok()
    }

    /// Wait until the request is faulted. `None` if the controller went away
    /// without faulting it.
    pub async fn faulted(&mut self) -> Option<CoreError> {
        (&mut self.fault).await.ok()
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if let Some(controller) = self.controller.upgrade() {
            lock(&controller.state).pending_requests.remove(&self.id);
        }
    }
}

impl InstanceController {
    /// Queue behind earlier operations of `session_id` and wait for our turn.
    pub async fn wait_for_pending_operations(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> Result<PendingOperation> {
        let operation = lock(&self.state).pending_operations.push(session_id);
        let pending = PendingOperation {
            controller: self.self_ref.clone(),
            session_id: session_id.to_string(),
            operation: operation.clone(),
        };

        if !operation.started.wait(timeout).await {
            let removed = lock(&self.state)
                .pending_operations
                .remove(session_id, &operation);
            if removed {
                return Err(CoreError::timeout("wait for pending operations", timeout));
            }
        }
        debug!(instance_id = %self.instance_id, session_id, "Pending operation started");
        Ok(pending)
    }

    pub fn pending_operation_count(&self, session_id: &str) -> usize {
        lock(&self.state).pending_operations.len(session_id)
    }

    /// Release every queued operation of every session.
    pub fn complete_pending_operations(&self) {
        lock(&self.state).pending_operations.complete_all();
    }

    pub fn register_pending_request(&self) -> PendingRequest {
        let (sender, receiver) = oneshot::channel();
        let id = {
            let mut state = lock(&self.state);
            state.next_request_id += 1;
            let id = state.next_request_id;
            state.pending_requests.insert(id, sender);
            id
        };
        PendingRequest {
            id,
            controller: self.self_ref.clone(),
            fault: receiver,
        }
    }

    pub fn pending_request_count(&self) -> usize {
        lock(&self.state).pending_requests.len()
    }

    pub(super) fn fault_pending_requests(&self, fault: CoreError) {
        let senders: Vec<_> = lock(&self.state)
            .pending_requests
            .drain()
            .map(|(_, sender)| sender)
            .collect();
        for sender in senders {
            let _ = sender.send(fault.clone());
        }
    }
}
