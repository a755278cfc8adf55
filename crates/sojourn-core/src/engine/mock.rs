// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock engine for testing.
//!
//! A scripted engine that simulates a workflow waiting on bookmarks without
//! executing anything. Each `run` is one step on a spawned task: it applies
//! scheduled terminations, cancellations and bookmark resumptions, settles
//! in `Idle` or `Complete`, and reports the pause.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use uuid::Uuid;

use super::{EngineFactory, EngineNotifier, EngineState, TrackingRecord, WorkflowEngine};
use crate::model::{Bookmark, BookmarkResumptionResult, CompletionState, InstanceData, names};
use crate::sync::lock;

#[derive(Debug)]
struct MockState {
    engine_state: EngineState,
    bookmarks: Vec<Bookmark>,
    pending_resumptions: Vec<(Bookmark, Value)>,
    resumed: Vec<(Bookmark, Value)>,
    completion: Option<CompletionState>,
    terminate_reason: Option<String>,
    cancel_scheduled: bool,
    abort_reason: Option<String>,
    persistable: bool,
    fail_next_run: Option<String>,
    runs: usize,
    pause_requests: usize,
    pause_when_persistable_requests: usize,
    pause_when_persistable_pending: bool,
    tracked: Vec<TrackingRecord>,
    unflushed: usize,
    flushes: usize,
    update: Option<Value>,
}

/// Engine driven by a fixed script, see [`MockEngineFactory`].
pub struct MockEngine {
    instance_id: Uuid,
    self_ref: Weak<MockEngine>,
    notifier: EngineNotifier,
    complete_on_resume: bool,
    step_delay: Duration,
    state: Mutex<MockState>,
}

impl MockEngine {
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn run_count(&self) -> usize {
        lock(&self.state).runs
    }

    pub fn pause_requests(&self) -> usize {
        lock(&self.state).pause_requests
    }

    pub fn pause_when_persistable_requests(&self) -> usize {
        lock(&self.state).pause_when_persistable_requests
    }

    pub fn tracked(&self) -> Vec<TrackingRecord> {
        lock(&self.state).tracked.clone()
    }

    pub fn flush_count(&self) -> usize {
        lock(&self.state).flushes
    }

    pub fn abort_reason(&self) -> Option<String> {
        lock(&self.state).abort_reason.clone()
    }

    pub fn resumed(&self) -> Vec<(Bookmark, Value)> {
        lock(&self.state).resumed.clone()
    }

    pub fn applied_update(&self) -> Option<Value> {
        lock(&self.state).update.clone()
    }

    /// Change persistability. Becoming persistable honors an outstanding
    /// pause-when-persistable request with a pause notification.
    pub fn set_persistable(&self, persistable: bool) {
        let notify = {
            let mut state = lock(&self.state);
            state.persistable = persistable;
            persistable && std::mem::take(&mut state.pause_when_persistable_pending)
        };
        if notify {
            self.notifier.notify_paused();
        }
    }

    /// Make the next run report an unhandled exception instead of progressing.
    pub fn fail_next_run(&self, message: impl Into<String>) {
        lock(&self.state).fail_next_run = Some(message.into());
    }

    fn step(&self) {
        let failure = {
            let mut state = lock(&self.state);
            if let Some(message) = state.fail_next_run.take() {
                state.engine_state = EngineState::Idle;
                Some(message)
            } else {
                if let Some(reason) = state.terminate_reason.take() {
                    state.engine_state = EngineState::Complete;
                    state.completion = Some(CompletionState::Faulted { reason });
                } else if state.cancel_scheduled {
                    state.cancel_scheduled = false;
                    state.engine_state = EngineState::Complete;
                    state.completion = Some(CompletionState::Canceled);
                } else if !state.pending_resumptions.is_empty() {
                    let resumed = std::mem::take(&mut state.pending_resumptions);
                    state.resumed.extend(resumed);
                    if self.complete_on_resume {
                        state.engine_state = EngineState::Complete;
                        state.completion = Some(CompletionState::Closed);
                    } else {
                        state.engine_state = EngineState::Idle;
                    }
                } else if state.engine_state == EngineState::Runnable {
                    if state.bookmarks.is_empty() {
                        state.engine_state = EngineState::Complete;
                        state.completion = Some(CompletionState::Closed);
                    } else {
                        state.engine_state = EngineState::Idle;
                    }
                }
                if state.engine_state == EngineState::Complete {
                    state.bookmarks.clear();
                }
                state.unflushed += 1;
                None
            }
        };

        match failure {
            Some(message) => self.notifier.notify_unhandled_exception(message),
            None => self.notifier.notify_paused(),
        }
    }
}

#[async_trait]
impl WorkflowEngine for MockEngine {
    fn state(&self) -> EngineState {
        lock(&self.state).engine_state
    }

    fn run(&self) {
        let finished = {
            let mut state = lock(&self.state);
            state.runs += 1;
            matches!(
                state.engine_state,
                EngineState::Complete | EngineState::Aborted
            )
        };
        if finished {
            self.notifier.notify_paused();
            return;
        }

        let Some(engine) = self.self_ref.upgrade() else {
            return;
        };
        let delay = self.step_delay;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            engine.step();
        });
    }

    fn request_pause(&self) {
        lock(&self.state).pause_requests += 1;
    }

    fn pause_when_persistable(&self) {
        let mut state = lock(&self.state);
        state.pause_when_persistable_requests += 1;
        state.pause_when_persistable_pending = true;
    }

    fn abort(&self, reason: Option<&str>) {
        let mut state = lock(&self.state);
        state.engine_state = EngineState::Aborted;
        state.abort_reason = Some(reason.unwrap_or("aborted").to_string());
    }

    fn terminate(&self, reason: &str) {
        let mut state = lock(&self.state);
        state.terminate_reason = Some(reason.to_string());
        if state.engine_state == EngineState::Idle {
            state.engine_state = EngineState::Runnable;
        }
    }

    fn schedule_cancel(&self) {
        let mut state = lock(&self.state);
        state.cancel_scheduled = true;
        if state.engine_state == EngineState::Idle {
            state.engine_state = EngineState::Runnable;
        }
    }

    fn schedule_bookmark_resumption(
        &self,
        bookmark: &Bookmark,
        value: Value,
    ) -> BookmarkResumptionResult {
        let mut state = lock(&self.state);
        match state.engine_state {
            EngineState::Complete | EngineState::Aborted => BookmarkResumptionResult::NotFound,
            // Bookmarks exist only once the first step has run.
            EngineState::Runnable if state.runs == 0 => BookmarkResumptionResult::NotReady,
            _ if !state.bookmarks.contains(bookmark) => BookmarkResumptionResult::NotFound,
            _ => {
                state.pending_resumptions.push((bookmark.clone(), value));
                state.engine_state = EngineState::Runnable;
                BookmarkResumptionResult::Success
            }
        }
    }

    fn bookmarks(&self) -> Vec<Bookmark> {
        lock(&self.state).bookmarks.clone()
    }

    fn is_persistable(&self) -> bool {
        lock(&self.state).persistable
    }

    fn prepare_for_serialization(&self) -> InstanceData {
        let state = lock(&self.state);
        let bookmarks: Vec<&str> = state.bookmarks.iter().map(|b| b.name.as_str()).collect();
        InstanceData::new().with(
            names::WORKFLOW_STATE,
            json!({
                "bookmarks": bookmarks,
                "resumed": state.resumed.len(),
            }),
        )
    }

    fn completion_state(&self) -> Option<CompletionState> {
        lock(&self.state).completion.clone()
    }

    fn track(&self, record: TrackingRecord) {
        let mut state = lock(&self.state);
        state.tracked.push(record);
        state.unflushed += 1;
    }

    fn has_pending_tracking_records(&self) -> bool {
        lock(&self.state).unflushed > 0
    }

    async fn flush_tracking_records(&self, _timeout: Duration) -> Result<(), String> {
        let mut state = lock(&self.state);
        state.unflushed = 0;
        state.flushes += 1;
        Ok(())
    }

    fn apply_update(&self, update: &Value) -> Result<(), String> {
        if update.get("reject").and_then(Value::as_bool).unwrap_or(false) {
            return Err("update map does not match the running definition".to_string());
        }
        lock(&self.state).update = Some(update.clone());
        Ok(())
    }
}

/// Factory producing [`MockEngine`]s that wait on a fixed set of bookmarks.
pub struct MockEngineFactory {
    /// Bookmarks every new instance waits on after its first step
    pub bookmarks: Vec<String>,
    /// If true, resuming any bookmark completes the instance
    pub complete_on_resume: bool,
    /// Initial persistability of created engines
    pub persistable: bool,
    /// Delay before each step runs
    pub step_delay: Duration,
    /// If set, creation fails with this message
    pub fail_create: Option<String>,
    engines: Mutex<HashMap<Uuid, Arc<MockEngine>>>,
}

impl Default for MockEngineFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngineFactory {
    /// Instances wait on bookmark `"resume"` and complete once it is resumed.
    pub fn new() -> Self {
        Self {
            bookmarks: vec!["resume".to_string()],
            complete_on_resume: true,
            persistable: true,
            step_delay: Duration::ZERO,
            fail_create: None,
            engines: Mutex::new(HashMap::new()),
        }
    }

    /// Instances go idle after every step and never complete on their own.
    pub fn never_completing() -> Self {
        Self {
            complete_on_resume: false,
            ..Self::new()
        }
    }

    /// Instances complete on their first step.
    pub fn completing() -> Self {
        Self {
            bookmarks: Vec::new(),
            ..Self::new()
        }
    }

    /// Engine created for `instance_id`, most recent load first.
    pub fn engine(&self, instance_id: Uuid) -> Option<Arc<MockEngine>> {
        lock(&self.engines).get(&instance_id).cloned()
    }

    pub fn created_count(&self) -> usize {
        lock(&self.engines).len()
    }
}

impl EngineFactory for MockEngineFactory {
    fn create(
        &self,
        instance_id: Uuid,
        stored: Option<&InstanceData>,
        notifier: EngineNotifier,
    ) -> Result<Arc<dyn WorkflowEngine>, String> {
        if let Some(message) = &self.fail_create {
            return Err(message.clone());
        }

        let restored = stored.and_then(|data| data.get(names::WORKFLOW_STATE));
        let (engine_state, bookmarks) = match restored {
            Some(saved) => {
                let bookmarks = saved
                    .get("bookmarks")
                    .and_then(Value::as_array)
                    .map(|names| {
                        names
                            .iter()
                            .filter_map(Value::as_str)
                            .map(Bookmark::new)
                            .collect()
                    })
                    .unwrap_or_default();
                (EngineState::Idle, bookmarks)
            }
            None => (
                EngineState::Runnable,
                self.bookmarks.iter().map(Bookmark::new).collect(),
            ),
        };
        // A restored engine has already taken its first step.
        let runs = usize::from(restored.is_some());

        let engine = Arc::new_cyclic(|self_ref| MockEngine {
            instance_id,
            self_ref: self_ref.clone(),
            notifier,
            complete_on_resume: self.complete_on_resume,
            step_delay: self.step_delay,
            state: Mutex::new(MockState {
                engine_state,
                bookmarks,
                pending_resumptions: Vec::new(),
                resumed: Vec::new(),
                completion: None,
                terminate_reason: None,
                cancel_scheduled: false,
                abort_reason: None,
                persistable: self.persistable,
                fail_next_run: None,
                runs,
                pause_requests: 0,
                pause_when_persistable_requests: 0,
                pause_when_persistable_pending: false,
                tracked: Vec::new(),
                unflushed: 0,
                flushes: 0,
                update: None,
            }),
        });
        lock(&self.engines).insert(instance_id, engine.clone());
        Ok(engine)
    }
}
