// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Idle persist/unload timers.
//!
//! Once an instance is left with only the policy's own reference and an
//! unlocked executor, the policy arms. After `time_to_persist` it saves the
//! instance (keeping the durable lock); after `time_to_unload` it drops it
//! from memory. Suspended instances skip the wait. Taking a reference
//! disarms the policy.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::UnloadTimings;
use crate::controller::InstanceController;
use crate::sync::lock;

#[derive(Debug, Clone, Copy)]
struct Plan {
    persist_after: Option<Duration>,
    unload_after: Option<Duration>,
}

#[derive(Debug)]
struct Armed {
    generation: u64,
    disarm: Arc<Notify>,
}

#[derive(Debug, Default)]
struct PolicyState {
    armed: Option<Armed>,
    next_generation: u64,
}

impl PolicyState {
    fn is_current(&self, generation: u64) -> bool {
        self.armed.as_ref().is_some_and(|a| a.generation == generation)
    }
}

pub(crate) struct UnloadPolicy {
    controller: Weak<InstanceController>,
    timings: UnloadTimings,
    persist_enabled: bool,
    unload_enabled: bool,
    state: Arc<Mutex<PolicyState>>,
}

impl UnloadPolicy {
    pub(crate) fn new(controller: Weak<InstanceController>, timings: UnloadTimings, can_persist: bool) -> Self {
        Self {
            controller,
            timings,
            persist_enabled: timings.persist_enabled(can_persist),
            unload_enabled: timings.unload_enabled(can_persist),
            state: Arc::new(Mutex::new(PolicyState::default())),
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        lock(&self.state).armed.is_some()
    }

    /// Arm the timers unless they already run.
    pub(crate) fn begin(&self, suspended: bool) {
        if !self.persist_enabled && !self.unload_enabled {
            return;
        }
        let plan = self.plan(suspended);
        let (generation, disarm) = {
            let mut state = lock(&self.state);
            if state.armed.is_some() {
                return;
            }
            state.next_generation += 1;
            let generation = state.next_generation;
            let disarm = Arc::new(Notify::new());
            state.armed = Some(Armed {
                generation,
                disarm: disarm.clone(),
            });
            (generation, disarm)
        };
        debug!(generation, ?plan, "Unload policy armed");

        let controller = self.controller.clone();
        let state = self.state.clone();
        crate::sync::spawn_detached(async move {
            run_policy(controller, state, generation, disarm, plan).await;
        });
    }

    /// Disarm the timers. A step already in progress finishes.
    pub(crate) fn cancel(&self) {
        let armed = lock(&self.state).armed.take();
        if let Some(armed) = armed {
            armed.disarm.notify_one();
        }
    }

    fn plan(&self, suspended: bool) -> Plan {
        let delay = |d: Duration| if suspended { Duration::ZERO } else { d };
        let persist_after = if self.persist_enabled {
            self.timings.time_to_persist.map(delay)
        } else {
            None
        };
        let unload_after = if self.unload_enabled {
            self.timings.time_to_unload.map(|unload| match persist_after {
                Some(_) => delay(unload.saturating_sub(self.timings.time_to_persist.unwrap_or_default())),
                None => delay(unload),
            })
        } else {
            None
        };
        Plan {
            persist_after,
            unload_after,
        }
    }
}

/// `false` if the policy was disarmed first.
async fn sleep_or_disarm(delay: Duration, disarm: &Notify) -> bool {
    tokio::select! {
        biased;
        _ = disarm.notified() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// The controller, if the policy is still armed for `generation`.
fn current(
    controller: &Weak<InstanceController>,
    state: &Mutex<PolicyState>,
    generation: u64,
) -> Option<Arc<InstanceController>> {
    if !lock(state).is_current(generation) {
        return None;
    }
    controller.upgrade()
}

fn finish(state: &Mutex<PolicyState>, generation: u64) {
    let mut state = lock(state);
    if state.is_current(generation) {
        state.armed = None;
    }
}

async fn run_policy(
    controller: Weak<InstanceController>,
    state: Arc<Mutex<PolicyState>>,
    generation: u64,
    disarm: Arc<Notify>,
    plan: Plan,
) {
    let persisted = match plan.persist_after {
        Some(delay) => {
            if !sleep_or_disarm(delay, &disarm).await {
                return;
            }
            let Some(instance) = current(&controller, &state, generation) else {
                return;
            };
            let timeout = instance.settings().persist_timeout;
            match instance.try_persist(timeout).await {
                Ok(persisted) => {
                    debug!(instance_id = %instance.instance_id(), persisted, "Idle persist");
                    persisted
                }
                Err(err) => {
                    warn!(instance_id = %instance.instance_id(), error = %err, "Idle persist failed");
                    finish(&state, generation);
                    instance.abort_instance(err.to_string(), false);
                    return;
                }
            }
        }
        None => false,
    };

    let Some(delay) = plan.unload_after else {
        finish(&state, generation);
        return;
    };
    if !sleep_or_disarm(delay, &disarm).await {
        return;
    }
    let Some(instance) = current(&controller, &state, generation) else {
        return;
    };
    finish(&state, generation);

    let timeout = instance.settings().persist_timeout;
    if persisted {
        if let Err(err) = instance.unlock_and_abort("idle instance unloaded", timeout).await {
            warn!(instance_id = %instance.instance_id(), error = %err, "Idle unload failed");
            instance.abort_instance(err.to_string(), false);
        }
        return;
    }
    match instance.release_instance(true, timeout).await {
        Ok(unloaded) => debug!(instance_id = %instance.instance_id(), unloaded, "Idle unload"),
        Err(err) => warn!(instance_id = %instance.instance_id(), error = %err, "Idle unload failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(persist: Option<u64>, unload: Option<u64>, can_persist: bool) -> UnloadPolicy {
        UnloadPolicy::new(
            Weak::new(),
            UnloadTimings {
                time_to_persist: persist.map(Duration::from_millis),
                time_to_unload: unload.map(Duration::from_millis),
            },
            can_persist,
        )
    }

    #[test]
    fn test_plan_persist_then_unload() {
        let plan = policy(Some(100), Some(300), true).plan(false);
        assert_eq!(plan.persist_after, Some(Duration::from_millis(100)));
        assert_eq!(plan.unload_after, Some(Duration::from_millis(200)));
    }

    #[test]
    fn test_plan_suspended_runs_immediately() {
        let plan = policy(Some(100), Some(300), true).plan(true);
        assert_eq!(plan.persist_after, Some(Duration::ZERO));
        assert_eq!(plan.unload_after, Some(Duration::ZERO));
    }

    #[test]
    fn test_plan_persist_not_before_unload() {
        let plan = policy(Some(500), Some(300), true).plan(false);
        assert_eq!(plan.persist_after, None);
        assert_eq!(plan.unload_after, Some(Duration::from_millis(300)));
    }

    #[test]
    fn test_plan_without_store_is_inert() {
        let plan = policy(Some(100), Some(300), false).plan(false);
        assert_eq!(plan.persist_after, None);
        assert_eq!(plan.unload_after, None);
    }

    #[tokio::test]
    async fn test_cancel_disarms() {
        let policy = policy(None, Some(10_000), true);
        policy.begin(false);
        assert!(policy.is_armed());
        policy.cancel();
        assert!(!policy.is_armed());
    }

    #[tokio::test]
    async fn test_begin_is_idempotent_while_armed() {
        let policy = policy(None, Some(10_000), true);
        policy.begin(false);
        let generation = lock(&policy.state).next_generation;
        policy.begin(false);
        assert_eq!(lock(&policy.state).next_generation, generation);
        policy.cancel();
    }
}
