// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HostRuntime tests: leases, shutdown, in-memory hosting.

mod common;

use std::sync::Arc;

use serde_json::json;

use common::{TIMEOUT, init_tracing, wait_until};
use sojourn_core::config::{HostConfig, UnloadTimings};
use sojourn_core::directory::LoadRequest;
use sojourn_core::engine::mock::MockEngineFactory;
use sojourn_core::model::{Bookmark, BookmarkResumptionResult};
use sojourn_core::store::InstanceStore;
use sojourn_core::store::memory::MemoryStore;
use sojourn_core::{HostRuntime, InstanceState};

fn config() -> HostConfig {
    HostConfig {
        unload: UnloadTimings {
            time_to_persist: None,
            time_to_unload: None,
        },
        ..HostConfig::default()
    }
}

async fn start(store: Option<Arc<MemoryStore>>, factory: MockEngineFactory) -> HostRuntime {
    init_tracing();
    let mut builder = HostRuntime::builder()
        .config(config())
        .engine_factory(Arc::new(factory))
        .host_address("127.0.0.1:7001");
    if let Some(store) = store {
        builder = builder.store(store as Arc<dyn InstanceStore>);
    }
    builder.build().unwrap().start().await.unwrap()
}

#[tokio::test]
async fn test_leases_count_references() {
    let store = Arc::new(MemoryStore::new());
    let runtime = start(Some(store.clone()), MockEngineFactory::never_completing()).await;
    let id = uuid::Uuid::new_v4();

    let first = runtime
        .acquire(LoadRequest::by_id(id), None, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(first.reference_count(), 2);

    let second = runtime
        .acquire_existing(LoadRequest::by_id(id), None, TIMEOUT)
        .await
        .unwrap();
    assert!(Arc::ptr_eq(first.controller(), second.controller()));
    assert_eq!(first.reference_count(), 3);

    drop(second);
    assert_eq!(first.reference_count(), 2);
    let controller = first.controller().clone();
    drop(first);
    assert_eq!(controller.reference_count(), 1);

    runtime.shutdown(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_unloads_and_leaves_store() {
    let store = Arc::new(MemoryStore::new());
    let runtime = start(Some(store.clone()), MockEngineFactory::never_completing()).await;
    assert_eq!(store.owner_count(), 1);

    let lease = runtime
        .acquire(LoadRequest::new_instance(), None, TIMEOUT)
        .await
        .unwrap();
    let id = lease.instance_id();
    lease.run(None, TIMEOUT).await.unwrap();
    let controller = lease.controller().clone();
    assert!(wait_until(TIMEOUT, || !controller.is_locked() && controller.is_runnable()).await);
    drop(lease);

    let directory = runtime.directory().clone();
    runtime.shutdown(TIMEOUT).await.unwrap();

    assert_eq!(controller.state(), InstanceState::Unloaded);
    assert!(directory.is_closed());
    assert_eq!(directory.cached_count(), 0);
    assert_eq!(store.owner_count(), 0);

    let snapshot = store.snapshot(id).unwrap();
    assert!(snapshot.is_initialized);
    assert!(!snapshot.is_locked);
}

#[tokio::test]
async fn test_in_memory_runtime_runs_to_completion() {
    let runtime = start(None, MockEngineFactory::new()).await;
    assert!(!runtime.directory().can_persist());

    let lease = runtime
        .acquire(LoadRequest::new_instance(), None, TIMEOUT)
        .await
        .unwrap();
    let result = lease
        .resume_bookmark(&Bookmark::new("resume"), json!({ "approved": true }), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(result, BookmarkResumptionResult::Success);

    let controller = lease.controller().clone();
    assert!(wait_until(TIMEOUT, || controller.state() == InstanceState::Unloaded).await);
    let directory = runtime.directory().clone();
    assert!(wait_until(TIMEOUT, || directory.cached_count() == 0).await);
    drop(lease);

    runtime.shutdown(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn test_in_memory_shutdown_aborts_live_instances() {
    let runtime = start(None, MockEngineFactory::never_completing()).await;
    let lease = runtime
        .acquire(LoadRequest::new_instance(), None, TIMEOUT)
        .await
        .unwrap();
    let controller = lease.controller().clone();
    drop(lease);

    runtime.shutdown(TIMEOUT).await.unwrap();
    assert!(wait_until(TIMEOUT, || controller.state() == InstanceState::Aborted).await);
}

#[tokio::test]
async fn test_start_rejects_unreachable_database() {
    init_tracing();
    let config = HostConfig {
        database_url: Some("sqlite:/nonexistent-dir/sojourn.db".to_string()),
        ..config()
    };
    let result = HostRuntime::builder()
        .config(config)
        .engine_factory(Arc::new(MockEngineFactory::new()))
        .build()
        .unwrap()
        .start()
        .await;
    assert!(result.is_err());
}
