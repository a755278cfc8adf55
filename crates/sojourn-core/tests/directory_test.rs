// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance directory tests: cache, keys, throttle, store conflicts, close.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use uuid::Uuid;

use common::{TIMEOUT, TestHost, settings};
use sojourn_core::directory::{DirectoryOptions, LoadRequest};
use sojourn_core::engine::mock::MockEngineFactory;
use sojourn_core::model::{InstanceData, InstanceKey};
use sojourn_core::store::{CommandKind, StoreError};
use sojourn_core::store::memory::MemoryStore;
use sojourn_core::{CoreError, InstanceState};

#[tokio::test]
async fn test_second_load_hits_cache() {
    let host = TestHost::new(MockEngineFactory::never_completing(), settings()).await;
    let id = Uuid::new_v4();

    let instance = host.load_or_create(LoadRequest::by_id(id)).await;
    assert_eq!(instance.id(), id);
    assert_eq!(instance.controller.reference_count(), 2);

    let (context, from_cache) = host
        .directory
        .load_or_create(LoadRequest::by_id(id), None, TIMEOUT)
        .await
        .unwrap();
    assert!(from_cache);
    assert!(Arc::ptr_eq(&context, &instance.context));
    assert_eq!(host.store().command_count(CommandKind::LoadOrCreate), 1);
    assert_eq!(host.directory.cached_count(), 1);
    assert_eq!(host.factory.created_count(), 1);

    instance.controller.release_reference();
}

#[tokio::test]
async fn test_concurrent_loads_share_one_store_load() {
    let store = Arc::new(MemoryStore::new().with_latency(Duration::from_millis(20)));
    let host = TestHost::with_store(
        store,
        MockEngineFactory::never_completing(),
        settings(),
        DirectoryOptions::default(),
    )
    .await;
    let id = Uuid::new_v4();

    let loads = (0..4).map(|_| {
        host.directory
            .load_or_create(LoadRequest::by_id(id), None, TIMEOUT)
    });
    let results: Vec<_> = join_all(loads)
        .await
        .into_iter()
        .map(|result| result.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|(_, from_cache)| !from_cache).count(), 1);
    let first = &results[0].0;
    assert!(results.iter().all(|(context, _)| Arc::ptr_eq(context, first)));
    assert_eq!(host.store().command_count(CommandKind::LoadOrCreate), 1);

    if let Some(controller) = first.controller() {
        controller.release_reference();
    }
}

#[tokio::test]
async fn test_handle_conflict_returns_winner_from_cache() {
    let host = TestHost::new(MockEngineFactory::never_completing(), settings()).await;
    let id = Uuid::new_v4();
    let winner = host.load_or_create(LoadRequest::by_id(id)).await;
    let available = host.directory.throttle().available();

    // The losing load reaches the store after the winner bound the instance.
    host.store().inject_fault(
        CommandKind::LoadOrCreate,
        StoreError::HandleConflict { instance_id: id },
    );
    let (context, from_cache) = host
        .directory
        .load_or_create(
            LoadRequest::by_key(InstanceKey::new(Uuid::new_v4())),
            None,
            TIMEOUT,
        )
        .await
        .unwrap();

    assert!(from_cache);
    assert!(Arc::ptr_eq(&context, &winner.context));
    assert_eq!(host.store().command_count(CommandKind::LoadOrCreate), 2);
    assert_eq!(host.factory.created_count(), 1);
    assert_eq!(host.directory.cached_count(), 1);
    assert_eq!(host.directory.throttle().available(), available);

    winner.controller.release_reference();
}

#[tokio::test]
async fn test_store_key_of_cached_instance_resolves_after_disassociation() {
    let host = TestHost::new(MockEngineFactory::never_completing(), settings()).await;
    let key = InstanceKey::new(Uuid::new_v4());
    let instance = host.load_or_create(LoadRequest::by_key(key.clone())).await;

    // The store keeps the association until the next save.
    instance.context.disassociate_keys(std::slice::from_ref(&key));
    let outcome = tokio::time::timeout(
        Duration::from_secs(3),
        host.directory
            .load(LoadRequest::by_key(key), None, Duration::from_millis(200)),
    )
    .await
    .expect("load ignored its timeout");

    let (context, from_cache) = outcome.unwrap();
    assert!(from_cache);
    assert!(Arc::ptr_eq(&context, &instance.context));
    assert_eq!(host.directory.throttle().in_use(), 1);

    instance.controller.release_reference();
}

#[tokio::test]
async fn test_repeated_handle_conflicts_honor_timeout() {
    let store = Arc::new(MemoryStore::new().with_latency(Duration::from_millis(5)));
    for _ in 0..200 {
        store.inject_fault(
            CommandKind::LoadOrCreate,
            StoreError::HandleConflict {
                instance_id: Uuid::new_v4(),
            },
        );
    }
    let host = TestHost::with_store(
        store,
        MockEngineFactory::never_completing(),
        settings(),
        DirectoryOptions::default(),
    )
    .await;
    let available = host.directory.throttle().available();

    let outcome = tokio::time::timeout(
        Duration::from_secs(3),
        host.directory.load_or_create(
            LoadRequest::by_id(Uuid::new_v4()),
            None,
            Duration::from_millis(100),
        ),
    )
    .await
    .expect("load ignored its timeout");

    assert!(outcome.unwrap_err().is_timeout());
    assert_eq!(host.directory.cached_count(), 0);
    assert_eq!(host.directory.throttle().available(), available);
}

#[tokio::test]
async fn test_load_by_key_and_associated_keys() {
    let host = TestHost::new(MockEngineFactory::never_completing(), settings()).await;
    let order = InstanceKey::new(Uuid::new_v4());
    let customer = InstanceKey::new(Uuid::new_v4());

    let instance = host
        .load_or_create(
            LoadRequest::by_key(order.clone()).with_associated_keys(vec![customer.clone()]),
        )
        .await;
    let keys = instance.context.keys();
    assert!(keys.contains(&order));
    assert!(keys.contains(&customer));

    // Either key resolves to the cached context.
    for key in [order, customer] {
        let (context, from_cache) = host
            .directory
            .load(LoadRequest::by_key(key), None, TIMEOUT)
            .await
            .unwrap();
        assert!(from_cache);
        assert!(Arc::ptr_eq(&context, &instance.context));
    }

    instance.controller.release_reference();
}

#[tokio::test]
async fn test_key_collision_is_reported() {
    let host = TestHost::new(MockEngineFactory::never_completing(), settings()).await;
    let key = InstanceKey::new(Uuid::new_v4());
    let owner = host.load_or_create(LoadRequest::by_key(key.clone())).await;

    let err = host
        .directory
        .load_or_create(
            LoadRequest::new_instance().with_associated_keys(vec![key.clone()]),
            None,
            TIMEOUT,
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, CoreError::KeyCollision { key: collided, owner: Some(existing) }
            if collided == key.value() && existing == owner.id())
    );
    assert_eq!(host.directory.cached_count(), 1);
    assert_eq!(host.directory.throttle().in_use(), 1);

    owner.controller.release_reference();
}

#[tokio::test]
async fn test_missing_instance_is_not_ready() {
    let host = TestHost::new(MockEngineFactory::never_completing(), settings()).await;

    let err = host
        .directory
        .load(LoadRequest::by_id(Uuid::new_v4()), None, TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InstanceNotReady { .. }));

    let err = host
        .directory
        .load(LoadRequest::by_key(InstanceKey::new(Uuid::new_v4())), None, TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InstanceNotReady { .. }));
    assert_eq!(host.directory.throttle().in_use(), 0);
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let host = TestHost::new(MockEngineFactory::never_completing(), settings()).await;

    let err = host
        .directory
        .load(LoadRequest::default(), None, TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidKey { .. }));

    let err = host
        .directory
        .load(LoadRequest::by_key(InstanceKey::new(Uuid::nil())), None, TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidKey { .. }));
}

#[tokio::test]
async fn test_instance_locked_elsewhere_redirects() {
    let store = Arc::new(MemoryStore::new());
    let id = Uuid::new_v4();
    let other_host = Uuid::new_v4();
    store.seed_instance(id, InstanceData::new(), &[]);
    store.lock_for_owner(id, other_host, Some("10.0.0.7:7001"));

    let host = TestHost::with_store(
        store,
        MockEngineFactory::never_completing(),
        settings(),
        DirectoryOptions::default(),
    )
    .await;

    let err = host
        .directory
        .load(LoadRequest::by_id(id), None, TIMEOUT)
        .await
        .unwrap_err();
    match err {
        CoreError::Redirection {
            owner_id, address, ..
        } => {
            assert_eq!(owner_id, Some(other_host));
            assert_eq!(address.as_deref(), Some("10.0.0.7:7001"));
        }
        other => panic!("expected a redirection, got {other:?}"),
    }
    assert_eq!(host.directory.cached_count(), 0);
}

#[tokio::test]
async fn test_throttle_bounds_resident_instances() {
    let options = DirectoryOptions {
        max_instances: 1,
        ..DirectoryOptions::default()
    };
    let host = TestHost::with_store(
        Arc::new(MemoryStore::new()),
        MockEngineFactory::never_completing(),
        settings(),
        options,
    )
    .await;

    let first = host.create().await;
    first.run_to_idle().await;
    assert_eq!(host.directory.throttle().in_use(), 1);

    let err = host
        .directory
        .load_or_create(LoadRequest::new_instance(), None, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(host.directory.throttle().in_use(), 1);

    first.controller.unload(None, TIMEOUT).await.unwrap();
    assert_eq!(host.directory.throttle().in_use(), 0);
    first.controller.release_reference();

    let second = host.create().await;
    assert_eq!(host.directory.throttle().in_use(), 1);
    second.controller.release_reference();
}

#[tokio::test]
async fn test_close_empty_directory_leaves_store() {
    let host = TestHost::new(MockEngineFactory::never_completing(), settings()).await;
    assert_eq!(host.store().owner_count(), 1);

    host.directory.close(TIMEOUT).await.unwrap();
    assert!(host.directory.is_closed());
    assert!(!host.directory.is_aborted());
    assert_eq!(host.store().owner_count(), 0);
    assert_eq!(host.store().command_count(CommandKind::DeleteOwner), 1);

    // Closing again is a no-op.
    host.directory.close(TIMEOUT).await.unwrap();

    let err = host
        .directory
        .load_or_create(LoadRequest::new_instance(), None, TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::OperationCanceled { .. }));
}

#[tokio::test]
async fn test_close_with_cached_instances_aborts() {
    let host = TestHost::new(MockEngineFactory::never_completing(), settings()).await;
    let instance = host.create().await;
    instance.run_to_idle().await;

    let err = host.directory.close(TIMEOUT).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidOperation { .. }));
    assert!(host.directory.is_aborted());
    assert!(instance.context.is_aborted());
    assert_eq!(host.directory.cached_count(), 0);

    instance.wait_state(InstanceState::Aborted).await;
    instance.controller.release_reference();
}

#[tokio::test]
async fn test_in_memory_directory_creates_without_store() {
    let host = TestHost::in_memory(MockEngineFactory::never_completing(), settings()).await;
    assert!(!host.directory.can_persist());

    let instance = host.create().await;
    assert!(!instance.context.can_persist());

    let (context, from_cache) = host
        .directory
        .load(LoadRequest::by_id(instance.id()), None, TIMEOUT)
        .await
        .unwrap();
    assert!(from_cache);
    assert!(Arc::ptr_eq(&context, &instance.context));

    let err = host
        .directory
        .load(LoadRequest::by_id(Uuid::new_v4()), None, TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InstanceNotReady { .. }));

    instance.controller.release_reference();
}
