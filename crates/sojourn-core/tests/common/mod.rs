// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for sojourn-core integration tests.
//!
//! Provides TestHost: a memory store, a mock engine factory and an opened
//! instance directory wired together.

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use uuid::Uuid;

use sojourn_core::config::{UnhandledExceptionAction, UnloadTimings};
use sojourn_core::controller::{ControllerSettings, InstanceServices};
use sojourn_core::directory::{DirectoryOptions, InstanceDirectory, LoadRequest};
use sojourn_core::engine::{EngineState, WorkflowEngine};
use sojourn_core::engine::mock::{MockEngine, MockEngineFactory};
use sojourn_core::persistence::PersistenceContext;
use sojourn_core::store::InstanceStore;
use sojourn_core::store::memory::MemoryStore;
use sojourn_core::{InstanceController, InstanceState};

pub const TIMEOUT: Duration = Duration::from_secs(5);

static TRACING: Once = Once::new();

/// Install a test subscriber once; honors `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Controller settings with the idle timers off, so nothing unloads behind
/// a test's back.
pub fn settings() -> ControllerSettings {
    ControllerSettings {
        unload: UnloadTimings {
            time_to_persist: None,
            time_to_unload: None,
        },
        ..ControllerSettings::default()
    }
}

pub fn settings_with_action(action: UnhandledExceptionAction) -> ControllerSettings {
    ControllerSettings {
        unhandled_exception_action: action,
        ..settings()
    }
}

pub fn settings_with_timers(persist: Option<Duration>, unload: Option<Duration>) -> ControllerSettings {
    ControllerSettings {
        unload: UnloadTimings {
            time_to_persist: persist,
            time_to_unload: unload,
        },
        ..settings()
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A loaded instance. The loader's reference is still held.
pub struct Loaded {
    pub context: Arc<PersistenceContext>,
    pub controller: Arc<InstanceController>,
    pub engine: Arc<MockEngine>,
}

impl Loaded {
    pub fn id(&self) -> Uuid {
        self.controller.instance_id()
    }

    /// Make a fresh instance runnable and wait for its first idle pause.
    pub async fn run_to_idle(&self) {
        self.controller.run(None, TIMEOUT).await.unwrap();
        self.wait_idle().await;
    }

    pub async fn wait_idle(&self) {
        let controller = self.controller.clone();
        let engine = self.engine.clone();
        assert!(
            wait_until(TIMEOUT, || engine.state() == EngineState::Idle && !controller.is_locked()).await,
            "instance did not go idle"
        );
    }

    pub async fn wait_state(&self, state: InstanceState) {
        let controller = self.controller.clone();
        assert!(
            wait_until(TIMEOUT, || controller.state() == state).await,
            "instance never reached {state}, stuck in {}",
            self.controller.state()
        );
    }
}

pub struct TestHost {
    pub store: Option<Arc<MemoryStore>>,
    pub factory: Arc<MockEngineFactory>,
    pub directory: Arc<InstanceDirectory>,
}

impl TestHost {
    /// Host over a fresh memory store.
    pub async fn new(factory: MockEngineFactory, settings: ControllerSettings) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), factory, settings, DirectoryOptions::default()).await
    }

    pub async fn with_store(
        store: Arc<MemoryStore>,
        factory: MockEngineFactory,
        settings: ControllerSettings,
        options: DirectoryOptions,
    ) -> Self {
        init_tracing();
        let factory = Arc::new(factory);
        let services = Arc::new(InstanceServices::new(factory.clone(), settings));
        let directory = InstanceDirectory::new(
            Some(store.clone() as Arc<dyn InstanceStore>),
            services,
            options,
        );
        directory.open(TIMEOUT).await.unwrap();
        Self {
            store: Some(store),
            factory,
            directory,
        }
    }

    /// Host without a store; instances live in memory only.
    pub async fn in_memory(factory: MockEngineFactory, settings: ControllerSettings) -> Self {
        init_tracing();
        let factory = Arc::new(factory);
        let services = Arc::new(InstanceServices::new(factory.clone(), settings));
        let directory = InstanceDirectory::new(None, services, DirectoryOptions::default());
        directory.open(TIMEOUT).await.unwrap();
        Self {
            store: None,
            factory,
            directory,
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        self.store.as_ref().expect("host has no store")
    }

    pub async fn create(&self) -> Loaded {
        self.load_or_create(LoadRequest::new_instance()).await
    }

    pub async fn load_or_create(&self, request: LoadRequest) -> Loaded {
        let (context, from_cache) = self
            .directory
            .load_or_create(request, None, TIMEOUT)
            .await
            .unwrap();
        assert!(!from_cache, "expected a fresh load");
        self.loaded(context)
    }

    pub async fn load(&self, request: LoadRequest) -> Loaded {
        let (context, from_cache) = self.directory.load(request, None, TIMEOUT).await.unwrap();
        assert!(!from_cache, "expected a fresh load");
        self.loaded(context)
    }

    fn loaded(&self, context: Arc<PersistenceContext>) -> Loaded {
        let controller = context.controller().expect("context has no controller");
        let engine = self
            .factory
            .engine(controller.instance_id())
            .expect("no engine for instance");
        Loaded {
            context,
            controller,
            engine,
        }
    }
}
