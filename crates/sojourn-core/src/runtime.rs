// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable host runtime.
//!
//! [`HostRuntime`] wires a [`HostConfig`], an instance store and an engine
//! factory into an opened [`InstanceDirectory`], and hands out
//! [`InstanceLease`]s on loaded instances.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sojourn_core::config::HostConfig;
//! use sojourn_core::directory::LoadRequest;
//! use sojourn_core::runtime::HostRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = HostRuntime::builder()
//!         .config(HostConfig::load()?)
//!         .engine_factory(Arc::new(MyEngineFactory::new()))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let instance = runtime
//!         .acquire(LoadRequest::new_instance(), None, Duration::from_secs(5))
//!         .await?;
//!     instance.run(None, Duration::from_secs(5)).await?;
//!     drop(instance);
//!
//!     runtime.shutdown(Duration::from_secs(30)).await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::controller::{ControllerSettings, InstanceController, InstanceServices};
use crate::directory::{DirectoryOptions, InstanceDirectory, LoadRequest};
use crate::engine::{BufferedReceiveManager, EngineFactory};
use crate::error::CoreError;
use crate::persistence::PersistenceContext;
use crate::pipeline::PersistenceModule;
use crate::store::InstanceStore;
use crate::sync::TimeoutHelper;
use crate::transaction::Transaction;

/// Builder for creating a [`HostRuntime`].
#[derive(Default)]
pub struct HostRuntimeBuilder {
    config: Option<HostConfig>,
    store: Option<Arc<dyn InstanceStore>>,
    engine_factory: Option<Arc<dyn EngineFactory>>,
    buffered_receive: Option<Arc<dyn BufferedReceiveManager>>,
    persistence_modules: Vec<Arc<dyn PersistenceModule>>,
    host_address: Option<String>,
}

impl std::fmt::Debug for HostRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRuntimeBuilder")
            .field("config", &self.config)
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("engine_factory", &self.engine_factory.as_ref().map(|_| "..."))
            .field("persistence_modules", &self.persistence_modules.len())
            .field("host_address", &self.host_address)
            .finish()
    }
}

impl HostRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host configuration. Default: [`HostConfig::default`].
    pub fn config(mut self, config: HostConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Instance store. Without one, `database_url` from the config selects
    /// the bundled SQLite store; without either, instances live in memory only.
    pub fn store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the engine factory (required).
    pub fn engine_factory(mut self, factory: Arc<dyn EngineFactory>) -> Self {
        self.engine_factory = Some(factory);
        self
    }

    pub fn buffered_receive(mut self, manager: Arc<dyn BufferedReceiveManager>) -> Self {
        self.buffered_receive = Some(manager);
        self
    }

    pub fn persistence_module(mut self, module: Arc<dyn PersistenceModule>) -> Self {
        self.persistence_modules.push(module);
        self
    }

    /// Address published with the store owner.
    pub fn host_address(mut self, address: impl Into<String>) -> Self {
        self.host_address = Some(address.into());
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<HostRuntimeConfig> {
        let engine_factory = self
            .engine_factory
            .ok_or_else(|| anyhow::anyhow!("engine factory is required"))?;
        let config = self.config.unwrap_or_default();
        if config.max_instances == 0 {
            anyhow::bail!("max_instances must be greater than zero");
        }

        Ok(HostRuntimeConfig {
            config,
            store: self.store,
            engine_factory,
            buffered_receive: self.buffered_receive,
            persistence_modules: self.persistence_modules,
            host_address: self.host_address,
        })
    }
}

/// Configuration for a [`HostRuntime`].
pub struct HostRuntimeConfig {
    config: HostConfig,
    store: Option<Arc<dyn InstanceStore>>,
    engine_factory: Arc<dyn EngineFactory>,
    buffered_receive: Option<Arc<dyn BufferedReceiveManager>>,
    persistence_modules: Vec<Arc<dyn PersistenceModule>>,
    host_address: Option<String>,
}

impl std::fmt::Debug for HostRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRuntimeConfig")
            .field("config", &self.config)
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("host_address", &self.host_address)
            .finish()
    }
}

impl HostRuntimeConfig {
    /// Connect the store if needed and open the directory as a store owner.
    pub async fn start(self) -> Result<HostRuntime> {
        let store = match self.store {
            Some(store) => Some(store),
            None => connect_configured_store(&self.config).await?,
        };

        let mut services = InstanceServices::new(
            self.engine_factory,
            ControllerSettings::from(&self.config),
        );
        if let Some(manager) = self.buffered_receive {
            services = services.with_buffered_receive(manager);
        }
        for module in self.persistence_modules {
            services = services.with_persistence_module(module);
        }

        let mut options = DirectoryOptions::from(&self.config);
        options.host_address = self.host_address;

        let persistent = store.is_some();
        let directory = InstanceDirectory::new(store, Arc::new(services), options);
        directory
            .open(self.config.persist_timeout)
            .await
            .context("failed to register the host with the instance store")?;

        info!(
            owner_id = %directory.owner_id(),
            persistent,
            max_instances = self.config.max_instances,
            "HostRuntime started"
        );

        Ok(HostRuntime {
            config: self.config,
            directory,
        })
    }
}

#[cfg(feature = "sqlite")]
async fn connect_configured_store(config: &HostConfig) -> Result<Option<Arc<dyn InstanceStore>>> {
    let Some(url) = &config.database_url else {
        return Ok(None);
    };
    let store = crate::store::sqlite::SqliteStore::connect(url)
        .await
        .context("failed to open the SQLite instance store")?;
    Ok(Some(Arc::new(store)))
}

#[cfg(not(feature = "sqlite"))]
async fn connect_configured_store(config: &HostConfig) -> Result<Option<Arc<dyn InstanceStore>>> {
    if config.database_url.is_some() {
        anyhow::bail!("SOJOURN_DATABASE_URL is set but the sqlite feature is disabled");
    }
    Ok(None)
}

/// A running host. Call [`shutdown`](Self::shutdown) for an orderly stop.
pub struct HostRuntime {
    config: HostConfig,
    directory: Arc<InstanceDirectory>,
}

impl HostRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> HostRuntimeBuilder {
        HostRuntimeBuilder::new()
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<InstanceDirectory> {
        &self.directory
    }

    /// Load or create an instance and take a reference on it.
    pub async fn acquire(
        &self,
        request: LoadRequest,
        transaction: Option<&Transaction>,
        timeout: Duration,
    ) -> crate::error::Result<InstanceLease> {
        self.acquire_with(request, true, transaction, timeout).await
    }

    /// Like [`acquire`](Self::acquire), but never creates an instance.
    pub async fn acquire_existing(
        &self,
        request: LoadRequest,
        transaction: Option<&Transaction>,
        timeout: Duration,
    ) -> crate::error::Result<InstanceLease> {
        self.acquire_with(request, false, transaction, timeout).await
    }

    async fn acquire_with(
        &self,
        request: LoadRequest,
        can_create: bool,
        transaction: Option<&Transaction>,
        timeout: Duration,
    ) -> crate::error::Result<InstanceLease> {
        let helper = TimeoutHelper::new(timeout);
        loop {
            let (context, from_cache) = if can_create {
                self.directory
                    .load_or_create(request.clone(), transaction, helper.remaining())
                    .await?
            } else {
                self.directory
                    .load(request.clone(), transaction, helper.remaining())
                    .await?
            };

            if let Some(controller) = context.controller() {
                // A fresh load hands its reference over to the caller.
                if !from_cache || controller.try_acquire_reference(helper.remaining()).await? {
                    return Ok(InstanceLease {
                        controller,
                        context,
                    });
                }
            }

            if helper.is_expired() {
                return Err(CoreError::timeout("acquire instance", helper.original()));
            }
            debug!(instance_id = %context.instance_id(), "Instance is being torn down, loading again");
            tokio::task::yield_now().await;
        }
    }

    /// Unload every cached instance, close the directory and leave the store.
    ///
    /// Instances that cannot be unloaded in time are aborted; their durable
    /// locks expire with the owner.
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        info!("HostRuntime shutting down...");
        let helper = TimeoutHelper::new(timeout);

        match self.directory.get_contexts() {
            Ok(contexts) => {
                for context in contexts {
                    let Some(controller) = context.controller() else {
                        continue;
                    };
                    if !self.directory.can_persist() {
                        controller.abort_instance("host shutting down", false);
                        continue;
                    }
                    if let Err(err) = controller.release_instance(false, helper.remaining()).await {
                        warn!(
                            instance_id = %controller.instance_id(),
                            error = %err,
                            "Failed to unload instance during shutdown"
                        );
                    }
                }
            }
            Err(err) => warn!(error = %err, "Directory no longer accepts work"),
        }

        self.directory
            .close(helper.remaining())
            .await
            .context("failed to close the instance directory")?;
        info!("HostRuntime shutdown complete");
        Ok(())
    }
}

/// A reference on a loaded instance. Dropping it gives the reference back,
/// which may arm the unload policy.
pub struct InstanceLease {
    controller: Arc<InstanceController>,
    context: Arc<PersistenceContext>,
}

impl InstanceLease {
    pub fn controller(&self) -> &Arc<InstanceController> {
        &self.controller
    }

    pub fn context(&self) -> &Arc<PersistenceContext> {
        &self.context
    }
}

impl std::ops::Deref for InstanceLease {
    type Target = InstanceController;

    fn deref(&self) -> &Self::Target {
        &self.controller
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        self.controller.release_reference();
    }
}

impl std::fmt::Debug for InstanceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceLease")
            .field("instance_id", &self.controller.instance_id())
            .finish()
    }
}
