// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence pipeline extension hooks.
//!
//! Hosts can register [`PersistenceModule`]s that observe loads and
//! contribute values to saves. A pipeline is built per load or save; while it
//! runs it is registered with the directory so a directory abort can abort it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::model::InstanceData;
use crate::store::InstanceView;

#[async_trait]
pub trait PersistenceModule: Send + Sync {
    fn name(&self) -> &str;

    /// Inspect a freshly loaded instance. An error fails the load.
    async fn on_load(&self, _view: &InstanceView) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Add or rewrite values in the data about to be saved.
    fn collect(&self, _data: &mut InstanceData) {}

    /// Runs after the store accepted a save.
    async fn on_saved(&self, _data: &InstanceData) -> std::result::Result<(), String> {
        Ok(())
    }

    fn is_save_transaction_required(&self) -> bool {
        false
    }

    fn abort(&self) {}
}

pub struct PersistencePipeline {
    id: Uuid,
    modules: Vec<Arc<dyn PersistenceModule>>,
    aborted: AtomicBool,
}

impl PersistencePipeline {
    pub fn new(modules: Vec<Arc<dyn PersistenceModule>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            modules,
            aborted: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn is_save_transaction_required(&self) -> bool {
        self.modules.iter().any(|m| m.is_save_transaction_required())
    }

    pub async fn on_load(&self, view: &InstanceView) -> Result<()> {
        for module in &self.modules {
            self.ensure_running()?;
            module
                .on_load(view)
                .await
                .map_err(|details| CoreError::Persistence {
                    operation: format!("{} load hook", module.name()),
                    details,
                })?;
        }
        self.ensure_running()
    }

    pub fn collect(&self, mut data: InstanceData) -> InstanceData {
        for module in &self.modules {
            module.collect(&mut data);
        }
        data
    }

    pub async fn on_saved(&self, data: &InstanceData) -> Result<()> {
        for module in &self.modules {
            self.ensure_running()?;
            module
                .on_saved(data)
                .await
                .map_err(|details| CoreError::Persistence {
                    operation: format!("{} save hook", module.name()),
                    details,
                })?;
        }
        Ok(())
    }

    pub fn abort(&self) {
        if !self.aborted.swap(true, Ordering::SeqCst) {
            debug!(pipeline = %self.id, "Aborting persistence pipeline");
            for module in &self.modules {
                module.abort();
            }
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_aborted() {
            Err(CoreError::CommunicationObjectAborted {
                detail: "persistence pipeline was aborted".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Stamp {
        loads: Mutex<usize>,
        aborted: AtomicBool,
        fail_load: bool,
    }

    #[async_trait]
    impl PersistenceModule for Stamp {
        fn name(&self) -> &str {
            "stamp"
        }

        async fn on_load(&self, _view: &InstanceView) -> std::result::Result<(), String> {
            *self.loads.lock().unwrap() += 1;
            if self.fail_load {
                Err("schema mismatch".to_string())
            } else {
                Ok(())
            }
        }

        fn collect(&self, data: &mut InstanceData) {
            data.insert("stamp", Value::from("v2"));
        }

        fn abort(&self) {
            self.aborted.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_collect_and_load_hooks() {
        let module = Arc::new(Stamp::default());
        let pipeline = PersistencePipeline::new(vec![module.clone()]);

        pipeline.on_load(&InstanceView::default()).await.unwrap();
        let data = pipeline.collect(InstanceData::new());

        assert_eq!(*module.loads.lock().unwrap(), 1);
        assert_eq!(data.get("stamp"), Some(&Value::from("v2")));
    }

    #[tokio::test]
    async fn test_failing_load_hook_is_persistence_fault() {
        let module = Arc::new(Stamp {
            fail_load: true,
            ..Default::default()
        });
        let pipeline = PersistencePipeline::new(vec![module]);

        let err = pipeline.on_load(&InstanceView::default()).await.unwrap_err();
        assert_eq!(err.error_code(), "PERSISTENCE_ERROR");
        assert!(err.to_string().contains("schema mismatch"));
    }

    #[tokio::test]
    async fn test_abort_stops_hooks_once() {
        let module = Arc::new(Stamp::default());
        let pipeline = PersistencePipeline::new(vec![module.clone()]);

        pipeline.abort();
        pipeline.abort();

        assert!(module.aborted.load(Ordering::SeqCst));
        let err = pipeline.on_load(&InstanceView::default()).await.unwrap_err();
        assert_eq!(err.error_code(), "COMMUNICATION_OBJECT_ABORTED");
        assert_eq!(*module.loads.lock().unwrap(), 0);
    }
}
