// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed instance store.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{InstanceHandle, InstanceStore, InstanceView, SaveCommand, StoreCommand, StoreError};
use crate::migrations::SQLITE as MIGRATOR;
use crate::model::{InstanceData, InstanceKey, names};
use crate::sync::lock;

#[derive(Debug, Clone, sqlx::FromRow)]
struct InstanceRow {
    instance_id: String,
    data: String,
    metadata: String,
    lock_owner: Option<String>,
    is_initialized: bool,
    is_completed: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct KeyRow {
    key_id: String,
    instance_id: String,
    metadata: String,
    is_completed: bool,
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    handle_id: Uuid,
    owner_id: Uuid,
}

/// SQLite-backed [`InstanceStore`].
///
/// Locks are durable (`instances.lock_owner`); handle bindings are
/// process-local because handles never outlive the hosting process.
pub struct SqliteStore {
    pool: SqlitePool,
    bindings: Mutex<HashMap<Uuid, Binding>>,
}

impl SqliteStore {
    /// Create a store over an existing, already migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// Connect to `url` and run migrations.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| StoreError::Backend {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        MIGRATOR.run(&pool).await.map_err(|e| StoreError::Backend {
            operation: "migrate".to_string(),
            details: format!("Failed to run migrations: {}", e),
        })?;

        Ok(Self::new(pool))
    }

    /// Open (creating if needed) a database file and run migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn claim(&self, handle: &InstanceHandle, instance_id: Uuid) -> Result<bool, StoreError> {
        let mut bindings = lock(&self.bindings);
        match bindings.get(&instance_id) {
            Some(binding) if binding.handle_id != handle.id() => {
                Err(StoreError::HandleConflict { instance_id })
            }
            Some(_) => Ok(false),
            None => {
                bindings.insert(
                    instance_id,
                    Binding {
                        handle_id: handle.id(),
                        owner_id: handle.owner_id(),
                    },
                );
                Ok(true)
            }
        }
    }

    fn unbind(&self, handle: &InstanceHandle, instance_id: Uuid) {
        let mut bindings = lock(&self.bindings);
        if bindings
            .get(&instance_id)
            .is_some_and(|b| b.handle_id == handle.id())
        {
            bindings.remove(&instance_id);
        }
    }

    fn bound_to_other(&self, handle: &InstanceHandle, instance_id: Uuid) -> bool {
        lock(&self.bindings)
            .get(&instance_id)
            .is_some_and(|b| b.handle_id != handle.id())
    }

    /// Take the durable lock and the handle binding for `row`.
    async fn lock_row(
        &self,
        conn: &mut SqliteConnection,
        handle: &InstanceHandle,
        row: &InstanceRow,
    ) -> Result<Uuid, StoreError> {
        let instance_id = parse_uuid(&row.instance_id)?;
        let owner = handle.owner_id();

        if let Some(other) = row.lock_owner.as_deref() {
            let other = parse_uuid(other)?;
            if other != owner {
                let address = owner_address(conn, other).await?;
                return Err(StoreError::InstanceLocked {
                    instance_id: Some(instance_id),
                    owner_id: Some(other),
                    address,
                });
            }
        }

        let newly_claimed = self.claim(handle, instance_id)?;
        let updated = sqlx::query(
            r#"
            UPDATE instances SET lock_owner = ?, updated_at = ?
            WHERE instance_id = ?
            "#,
        )
        .bind(owner.to_string())
        .bind(Utc::now())
        .bind(&row.instance_id)
        .execute(&mut *conn)
        .await;

        if let Err(e) = updated {
            if newly_claimed {
                self.unbind(handle, instance_id);
            }
            return Err(e.into());
        }
        Ok(instance_id)
    }

    #[instrument(skip(self, handle, command), fields(kind = ?command.kind(), owner_id = %handle.owner_id()))]
    async fn run(
        &self,
        handle: &InstanceHandle,
        command: StoreCommand,
    ) -> Result<InstanceView, StoreError> {
        let owner = handle.owner_id();

        match command {
            StoreCommand::CreateOwner { metadata } => {
                sqlx::query(
                    r#"
                    INSERT INTO instance_owners (owner_id, metadata, created_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(owner_id) DO UPDATE SET metadata = excluded.metadata
                    "#,
                )
                .bind(owner.to_string())
                .bind(serde_json::to_string(&metadata)?)
                .bind(Utc::now())
                .execute(&self.pool)
                .await?;
                Ok(InstanceView {
                    owner_id: Some(owner),
                    ..Default::default()
                })
            }
            StoreCommand::DeleteOwner => {
                let mut tx = self.pool.begin().await?;
                sqlx::query("UPDATE instances SET lock_owner = NULL WHERE lock_owner = ?")
                    .bind(owner.to_string())
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM instance_owners WHERE owner_id = ?")
                    .bind(owner.to_string())
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                lock(&self.bindings).retain(|_, b| b.owner_id != owner);
                Ok(InstanceView {
                    owner_id: Some(owner),
                    ..Default::default()
                })
            }
            StoreCommand::LoadById { instance_id } => {
                let mut tx = self.pool.begin().await?;
                let row = fetch_instance(&mut tx, instance_id)
                    .await?
                    .filter(|row| !row.is_completed)
                    .ok_or(StoreError::InstanceNotReady {
                        instance_id: Some(instance_id),
                    })?;
                self.lock_row(&mut tx, handle, &row).await?;
                let view = load_view(&mut tx, instance_id).await?;
                self.commit_load(tx, handle, instance_id).await?;
                Ok(view)
            }
            StoreCommand::LoadByKey {
                key,
                associate_keys,
            } => {
                let mut tx = self.pool.begin().await?;
                let instance_id = match fetch_key(&mut tx, key.value()).await? {
                    Some(row) if !row.is_completed => parse_uuid(&row.instance_id)?,
                    _ => return Err(StoreError::KeyNotReady { key: key.value() }),
                };
                let row = fetch_instance(&mut tx, instance_id).await?.ok_or(
                    StoreError::InstanceNotReady {
                        instance_id: Some(instance_id),
                    },
                )?;
                check_collisions(&mut tx, instance_id, &associate_keys).await?;
                self.lock_row(&mut tx, handle, &row).await?;
                insert_keys(&mut tx, instance_id, &associate_keys).await?;
                let view = load_view(&mut tx, instance_id).await?;
                self.commit_load(tx, handle, instance_id).await?;
                Ok(view)
            }
            StoreCommand::LoadOrCreate {
                instance_id,
                key,
                associate_keys,
            } => {
                let mut tx = self.pool.begin().await?;

                let mut existing = None;
                if let Some(key) = &key {
                    match fetch_key(&mut tx, key.value()).await? {
                        Some(row) if row.is_completed => {
                            return Err(StoreError::KeyNotReady { key: key.value() });
                        }
                        Some(row) => existing = Some(parse_uuid(&row.instance_id)?),
                        None => {}
                    }
                }
                if existing.is_none()
                    && let Some(id) = instance_id
                    && fetch_instance(&mut tx, id).await?.is_some()
                {
                    existing = Some(id);
                }

                let mut keys: Vec<InstanceKey> = key.into_iter().collect();
                keys.extend(associate_keys);

                let id = match existing {
                    Some(id) => id,
                    None => {
                        let id = instance_id.unwrap_or_else(Uuid::new_v4);
                        check_collisions(&mut tx, id, &keys).await?;
                        sqlx::query(
                            r#"
                            INSERT INTO instances (instance_id, created_at, updated_at)
                            VALUES (?, ?, ?)
                            "#,
                        )
                        .bind(id.to_string())
                        .bind(Utc::now())
                        .bind(Utc::now())
                        .execute(&mut *tx)
                        .await?;
                        debug!(instance_id = %id, "Created instance record");
                        id
                    }
                };

                let row = fetch_instance(&mut tx, id)
                    .await?
                    .ok_or(StoreError::InstanceNotReady {
                        instance_id: Some(id),
                    })?;
                if row.is_completed {
                    return Err(StoreError::InstanceNotReady {
                        instance_id: Some(id),
                    });
                }
                check_collisions(&mut tx, id, &keys).await?;
                self.lock_row(&mut tx, handle, &row).await?;
                insert_keys(&mut tx, id, &keys).await?;
                let view = load_view(&mut tx, id).await?;
                self.commit_load(tx, handle, id).await?;
                Ok(view)
            }
            StoreCommand::LoadRunnable => {
                let mut tx = self.pool.begin().await?;
                let row = sqlx::query_as::<_, InstanceRow>(
                    r#"
                    SELECT instance_id, data, metadata, lock_owner, is_initialized, is_completed
                    FROM instances
                    WHERE lock_owner IS NULL AND is_initialized = 1 AND is_completed = 0
                      AND status = 'Runnable'
                    ORDER BY updated_at
                    LIMIT 1
                    "#,
                )
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(StoreError::InstanceNotReady { instance_id: None })?;
                let id = self.lock_row(&mut tx, handle, &row).await?;
                let view = load_view(&mut tx, id).await?;
                self.commit_load(tx, handle, id).await?;
                Ok(view)
            }
            StoreCommand::Save(save) => {
                let instance_id = handle
                    .instance_id()
                    .ok_or(StoreError::InstanceNotReady { instance_id: None })?;
                self.save(handle, instance_id, save).await
            }
        }
    }

    async fn commit_load(
        &self,
        tx: sqlx::Transaction<'_, sqlx::Sqlite>,
        handle: &InstanceHandle,
        instance_id: Uuid,
    ) -> Result<(), StoreError> {
        if let Err(e) = tx.commit().await {
            self.unbind(handle, instance_id);
            return Err(e.into());
        }
        handle.bind(instance_id);
        Ok(())
    }

    async fn save(
        &self,
        handle: &InstanceHandle,
        instance_id: Uuid,
        save: SaveCommand,
    ) -> Result<InstanceView, StoreError> {
        let owner = handle.owner_id();
        let mut tx = self.pool.begin().await?;

        let row = fetch_instance(&mut tx, instance_id)
            .await?
            .ok_or(StoreError::InstanceNotReady {
                instance_id: Some(instance_id),
            })?;
        if let Some(lock_owner) = row.lock_owner.as_deref()
            && parse_uuid(lock_owner)? != owner
        {
            return Err(StoreError::LockLost { instance_id });
        }
        if self.bound_to_other(handle, instance_id) {
            return Err(StoreError::LockLost { instance_id });
        }

        check_collisions(&mut tx, instance_id, &save.keys_to_associate).await?;
        insert_keys(&mut tx, instance_id, &save.keys_to_associate).await?;
        for key in &save.keys_to_free {
            sqlx::query("DELETE FROM instance_keys WHERE key_id = ? AND instance_id = ?")
                .bind(key.to_string())
                .bind(instance_id.to_string())
                .execute(&mut *tx)
                .await?;
        }

        let mut metadata: BTreeMap<String, Value> = serde_json::from_str(&row.metadata)?;
        for (name, value) in save.instance_metadata {
            if value.is_null() {
                metadata.remove(&name);
            } else {
                metadata.insert(name, value);
            }
        }
        let status = metadata
            .get(names::STATUS)
            .and_then(Value::as_str)
            .map(str::to_string);

        let (data, is_initialized) = match (&save.instance_data, save.complete) {
            (_, true) => (InstanceData::new(), true),
            (Some(data), false) => (data.clone(), true),
            (None, false) => (serde_json::from_str(&row.data)?, row.is_initialized),
        };
        let lock_owner = if save.complete || save.unlock {
            None
        } else {
            Some(owner.to_string())
        };

        sqlx::query(
            r#"
            UPDATE instances
            SET data = ?, metadata = ?, status = ?, lock_owner = ?,
                is_initialized = ?, is_completed = ?, updated_at = ?
            WHERE instance_id = ?
            "#,
        )
        .bind(serde_json::to_string(&data)?)
        .bind(serde_json::to_string(&metadata)?)
        .bind(status)
        .bind(lock_owner)
        .bind(is_initialized)
        .bind(save.complete || row.is_completed)
        .bind(Utc::now())
        .bind(instance_id.to_string())
        .execute(&mut *tx)
        .await?;

        if save.complete {
            sqlx::query("UPDATE instance_keys SET is_completed = 1 WHERE instance_id = ?")
                .bind(instance_id.to_string())
                .execute(&mut *tx)
                .await?;
        }

        let view = load_view(&mut tx, instance_id).await?;
        tx.commit().await?;

        if save.complete || save.unlock {
            self.unbind(handle, instance_id);
        } else {
            self.claim(handle, instance_id)?;
        }
        Ok(view)
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Backend {
        operation: "parse_uuid".to_string(),
        details: format!("invalid identifier '{}': {}", raw, e),
    })
}

async fn fetch_instance(
    conn: &mut SqliteConnection,
    instance_id: Uuid,
) -> Result<Option<InstanceRow>, StoreError> {
    let row = sqlx::query_as::<_, InstanceRow>(
        r#"
        SELECT instance_id, data, metadata, lock_owner, is_initialized, is_completed
        FROM instances
        WHERE instance_id = ?
        "#,
    )
    .bind(instance_id.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

async fn fetch_key(conn: &mut SqliteConnection, key: Uuid) -> Result<Option<KeyRow>, StoreError> {
    let row = sqlx::query_as::<_, KeyRow>(
        r#"
        SELECT key_id, instance_id, metadata, is_completed
        FROM instance_keys
        WHERE key_id = ?
        "#,
    )
    .bind(key.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

async fn owner_address(
    conn: &mut SqliteConnection,
    owner_id: Uuid,
) -> Result<Option<String>, StoreError> {
    let metadata: Option<(String,)> =
        sqlx::query_as("SELECT metadata FROM instance_owners WHERE owner_id = ?")
            .bind(owner_id.to_string())
            .fetch_optional(&mut *conn)
            .await?;
    let Some((metadata,)) = metadata else {
        return Ok(None);
    };
    let metadata: BTreeMap<String, Value> = serde_json::from_str(&metadata)?;
    Ok(metadata
        .get("address")
        .and_then(Value::as_str)
        .map(str::to_string))
}

async fn check_collisions(
    conn: &mut SqliteConnection,
    instance_id: Uuid,
    keys: &[InstanceKey],
) -> Result<(), StoreError> {
    for key in keys {
        if let Some(row) = fetch_key(conn, key.value()).await? {
            let owner = parse_uuid(&row.instance_id)?;
            if owner != instance_id {
                return Err(StoreError::KeyCollision {
                    key: key.value(),
                    owner: Some(owner),
                });
            }
        }
    }
    Ok(())
}

async fn insert_keys(
    conn: &mut SqliteConnection,
    instance_id: Uuid,
    keys: &[InstanceKey],
) -> Result<(), StoreError> {
    for key in keys {
        sqlx::query(
            r#"
            INSERT INTO instance_keys (key_id, instance_id, metadata, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(key_id) DO NOTHING
            "#,
        )
        .bind(key.value().to_string())
        .bind(instance_id.to_string())
        .bind(serde_json::to_string(key.metadata())?)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn load_view(
    conn: &mut SqliteConnection,
    instance_id: Uuid,
) -> Result<InstanceView, StoreError> {
    let row = fetch_instance(conn, instance_id)
        .await?
        .ok_or(StoreError::InstanceNotReady {
            instance_id: Some(instance_id),
        })?;
    let key_rows = sqlx::query_as::<_, KeyRow>(
        r#"
        SELECT key_id, instance_id, metadata, is_completed
        FROM instance_keys
        WHERE instance_id = ? AND is_completed = 0
        ORDER BY created_at
        "#,
    )
    .bind(instance_id.to_string())
    .fetch_all(&mut *conn)
    .await?;

    let mut keys = Vec::with_capacity(key_rows.len());
    for key_row in key_rows {
        let metadata: BTreeMap<String, Value> = serde_json::from_str(&key_row.metadata)?;
        let mut key = InstanceKey::new(parse_uuid(&key_row.key_id)?);
        for (name, value) in metadata {
            key = key.with_metadata(name, value);
        }
        keys.push(key);
    }

    let owner_id = row.lock_owner.as_deref().map(parse_uuid).transpose()?;
    Ok(InstanceView {
        owner_id,
        instance_id: Some(instance_id),
        data: serde_json::from_str(&row.data)?,
        metadata: serde_json::from_str(&row.metadata)?,
        keys,
        is_locked: owner_id.is_some(),
        is_initialized: row.is_initialized,
        is_completed: row.is_completed,
    })
}

#[async_trait]
impl InstanceStore for SqliteStore {
    async fn execute(
        &self,
        handle: &InstanceHandle,
        command: StoreCommand,
        timeout: Duration,
    ) -> Result<InstanceView, StoreError> {
        if !handle.is_valid() {
            return Err(StoreError::OperationCanceled);
        }
        match tokio::time::timeout(timeout, self.run(handle, command)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(timeout)),
        }
    }

    fn free_handle(&self, handle: &InstanceHandle) {
        handle.invalidate();
        if let Some(instance_id) = handle.instance_id() {
            self.unbind(handle, instance_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Create an in-memory SQLite store for testing.
    async fn test_store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        MIGRATOR.run(&pool).await.expect("Failed to run migrations");

        SqliteStore::new(pool)
    }

    async fn owner_handle(store: &SqliteStore) -> InstanceHandle {
        let handle = InstanceHandle::new(Uuid::new_v4());
        store
            .execute(
                &handle,
                StoreCommand::CreateOwner {
                    metadata: BTreeMap::new(),
                },
                TIMEOUT,
            )
            .await
            .expect("Failed to create owner");
        handle
    }

    #[tokio::test]
    async fn test_create_save_and_reload_by_key() {
        let store = test_store().await;
        let handle = owner_handle(&store).await;
        let key = InstanceKey::new(Uuid::new_v4()).with_metadata("queue", Value::from("orders"));

        let view = store
            .execute(
                &handle,
                StoreCommand::LoadOrCreate {
                    instance_id: None,
                    key: Some(key.clone()),
                    associate_keys: vec![],
                },
                TIMEOUT,
            )
            .await
            .unwrap();
        let id = view.instance_id.unwrap();
        assert!(!view.is_initialized);

        let data = InstanceData::new().with(names::WORKFLOW_STATE, Value::from("waiting"));
        let mut metadata = BTreeMap::new();
        metadata.insert(names::STATUS.to_string(), Value::from("Idle"));
        store
            .execute(
                &handle,
                StoreCommand::Save(SaveCommand {
                    instance_data: Some(data.clone()),
                    instance_metadata: metadata,
                    unlock: true,
                    ..Default::default()
                }),
                TIMEOUT,
            )
            .await
            .unwrap();
        store.free_handle(&handle);

        let other = owner_handle(&store).await;
        let view = store
            .execute(
                &other,
                StoreCommand::LoadByKey {
                    key: key.clone(),
                    associate_keys: vec![],
                },
                TIMEOUT,
            )
            .await
            .unwrap();
        assert_eq!(view.instance_id, Some(id));
        assert!(view.is_initialized);
        assert_eq!(view.data, data);
        assert_eq!(view.keys.len(), 1);
        assert_eq!(view.keys[0].metadata().get("queue"), Some(&Value::from("orders")));
        assert_eq!(view.owner_id, Some(other.owner_id()));
    }

    #[tokio::test]
    async fn test_locked_instance_redirects_to_owner() {
        let store = test_store().await;
        let first = InstanceHandle::new(Uuid::new_v4());
        let mut metadata = BTreeMap::new();
        metadata.insert("address".to_string(), Value::from("node-a:7001"));
        store
            .execute(&first, StoreCommand::CreateOwner { metadata }, TIMEOUT)
            .await
            .unwrap();
        let id = Uuid::new_v4();
        store
            .execute(
                &first,
                StoreCommand::LoadOrCreate {
                    instance_id: Some(id),
                    key: None,
                    associate_keys: vec![],
                },
                TIMEOUT,
            )
            .await
            .unwrap();

        let second = owner_handle(&store).await;
        let err = store
            .execute(&second, StoreCommand::LoadById { instance_id: id }, TIMEOUT)
            .await
            .unwrap_err();
        match err {
            StoreError::InstanceLocked {
                owner_id, address, ..
            } => {
                assert_eq!(owner_id, Some(first.owner_id()));
                assert_eq!(address.as_deref(), Some("node-a:7001"));
            }
            other => panic!("expected InstanceLocked, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_same_owner_second_handle_conflicts() {
        let store = test_store().await;
        let first = owner_handle(&store).await;
        let second = InstanceHandle::new(first.owner_id());
        let id = Uuid::new_v4();
        let command = StoreCommand::LoadOrCreate {
            instance_id: Some(id),
            key: None,
            associate_keys: vec![],
        };

        store.execute(&first, command.clone(), TIMEOUT).await.unwrap();
        let err = store.execute(&second, command, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, StoreError::HandleConflict { .. }));
    }

    #[tokio::test]
    async fn test_key_collision_between_instances() {
        let store = test_store().await;
        let handle = owner_handle(&store).await;
        let shared = InstanceKey::new(Uuid::new_v4());
        store
            .execute(
                &handle,
                StoreCommand::LoadOrCreate {
                    instance_id: None,
                    key: Some(shared.clone()),
                    associate_keys: vec![],
                },
                TIMEOUT,
            )
            .await
            .unwrap();

        let other = owner_handle(&store).await;
        let err = store
            .execute(
                &other,
                StoreCommand::LoadOrCreate {
                    instance_id: None,
                    key: Some(InstanceKey::new(Uuid::new_v4())),
                    associate_keys: vec![shared],
                },
                TIMEOUT,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::KeyCollision { .. }));
    }

    #[tokio::test]
    async fn test_delete_owner_releases_locks() {
        let store = test_store().await;
        let handle = owner_handle(&store).await;
        let id = Uuid::new_v4();
        store
            .execute(
                &handle,
                StoreCommand::LoadOrCreate {
                    instance_id: Some(id),
                    key: None,
                    associate_keys: vec![],
                },
                TIMEOUT,
            )
            .await
            .unwrap();
        store
            .execute(&handle, StoreCommand::DeleteOwner, TIMEOUT)
            .await
            .unwrap();

        let other = owner_handle(&store).await;
        let view = store
            .execute(&other, StoreCommand::LoadById { instance_id: id }, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(view.owner_id, Some(other.owner_id()));
    }

    #[tokio::test]
    async fn test_load_runnable_skips_idle_instances() {
        let store = test_store().await;
        let handle = owner_handle(&store).await;

        for status in ["Idle", "Runnable"] {
            let loader = InstanceHandle::new(handle.owner_id());
            store
                .execute(
                    &loader,
                    StoreCommand::LoadOrCreate {
                        instance_id: None,
                        key: None,
                        associate_keys: vec![],
                    },
                    TIMEOUT,
                )
                .await
                .unwrap();
            let mut metadata = BTreeMap::new();
            metadata.insert(names::STATUS.to_string(), Value::from(status));
            store
                .execute(
                    &loader,
                    StoreCommand::Save(SaveCommand {
                        instance_data: Some(InstanceData::new()),
                        instance_metadata: metadata,
                        unlock: true,
                        ..Default::default()
                    }),
                    TIMEOUT,
                )
                .await
                .unwrap();
            store.free_handle(&loader);
        }

        let view = store
            .execute(&handle, StoreCommand::LoadRunnable, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(
            view.metadata.get(names::STATUS),
            Some(&Value::from("Runnable"))
        );

        let again = InstanceHandle::new(handle.owner_id());
        let err = store
            .execute(&again, StoreCommand::LoadRunnable, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InstanceNotReady { instance_id: None }));
    }
}
