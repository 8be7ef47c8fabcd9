use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::SqliteConnection;
use log::debug;
use serde_json::Value;

use ledgerly_core::errors::{Error, Result};
use ledgerly_core::sync::KeyValueStore;

use super::model::LocalKvDB;
use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::local_kv;

/// [`KeyValueStore`] over the `local_kv` table. Values are stored as JSON text;
/// every `set` is a single upsert, so a document is either fully replaced or not
/// at all.
pub struct SqliteKeyValueStore {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl SqliteKeyValueStore {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        Self { pool, writer }
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        let mut conn = get_connection(&self.pool)?;
        let keys = local_kv::table
            .select(local_kv::key)
            .order(local_kv::key.asc())
            .load::<String>(&mut conn)
            .map_err(StorageError::from)?;
        Ok(keys)
    }
}

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut conn = get_connection(&self.pool)?;
        let row = local_kv::table
            .find(key)
            .select(LocalKvDB::as_select())
            .first::<LocalKvDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;

        match row {
            None => Ok(None),
            Some(row) => serde_json::from_str(&row.value)
                .map(Some)
                .map_err(|e| Error::local(format!("Corrupt value under '{}': {}", key, e))),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let row = LocalKvDB {
            key: key.to_string(),
            value: serde_json::to_string(&value)?,
            updated_at: Utc::now().to_rfc3339(),
        };
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<()> {
                diesel::insert_into(local_kv::table)
                    .values(&row)
                    .on_conflict(local_kv::key)
                    .do_update()
                    .set((
                        local_kv::value.eq(&row.value),
                        local_kv::updated_at.eq(&row.updated_at),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<()> {
                let deleted = diesel::delete(local_kv::table.find(&key))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                if deleted > 0 {
                    debug!("Removed local key '{}'", key);
                }
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_pool, init, run_migrations, spawn_writer};
    use ledgerly_core::entities::{Entity, EntityKind, Payload};
    use ledgerly_core::sync::{
        ConnectivityMonitor, ConnectivityState, MutationEntry, MutationQueue, Query,
        RemoteStore, SyncEngine, Target, WriteOperation,
    };
    use ledgerly_core::SyncConfig;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    fn open(dir: &TempDir) -> SqliteKeyValueStore {
        let app_data = dir.path().to_string_lossy().to_string();
        let db_path = init(&app_data).expect("init db");
        run_migrations(&db_path).expect("migrate db");
        let pool = create_pool(&db_path).expect("create pool");
        let writer = spawn_writer(pool.as_ref().clone());
        SqliteKeyValueStore::new(pool, writer)
    }

    struct UnreachableRemote;

    #[async_trait]
    impl RemoteStore for UnreachableRemote {
        async fn select(&self, _: &str, _: &Query) -> Result<Vec<Entity>> {
            Err(Error::connectivity("offline"))
        }
        async fn insert(&self, _: &str, _: Payload) -> Result<Entity> {
            Err(Error::connectivity("offline"))
        }
        async fn update(&self, _: &str, _: &Target, _: Payload) -> Result<Vec<Entity>> {
            Err(Error::connectivity("offline"))
        }
        async fn delete(&self, _: &str, _: &Target) -> Result<()> {
            Err(Error::connectivity("offline"))
        }
    }

    #[tokio::test]
    async fn set_get_and_remove() {
        let dir = tempdir().expect("tempdir");
        let store = open(&dir);

        assert_eq!(store.get("missing").await.expect("get"), None);

        store
            .set("collection:categories", json!([{"id": "c1", "name": "Food"}]))
            .await
            .expect("set");
        store
            .set("collection:categories", json!([{"id": "c2", "name": "Rent"}]))
            .await
            .expect("overwrite");
        assert_eq!(
            store.get("collection:categories").await.expect("get"),
            Some(json!([{"id": "c2", "name": "Rent"}]))
        );
        assert_eq!(store.keys().expect("keys"), vec!["collection:categories"]);

        store.remove("collection:categories").await.expect("remove");
        assert_eq!(store.get("collection:categories").await.expect("get"), None);
        store.remove("collection:categories").await.expect("remove twice");
    }

    #[tokio::test]
    async fn corrupt_values_surface_as_local_persistence_errors() {
        let dir = tempdir().expect("tempdir");
        let store = open(&dir);
        store
            .writer
            .exec(|conn: &mut SqliteConnection| -> Result<()> {
                diesel::insert_into(local_kv::table)
                    .values(LocalKvDB {
                        key: "broken".to_string(),
                        value: "{not json".to_string(),
                        updated_at: Utc::now().to_rfc3339(),
                    })
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
            .expect("insert raw row");

        let err = store.get("broken").await.expect_err("corrupt");
        assert!(matches!(err, Error::LocalPersistence(_)));
    }

    #[tokio::test]
    async fn failed_job_rolls_back_its_transaction() {
        let dir = tempdir().expect("tempdir");
        let store = open(&dir);

        let result = store
            .writer
            .exec(|conn: &mut SqliteConnection| -> Result<()> {
                diesel::insert_into(local_kv::table)
                    .values(LocalKvDB {
                        key: "half".to_string(),
                        value: "1".to_string(),
                        updated_at: Utc::now().to_rfc3339(),
                    })
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Err(Error::InvalidOperation("abort".to_string()))
            })
            .await;

        assert!(matches!(result, Err(Error::InvalidOperation(_))));
        assert_eq!(store.get("half").await.expect("get"), None);
    }

    #[tokio::test]
    async fn mutation_queue_survives_reopening_the_database() {
        let dir = tempdir().expect("tempdir");
        let before = {
            let queue = MutationQueue::new(Arc::new(open(&dir)));
            for amount in [10, 20] {
                let mut payload = Payload::new();
                payload.insert("amount".to_string(), json!(amount));
                queue
                    .enqueue(MutationEntry::Add {
                        kind: EntityKind::Transaction,
                        payload,
                        temp_id: ledgerly_core::entities::EntityId::temporary(),
                    })
                    .await
                    .expect("enqueue");
            }
            queue.drain().await.expect("drain")
        };

        let queue = MutationQueue::new(Arc::new(open(&dir)));
        assert_eq!(queue.drain().await.expect("drain"), before);
    }

    #[tokio::test]
    async fn offline_engine_state_is_restored_after_restart() {
        let dir = tempdir().expect("tempdir");
        let monitor = Arc::new(ConnectivityMonitor::new(ConnectivityState::Offline));

        let temp_id = {
            let engine = Arc::new(SyncEngine::new(
                SyncConfig::default(),
                Arc::new(UnreachableRemote),
                Arc::new(open(&dir)),
                monitor.clone(),
            ));
            engine.init().await.expect("init");
            let mut payload = Payload::new();
            payload.insert("date".to_string(), json!("2024-01-05"));
            payload.insert("amount".to_string(), json!(42.5));
            payload.insert("category".to_string(), json!("Food"));
            let outcome = engine
                .write(WriteOperation::Add {
                    kind: EntityKind::Transaction,
                    payload,
                })
                .await
                .expect("offline write");
            engine.dispose().await;
            outcome.entity.expect("entity").id
        };

        let engine = Arc::new(SyncEngine::new(
            SyncConfig::default(),
            Arc::new(UnreachableRemote),
            Arc::new(open(&dir)),
            monitor,
        ));
        engine.init().await.expect("init");

        assert_eq!(engine.status().pending_mutations, 1);
        let rows = engine
            .read(EntityKind::Transaction, &Query::new())
            .await
            .expect("read");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, temp_id);
        engine.dispose().await;
    }
}
