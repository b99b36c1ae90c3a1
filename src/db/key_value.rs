use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::RwLock;

/// String key-value storage, the only shape in which device preferences are
/// consumed.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, sqlx::Error>;
    async fn set(&self, key: &str, value: &str) -> Result<(), sqlx::Error>;
    async fn remove(&self, key: &str) -> Result<(), sqlx::Error>;
}

pub struct SqliteKeyValueStore {
    db: SqlitePool,
}

impl SqliteKeyValueStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar::<_, String>("SELECT value FROM key_values WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.db)
            .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT OR REPLACE INTO key_values (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM key_values WHERE key = ?")
            .bind(key)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryKeyValueStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, sqlx::Error> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), sqlx::Error> {
        self.values
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), sqlx::Error> {
        self.values.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn sqlite_store_overwrites_and_removes() {
        let store = SqliteKeyValueStore::new(test_pool().await);

        assert_eq!(store.get("last_sync_time").await.unwrap(), None);

        store.set("last_sync_time", "2024-01-01T00:00:00Z").await.unwrap();
        store.set("last_sync_time", "2024-01-03T00:00:00Z").await.unwrap();
        assert_eq!(
            store.get("last_sync_time").await.unwrap().as_deref(),
            Some("2024-01-03T00:00:00Z")
        );

        store.remove("last_sync_time").await.unwrap();
        assert_eq!(store.get("last_sync_time").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_store_keeps_keys_apart() {
        let store = MemoryKeyValueStore::new();
        store.set("a", "1").await.unwrap();
        store.set("b", "2").await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.get("b").await.unwrap().as_deref(), Some("2"));
    }
}
