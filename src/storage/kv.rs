//! Key-value persistence
//!
//! Everything the orchestrator persists is a JSON document under a fixed key.
//! The [`KeyValueStore`] trait keeps that blob behind a seam; the SQLite table
//! created by the migrations is the default backing.

use crate::error::Result;
use crate::storage::Database;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Completed downloads (`Vec<DownloadedItem>`)
pub const KEY_DOWNLOADED_ITEMS: &str = "downloadedItems";
/// Stable per-install device identifier
pub const KEY_DEVICE_ID: &str = "deviceId";
/// Pending and in-flight local download requests
pub const KEY_DOWNLOAD_QUEUE: &str = "downloadQueue";
/// Completed job ids already surfaced to the user
pub const KEY_ACKNOWLEDGED_JOBS: &str = "acknowledgedJobs";

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Removing a missing key is not an error
    async fn remove(&self, key: &str) -> Result<()>;
}

/// [`KeyValueStore`] over the `KeyValueStore` table
#[derive(Debug, Clone)]
pub struct SqliteKeyValueStore {
    db: Database,
}

impl SqliteKeyValueStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT Value FROM KeyValueStore WHERE Key = ?")
            .bind(key)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO KeyValueStore (Key, Value, UpdatedAt)
            VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(Key) DO UPDATE SET
                Value = excluded.Value,
                UpdatedAt = excluded.UpdatedAt
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM KeyValueStore WHERE Key = ?")
            .bind(key)
            .execute(self.db.pool())
            .await?;

        Ok(())
    }
}

/// Read and decode the JSON document under `key`
pub async fn load_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Like [`load_json`], but an undecodable document reads as the default
///
/// A corrupt blob must not keep the orchestrator from starting. It is logged
/// and overwritten by the next save.
pub async fn load_json_or_default<T: DeserializeOwned + Default>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<T> {
    let Some(raw) = store.get(key).await? else {
        return Ok(T::default());
    };

    match serde_json::from_str(&raw) {
        Ok(value) => Ok(value),
        Err(e) => {
            tracing::warn!(key, error = %e, "discarding undecodable stored value");
            Ok(T::default())
        }
    }
}

/// Encode `value` as JSON and store it under `key`
pub async fn save_json<T: Serialize + ?Sized>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw).await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteKeyValueStore {
        SqliteKeyValueStore::new(Database::new_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_set_get_overwrite_remove() {
        let store = store().await;

        assert_eq!(store.get("k").await.unwrap(), None);
        store.set("k", "one").await.unwrap();
        store.set("k", "two").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("two"));

        store.remove("k").await.unwrap();
        store.remove("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let store = store().await;

        save_json(&store, KEY_ACKNOWLEDGED_JOBS, &vec!["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        let ids: Option<Vec<String>> = load_json(&store, KEY_ACKNOWLEDGED_JOBS).await.unwrap();
        assert_eq!(ids.unwrap(), vec!["a", "b"]);

        store.set(KEY_DOWNLOAD_QUEUE, "{not json").await.unwrap();
        assert!(load_json::<Vec<String>>(&store, KEY_DOWNLOAD_QUEUE).await.is_err());
        let fallback: Vec<String> = load_json_or_default(&store, KEY_DOWNLOAD_QUEUE).await.unwrap();
        assert!(fallback.is_empty());
    }
}
