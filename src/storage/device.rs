//! Per-install device identifier sent with every job API call

use crate::error::Result;
use crate::storage::kv::{KeyValueStore, KEY_DEVICE_ID};
use uuid::Uuid;

/// Return the stored device id, creating and persisting a UUID v4 on first use
pub async fn get_or_create_device_id(store: &dyn KeyValueStore) -> Result<String> {
    if let Some(existing) = store.get(KEY_DEVICE_ID).await? {
        let existing = existing.trim();
        if !existing.is_empty() {
            return Ok(existing.to_string());
        }
    }

    let id = Uuid::new_v4().to_string();
    store.set(KEY_DEVICE_ID, &id).await?;
    tracing::info!(device_id = %id, "generated device id");
    Ok(id)
}
