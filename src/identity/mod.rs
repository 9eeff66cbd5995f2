//! Stable device identity for the relay endpoint.
//!
//! `DeviceId` is derived once per install from a random UUID hashed together
//! with the OS username, stored in the endpoint's `device_id` setting, and
//! returned unchanged on every subsequent startup.

use anyhow::Result;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::storage::Storage;

const SETTING_KEY: &str = "device_id";

/// Returns the stable device identity string, creating it on first run.
pub async fn get_or_create(storage: &Storage) -> Result<String> {
    if let Some(id) = storage.get_setting(SETTING_KEY).await? {
        return Ok(id);
    }

    let seed = Uuid::new_v4().to_string();
    let user = os_username();
    let digest = hex_sha256(&format!("{seed}:{user}"));
    storage.set_setting(SETTING_KEY, &digest).await?;
    Ok(digest)
}

fn os_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn hex_sha256(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}
