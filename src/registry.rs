//! Shared configuration registry
//!
//! A replicated key/value tree with slash-path keys, the source of truth
//! for non-filesystem cluster configs and per-host service metadata.
//! Deployments back it with their replicated store; [`MemoryRegistry`] is a
//! linearizable in-process implementation used by tests and single-host
//! setups.

use crate::error::{InstallerError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Replicated key/value tree with slash-path keys.
///
/// Writes are atomic and linearizable per key; `set_if_absent` is the
/// primitive under the fleet-wide claim mutex.
#[async_trait]
pub trait ConfigRegistry: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Get the raw value at `key`; `NotFound` when absent.
    async fn get(&self, key: &str) -> Result<String>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Direct child names under `prefix` (no recursion, no duplicates).
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Atomically set `key` only when absent. Returns whether the write won.
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool>;
}

/// Read a JSON document from the registry
pub async fn get_json<T: DeserializeOwned>(
    registry: &dyn ConfigRegistry,
    key: &str,
) -> Result<T> {
    let raw = registry.get(key).await?;
    serde_json::from_str(&raw).map_err(Into::into)
}

/// Write a JSON document to the registry
pub async fn set_json<T: Serialize>(
    registry: &dyn ConfigRegistry,
    key: &str,
    value: &T,
) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    registry.set(key, &raw).await
}

/// In-process registry implementation
#[derive(Default)]
pub struct MemoryRegistry {
    entries: Arc<RwLock<BTreeMap<String, String>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigRegistry for MemoryRegistry {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.entries.read().contains_key(key))
    }

    async fn get(&self, key: &str) -> Result<String> {
        self.entries
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| InstallerError::NotFound(format!("Key {} not found", key)))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        let entries = self.entries.read();
        let mut children: Vec<String> = Vec::new();
        for key in entries.keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                let child = rest.split('/').next().unwrap_or(rest).to_string();
                if !child.is_empty() && !children.contains(&child) {
                    children.push(child);
                }
            }
        }
        Ok(children)
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        let mut entries = self.entries.write();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(true)
    }
}
