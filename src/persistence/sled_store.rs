//! Map storage backed by `sled`.
//!
//! Map names become tree names prefixed with `map:` so they never collide with
//! sled's default tree. Writes are last-write-wins; removes are idempotent.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sled::Db;
use tracing::debug;

use crate::utils::error::Result;

const TREE_PREFIX: &str = "map:";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoredValue {
    pub body: Value,
    pub updated_at: i64,
}

#[derive(Clone)]
pub struct MapStore {
    db: Db,
}

impl MapStore {
    /// Open or create a sled database at `path`.
    pub fn open(path: &str) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Database that lives only as long as the process.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn tree(&self, map: &str) -> Result<sled::Tree> {
        Ok(self.db.open_tree(format!("{TREE_PREFIX}{map}"))?)
    }

    pub fn set(&self, map: &str, key: &str, body: Value) -> Result<()> {
        let stored = StoredValue {
            body,
            updated_at: Utc::now().timestamp_millis(),
        };
        let serialized = serde_json::to_vec(&stored)?;
        self.tree(map)?.insert(key.as_bytes(), serialized)?;
        debug!("map '{map}' set key '{key}'");
        Ok(())
    }

    pub fn get(&self, map: &str, key: &str) -> Result<Option<Value>> {
        let Some(raw) = self.tree(map)?.get(key.as_bytes())? else {
            return Ok(None);
        };
        let stored: StoredValue = serde_json::from_slice(&raw)?;
        Ok(Some(stored.body))
    }

    /// Removes `key`; returns whether it existed.
    pub fn remove(&self, map: &str, key: &str) -> Result<bool> {
        let existed = self.tree(map)?.remove(key.as_bytes())?.is_some();
        debug!("map '{map}' remove key '{key}' (existed: {existed})");
        Ok(existed)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Keys currently stored in `map`, in byte order.
    pub fn keys(&self, map: &str) -> Result<Vec<String>> {
        self.tree(map)?
            .iter()
            .keys()
            .map(|k| {
                k.map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    .map_err(Into::into)
            })
            .collect()
    }
}

impl std::fmt::Debug for MapStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapStore")
            .field("db", &"sled::Db")
            .finish()
    }
}
