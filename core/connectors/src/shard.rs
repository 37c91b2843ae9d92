//! Shard service: the store of converted entities.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use intsync_common::{Error, Record, Result, ShardId};

/// A create-or-update request for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardWrite {
    /// Target shard type from the conversion schema.
    pub target_type: String,
    pub data: Record,
    /// Existing entity to update; `None` creates a new one.
    pub existing: Option<ShardId>,
}

/// Identifiers produced by a write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardResult {
    pub primary_shard_id: ShardId,
    #[serde(default)]
    pub derived_shard_ids: Vec<ShardId>,
}

/// Creates, updates and reads stored entities.
#[async_trait]
pub trait ShardService: Send + Sync {
    /// Create or update the entity described by `write`.
    async fn create_shards_from_integration_data(&self, write: ShardWrite) -> Result<ShardResult>;

    /// Current data of a stored entity.
    async fn get_shard_data(&self, id: &ShardId) -> Result<Option<Record>>;
}

/// A stored entity.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredShard {
    pub shard_type: String,
    pub data: Record,
}

/// In-memory shard store.
///
/// Clones share storage, so the same store can back both the shard and the
/// dedup service.
#[derive(Debug, Clone, Default)]
pub struct MemoryShardStore {
    shards: Arc<RwLock<BTreeMap<String, StoredShard>>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryShardStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self, shard_type: &str) -> Result<ShardId> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        ShardId::new(format!("{}-{}", shard_type, n))
    }

    /// Store an entity directly and return its id.
    pub fn insert(&self, shard_type: &str, data: Record) -> Result<ShardId> {
        let id = self.allocate_id(shard_type)?;
        self.shards
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id.as_str().to_string(),
                StoredShard {
                    shard_type: shard_type.to_string(),
                    data,
                },
            );
        Ok(id)
    }

    /// Snapshot of an entity.
    pub fn get(&self, id: &ShardId) -> Option<StoredShard> {
        self.shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id.as_str())
            .cloned()
    }

    /// Replace an entity's data, returning false if it does not exist.
    pub fn replace(&self, id: &ShardId, data: Record) -> bool {
        match self
            .shards
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(id.as_str())
        {
            Some(shard) => {
                shard.data = data;
                true
            }
            None => false,
        }
    }

    /// Remove an entity.
    pub fn remove(&self, id: &ShardId) -> Option<StoredShard> {
        self.shards
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id.as_str())
    }

    /// Ids of entities whose top-level `field` equals `value`, in id order.
    pub fn find_by_field(&self, field: &str, value: &Value) -> Vec<ShardId> {
        self.shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, shard)| shard.data.get(field) == Some(value))
            .filter_map(|(id, _)| ShardId::new(id.clone()).ok())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ShardService for MemoryShardStore {
    async fn create_shards_from_integration_data(&self, write: ShardWrite) -> Result<ShardResult> {
        let Some(existing) = write.existing else {
            let id = self.insert(&write.target_type, write.data)?;
            return Ok(ShardResult {
                primary_shard_id: id,
                derived_shard_ids: Vec::new(),
            });
        };

        let mut shards = self.shards.write().unwrap_or_else(PoisonError::into_inner);
        let shard = shards
            .get_mut(existing.as_str())
            .ok_or_else(|| Error::NotFound(format!("shard {}", existing)))?;
        shard.data = write.data;

        Ok(ShardResult {
            primary_shard_id: existing,
            derived_shard_ids: Vec::new(),
        })
    }

    async fn get_shard_data(&self, id: &ShardId) -> Result<Option<Record>> {
        Ok(self.get(id).map(|shard| shard.data))
    }
}
