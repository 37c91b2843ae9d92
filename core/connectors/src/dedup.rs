//! Deduplication service: match incoming records to stored entities.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use intsync_common::{DedupConfig, Error, Record, Result, ShardId};

use crate::shard::MemoryShardStore;

/// Finds existing entities an incoming record duplicates.
#[async_trait]
pub trait DedupService: Send + Sync {
    /// Ids of stored entities matching `record`, best match first.
    async fn find_duplicates(&self, config: &DedupConfig, record: &Record) -> Result<Vec<ShardId>>;

    /// Merge the given entities into one and return the surviving id.
    ///
    /// # Errors
    /// - `InvalidInput` if `ids` is empty
    async fn merge_duplicates(&self, ids: &[ShardId]) -> Result<ShardId>;
}

/// Dedup service matching on the schema's external id field only.
///
/// Merging keeps the first entity and copies over fields it lacks from the
/// others, which are then removed. Opaque `rules` are ignored.
pub struct ExternalIdDedupService {
    store: MemoryShardStore,
}

impl ExternalIdDedupService {
    pub fn new(store: MemoryShardStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DedupService for ExternalIdDedupService {
    async fn find_duplicates(&self, config: &DedupConfig, record: &Record) -> Result<Vec<ShardId>> {
        let Some(field) = config.external_id_field.as_deref() else {
            return Ok(Vec::new());
        };
        match record.get(field) {
            Some(value) if !value.is_null() => Ok(self.store.find_by_field(field, value)),
            _ => Ok(Vec::new()),
        }
    }

    async fn merge_duplicates(&self, ids: &[ShardId]) -> Result<ShardId> {
        let (survivor, rest) = ids
            .split_first()
            .ok_or_else(|| Error::InvalidInput("nothing to merge".to_string()))?;

        let mut merged = self
            .store
            .get(survivor)
            .ok_or_else(|| Error::NotFound(format!("shard {}", survivor)))?;

        for id in rest {
            let Some(duplicate) = self.store.remove(id) else {
                continue;
            };
            if let (Some(target), Value::Object(source)) =
                (merged.data.as_object_mut(), duplicate.data)
            {
                for (key, value) in source {
                    target.entry(key).or_insert(value);
                }
            }
            debug!("Merged shard {} into {}", id, survivor);
        }

        self.store.replace(survivor, merged.data);
        Ok(survivor.clone())
    }
}
