//! Bidirectional sync: detect and resolve local/remote conflicts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use intsync_common::{ConflictStrategy, Error, Record, Result};

/// A conflict between stored (local) and incoming (remote) data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedConflict {
    /// e.g. `field_level`.
    pub conflict_type: String,
    /// Fields present on both sides with different values.
    pub fields: Vec<String>,
    pub local: Record,
    pub remote: Record,
}

/// The value a resolved conflict settles on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedConflict {
    pub resolved: Record,
}

/// Conflict detection and resolution for bidirectional sync.
#[async_trait]
pub trait BidirectionalEngine: Send + Sync {
    /// Compare local and remote data; `None` when they agree.
    async fn detect_conflicts(&self, local: &Record, remote: &Record)
        -> Result<Option<DetectedConflict>>;

    /// Produce the resolved value for `conflict` under `strategy`.
    ///
    /// # Errors
    /// - `InvalidInput` for [`ConflictStrategy::Manual`], which has no
    ///   automatic resolution
    async fn resolve_conflict(
        &self,
        conflict: &DetectedConflict,
        strategy: ConflictStrategy,
    ) -> Result<ResolvedConflict>;
}

/// Field-level comparison of top-level object keys.
///
/// Only keys present on both sides can conflict; keys unique to one side
/// are carried into merged results.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldLevelConflictEngine;

impl FieldLevelConflictEngine {
    pub fn new() -> Self {
        Self
    }

    /// `base` with every key of `overlay` written over it.
    fn overlay(base: &Record, overlay: &Record) -> Record {
        let mut merged: Map<String, Value> = base.as_object().cloned().unwrap_or_default();
        if let Some(fields) = overlay.as_object() {
            for (key, value) in fields {
                merged.insert(key.clone(), value.clone());
            }
        }
        Value::Object(merged)
    }
}

#[async_trait]
impl BidirectionalEngine for FieldLevelConflictEngine {
    async fn detect_conflicts(
        &self,
        local: &Record,
        remote: &Record,
    ) -> Result<Option<DetectedConflict>> {
        let (Some(local_fields), Some(remote_fields)) = (local.as_object(), remote.as_object())
        else {
            return Ok((local != remote).then(|| DetectedConflict {
                conflict_type: "value".to_string(),
                fields: Vec::new(),
                local: local.clone(),
                remote: remote.clone(),
            }));
        };

        let mut fields: Vec<String> = local_fields
            .iter()
            .filter(|(key, value)| {
                remote_fields
                    .get(key.as_str())
                    .is_some_and(|remote_value| remote_value != *value)
            })
            .map(|(key, _)| key.clone())
            .collect();
        fields.sort();

        if fields.is_empty() {
            return Ok(None);
        }

        Ok(Some(DetectedConflict {
            conflict_type: "field_level".to_string(),
            fields,
            local: local.clone(),
            remote: remote.clone(),
        }))
    }

    async fn resolve_conflict(
        &self,
        conflict: &DetectedConflict,
        strategy: ConflictStrategy,
    ) -> Result<ResolvedConflict> {
        let resolved = match strategy {
            ConflictStrategy::Merge => Self::overlay(&conflict.local, &conflict.remote),
            ConflictStrategy::PreferLocal => Self::overlay(&conflict.remote, &conflict.local),
            ConflictStrategy::PreferRemote => conflict.remote.clone(),
            ConflictStrategy::Manual => {
                return Err(Error::InvalidInput(
                    "manual conflicts cannot be resolved automatically".to_string(),
                ))
            }
        };
        Ok(ResolvedConflict { resolved })
    }
}
