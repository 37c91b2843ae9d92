//! Conflict handling for bidirectional sync.

use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

use intsync_common::{
    ConflictId, ConflictStatus, ConflictStrategy, Record, Result, ShardId, SyncConflict,
    SyncExecution,
};
use intsync_connectors::BidirectionalEngine;
use intsync_storage::ConflictRepository;

/// What the save step should do after conflict handling.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictOutcome {
    /// Stored and incoming data agree; save the incoming record.
    NoConflict,
    /// Conflict settled automatically; save `value` instead.
    Resolved { conflict_id: ConflictId, value: Record },
    /// Left for manual resolution; the record must not be saved.
    Pending { conflict_id: ConflictId },
}

/// Detects conflicts, applies the schema's strategy and persists a conflict
/// record for every detection.
pub struct ConflictHandler {
    engine: Arc<dyn BidirectionalEngine>,
    repository: Arc<dyn ConflictRepository>,
}

impl ConflictHandler {
    pub fn new(engine: Arc<dyn BidirectionalEngine>, repository: Arc<dyn ConflictRepository>) -> Self {
        Self { engine, repository }
    }

    /// Compare `local` (stored) with `incoming` (remote) for `entity_id`.
    pub async fn reconcile(
        &self,
        execution: &SyncExecution,
        entity_id: &ShardId,
        local: &Record,
        incoming: &Record,
        strategy: ConflictStrategy,
    ) -> Result<ConflictOutcome> {
        let Some(detected) = self.engine.detect_conflicts(local, incoming).await? else {
            return Ok(ConflictOutcome::NoConflict);
        };

        let resolved = if strategy.is_automatic() {
            Some(self.engine.resolve_conflict(&detected, strategy).await?)
        } else {
            None
        };

        let now = Utc::now();
        let conflict = SyncConflict {
            id: ConflictId::new(),
            execution_id: execution.id,
            sync_task_id: execution.sync_task_id,
            tenant_id: execution.tenant_id,
            entity_id: entity_id.clone(),
            conflict_type: detected.conflict_type,
            fields: detected.fields,
            local_data: detected.local,
            remote_data: detected.remote,
            status: if resolved.is_some() {
                ConflictStatus::Resolved
            } else {
                ConflictStatus::Pending
            },
            strategy,
            resolution: resolved.as_ref().map(|r| r.resolved.clone()),
            resolved_by: None,
            created_at: now,
            resolved_at: resolved.as_ref().map(|_| now),
        };
        self.repository.create(&conflict).await?;

        debug!(
            conflict_id = %conflict.id,
            entity = %entity_id,
            fields = ?conflict.fields,
            ?strategy,
            "Recorded sync conflict"
        );

        Ok(match resolved {
            Some(resolved) => ConflictOutcome::Resolved {
                conflict_id: conflict.id,
                value: resolved.resolved,
            },
            None => ConflictOutcome::Pending {
                conflict_id: conflict.id,
            },
        })
    }
}
