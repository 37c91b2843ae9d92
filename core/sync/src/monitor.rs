//! Monitoring sink for sync metrics and lifecycle events.

use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

use intsync_common::{
    ConflictId, ExecutionError, ExecutionId, ExecutionStatus, ShardId, TaskId, TenantId,
    TriggerSource,
};

/// Records fetched per execution (counter).
pub const RECORDS_FETCHED: &str = "sync.records.fetched";
/// Completed executions, tagged by status (counter).
pub const EXECUTION_COMPLETED: &str = "sync.execution.completed";
/// Execution wall time in milliseconds (histogram).
pub const EXECUTION_DURATION_MS: &str = "sync.execution.duration_ms";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Histogram,
}

/// A single metric sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: &'static str,
    pub kind: MetricKind,
    pub value: f64,
    pub tags: Vec<(&'static str, String)>,
}

impl Metric {
    pub fn counter(name: &'static str, value: f64) -> Self {
        Self {
            name,
            kind: MetricKind::Counter,
            value,
            tags: Vec::new(),
        }
    }

    pub fn histogram(name: &'static str, value: f64) -> Self {
        Self {
            name,
            kind: MetricKind::Histogram,
            value,
            tags: Vec::new(),
        }
    }

    /// Attach a tag.
    pub fn tag(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.tags.push((key, value.into()));
        self
    }

    /// Value of the tag named `key`.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Lifecycle events emitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    ExecutionStarted {
        execution_id: ExecutionId,
        task_id: TaskId,
        tenant_id: TenantId,
        triggered_by: TriggerSource,
    },
    ExecutionCompleted {
        execution_id: ExecutionId,
        task_id: TaskId,
        tenant_id: TenantId,
        status: ExecutionStatus,
        records_processed: usize,
        duration_ms: u64,
        error: Option<ExecutionError>,
    },
    ConflictDetected {
        conflict_id: ConflictId,
        execution_id: ExecutionId,
        entity_id: ShardId,
        auto_resolved: bool,
    },
}

/// Sink for metrics and events.
///
/// Calls happen inline on the execution path and must not block.
pub trait SyncMonitor: Send + Sync {
    fn record_metric(&self, metric: &Metric);

    fn record_event(&self, event: &SyncEvent);
}

/// Forwards everything to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMonitor;

impl SyncMonitor for TracingMonitor {
    fn record_metric(&self, metric: &Metric) {
        debug!(
            metric = metric.name,
            kind = ?metric.kind,
            value = metric.value,
            tags = ?metric.tags,
            "metric"
        );
    }

    fn record_event(&self, event: &SyncEvent) {
        match event {
            SyncEvent::ExecutionStarted {
                execution_id,
                task_id,
                triggered_by,
                ..
            } => info!(
                %execution_id,
                %task_id,
                trigger = triggered_by.as_str(),
                "Sync execution started"
            ),
            SyncEvent::ExecutionCompleted {
                execution_id,
                status,
                records_processed,
                duration_ms,
                error: None,
                ..
            } => info!(
                %execution_id,
                %status,
                records_processed,
                duration_ms,
                "Sync execution completed"
            ),
            SyncEvent::ExecutionCompleted {
                execution_id,
                status,
                duration_ms,
                error: Some(error),
                ..
            } => warn!(
                %execution_id,
                %status,
                duration_ms,
                error = %error.message,
                "Sync execution failed"
            ),
            SyncEvent::ConflictDetected {
                conflict_id,
                entity_id,
                auto_resolved,
                ..
            } => info!(
                %conflict_id,
                entity = %entity_id,
                auto_resolved,
                "Sync conflict detected"
            ),
        }
    }
}

/// Keeps everything in memory for inspection.
#[derive(Debug, Default)]
pub struct MemoryMonitor {
    metrics: Mutex<Vec<Metric>>,
    events: Mutex<Vec<SyncEvent>>,
}

impl MemoryMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metrics(&self) -> Vec<Metric> {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Samples recorded under `name`.
    pub fn metrics_named(&self, name: &str) -> Vec<Metric> {
        self.metrics()
            .into_iter()
            .filter(|metric| metric.name == name)
            .collect()
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SyncMonitor for MemoryMonitor {
    fn record_metric(&self, metric: &Metric) {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(metric.clone());
    }

    fn record_event(&self, event: &SyncEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
