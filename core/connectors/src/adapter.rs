//! Integration adapter trait definition.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use intsync_common::{Error, Record, Result};

/// Records returned by one adapter fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchResult {
    pub data: Vec<Record>,
}

/// Connector that fetches raw records from an external system.
///
/// Implementations handle their own authentication, paging and rate
/// limiting. The engine treats a call as a single, possibly slow and
/// possibly failing I/O operation.
#[async_trait]
pub trait IntegrationAdapter: Send + Sync {
    /// Adapter name (e.g. "salesforce", "hubspot", "static").
    fn name(&self) -> &str;

    /// Fetch all records selected by `config`.
    ///
    /// # Errors
    /// - `Adapter` on connection or protocol failures
    async fn fetch(&self, config: &Value) -> Result<FetchResult>;
}

/// Adapter serving a fixed record set from memory.
///
/// When the task config carries an `"entity"` key and records were registered
/// for that entity, those are returned; otherwise the default record set.
pub struct StaticAdapter {
    records: Vec<Record>,
    entities: HashMap<String, Vec<Record>>,
    failure: Option<String>,
    fetches: AtomicUsize,
}

impl StaticAdapter {
    /// Create an adapter returning `records` on every fetch.
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            entities: HashMap::new(),
            failure: None,
            fetches: AtomicUsize::new(0),
        }
    }

    /// Create an adapter whose every fetch fails with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::new(Vec::new())
        }
    }

    /// Register records served for a specific entity name.
    pub fn with_entity(mut self, entity: impl Into<String>, records: Vec<Record>) -> Self {
        self.entities.insert(entity.into(), records);
        self
    }

    /// Number of fetch calls made so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IntegrationAdapter for StaticAdapter {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch(&self, config: &Value) -> Result<FetchResult> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        if let Some(message) = &self.failure {
            return Err(Error::Adapter(message.clone()));
        }

        let data = config
            .get("entity")
            .and_then(Value::as_str)
            .and_then(|entity| self.entities.get(entity))
            .unwrap_or(&self.records)
            .clone();

        Ok(FetchResult { data })
    }
}
