//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::Instant;

use intsync_common::{
    ConversionSchema, IntegrationId, Record, Result, SchemaId, ShardId, SyncExecution, SyncTask,
    TaskId, TenantId,
};
use intsync_connectors::{
    ExternalIdDedupService, FetchResult, FieldLevelConflictEngine, IntegrationAdapter,
    MappingSchemaService, MemoryShardStore, SchemaService, ShardResult, ShardService, ShardWrite,
    StaticAdapter, StaticAdapterRegistry, TransformIssue, TransformOutcome,
};
use intsync_storage::{
    MemoryConflictRepository, MemoryExecutionRepository, MemoryTaskRepository, TaskRepository,
};
use intsync_sync::{EngineConfig, MemoryMonitor, SyncEngine, SyncServices};

/// Engine wired to in-memory collaborators that tests can inspect.
pub struct Harness {
    pub engine: SyncEngine,
    pub tenant: TenantId,
    pub tasks: MemoryTaskRepository,
    pub executions: MemoryExecutionRepository,
    pub conflicts: MemoryConflictRepository,
    pub schemas: Arc<MappingSchemaService>,
    pub adapters: Arc<StaticAdapterRegistry>,
    pub store: MemoryShardStore,
    pub monitor: Arc<MemoryMonitor>,
}

impl Harness {
    pub fn new(config: EngineConfig) -> Self {
        Self::build(config, |services, _, _| services)
    }

    /// Build with a hook to swap collaborators before the engine is created.
    ///
    /// The hook also receives the task repository and schema service so
    /// replacements can wrap them.
    pub fn build(
        config: EngineConfig,
        customize: impl FnOnce(
            SyncServices,
            &MemoryTaskRepository,
            &Arc<MappingSchemaService>,
        ) -> SyncServices,
    ) -> Self {
        let tasks = MemoryTaskRepository::new();
        let executions = MemoryExecutionRepository::new();
        let conflicts = MemoryConflictRepository::new();
        let schemas = Arc::new(MappingSchemaService::new());
        let adapters = Arc::new(StaticAdapterRegistry::new());
        let store = MemoryShardStore::new();
        let monitor = Arc::new(MemoryMonitor::new());

        let services = SyncServices {
            tasks: Arc::new(tasks.clone()),
            executions: Arc::new(executions.clone()),
            conflicts: Arc::new(conflicts.clone()),
            adapters: adapters.clone(),
            schemas: schemas.clone(),
            dedup: Arc::new(ExternalIdDedupService::new(store.clone())),
            shards: Arc::new(store.clone()),
            bidirectional: Arc::new(FieldLevelConflictEngine::new()),
            monitor: monitor.clone(),
        };
        let engine = SyncEngine::new(customize(services, &tasks, &schemas), config).unwrap();

        Self {
            engine,
            tenant: TenantId::new(),
            tasks,
            executions,
            conflicts,
            schemas,
            adapters,
            store,
            monitor,
        }
    }

    /// A schema for this tenant converting into `contact` entities.
    pub fn schema(&self) -> ConversionSchema {
        ConversionSchema::new(self.tenant, "contacts", "contact")
    }

    /// Register `schema` and a static adapter serving `records`, and store a task.
    pub fn add_task(&self, schema: ConversionSchema, records: Vec<Record>) -> (SyncTask, Arc<StaticAdapter>) {
        let adapter = Arc::new(StaticAdapter::new(records));
        let task = self.add_task_with_adapter(schema, adapter.clone());
        (task, adapter)
    }

    pub fn add_task_with_adapter(
        &self,
        schema: ConversionSchema,
        adapter: Arc<dyn IntegrationAdapter>,
    ) -> SyncTask {
        let integration = IntegrationId::new();
        self.adapters
            .register(self.tenant, integration, adapter)
            .unwrap();
        let task = SyncTask::new(self.tenant, integration, schema.id, Value::Null);
        self.schemas.insert(schema);
        self.tasks.insert(task.clone());
        task
    }

    /// Store a task whose schema was never registered.
    pub fn add_task_without_schema(&self, records: Vec<Record>) -> (SyncTask, Arc<StaticAdapter>) {
        let integration = IntegrationId::new();
        let adapter = Arc::new(StaticAdapter::new(records));
        self.adapters
            .register(self.tenant, integration, adapter.clone())
            .unwrap();
        let task = SyncTask::new(self.tenant, integration, SchemaId::new(), Value::Null);
        self.tasks.insert(task.clone());
        (task, adapter)
    }

    /// Wait for all pipelines and reload `execution`.
    pub async fn finished(&self, execution: &SyncExecution) -> SyncExecution {
        self.engine.drain().await;
        self.engine
            .get_execution(execution.id, self.tenant)
            .await
            .unwrap()
    }
}

/// Adapter whose fetch blocks until the gate is opened.
pub struct GatedAdapter {
    pub gate: Arc<Notify>,
    records: Vec<Record>,
}

impl GatedAdapter {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            gate: Arc::new(Notify::new()),
            records,
        }
    }
}

#[async_trait]
impl IntegrationAdapter for GatedAdapter {
    fn name(&self) -> &str {
        "gated"
    }

    async fn fetch(&self, _config: &Value) -> Result<FetchResult> {
        self.gate.notified().await;
        Ok(FetchResult {
            data: self.records.clone(),
        })
    }
}

/// Schema service failing the first `failures` transforms recoverably,
/// recording the instant of every call.
pub struct FlakySchemaService {
    inner: Arc<MappingSchemaService>,
    failures: usize,
    calls: AtomicUsize,
    pub call_times: Mutex<Vec<Instant>>,
}

impl FlakySchemaService {
    pub fn new(inner: Arc<MappingSchemaService>, failures: usize) -> Self {
        Self {
            inner,
            failures,
            calls: AtomicUsize::new(0),
            call_times: Mutex::new(Vec::new()),
        }
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().unwrap().clone()
    }
}

#[async_trait]
impl SchemaService for FlakySchemaService {
    async fn get_schema(&self, id: SchemaId) -> Result<Option<ConversionSchema>> {
        self.inner.get_schema(id).await
    }

    async fn transform(&self, schema: &ConversionSchema, record: &Record) -> Result<TransformOutcome> {
        self.call_times.lock().unwrap().push(Instant::now());
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Ok(TransformOutcome::failed(vec![TransformIssue::recoverable(
                "upstream lookup timed out",
            )]));
        }
        self.inner.transform(schema, record).await
    }
}

/// Task repository recording every `find_due_tasks` limit.
pub struct SpyTaskRepository {
    inner: MemoryTaskRepository,
    pub limits: Mutex<Vec<usize>>,
}

impl SpyTaskRepository {
    pub fn new(inner: MemoryTaskRepository) -> Self {
        Self {
            inner,
            limits: Mutex::new(Vec::new()),
        }
    }

    pub fn limits(&self) -> Vec<usize> {
        self.limits.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskRepository for SpyTaskRepository {
    async fn find_by_id(&self, id: TaskId) -> Result<Option<SyncTask>> {
        self.inner.find_by_id(id).await
    }

    async fn update(&self, task: &SyncTask) -> Result<()> {
        self.inner.update(task).await
    }

    async fn find_due_tasks(&self, limit: usize) -> Result<Vec<SyncTask>> {
        self.limits.lock().unwrap().push(limit);
        self.inner.find_due_tasks(limit).await
    }
}

/// Shard service whose writes panic.
pub struct PanickingShardService;

#[async_trait]
impl ShardService for PanickingShardService {
    async fn create_shards_from_integration_data(&self, write: ShardWrite) -> Result<ShardResult> {
        panic!("shard backend crashed writing {}", write.target_type);
    }

    async fn get_shard_data(&self, _id: &ShardId) -> Result<Option<Record>> {
        Ok(None)
    }
}

/// Shard service that yields to the scheduler before every write.
pub struct YieldingShardService {
    inner: Arc<dyn ShardService>,
}

impl YieldingShardService {
    pub fn new(inner: Arc<dyn ShardService>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ShardService for YieldingShardService {
    async fn create_shards_from_integration_data(&self, write: ShardWrite) -> Result<ShardResult> {
        tokio::task::yield_now().await;
        self.inner.create_shards_from_integration_data(write).await
    }

    async fn get_shard_data(&self, id: &ShardId) -> Result<Option<Record>> {
        self.inner.get_shard_data(id).await
    }
}

/// `count` contact records with distinct external ids.
pub fn contacts(count: usize) -> Vec<Record> {
    (0..count)
        .map(|i| serde_json::json!({ "external_id": format!("c-{}", i), "name": format!("Contact {}", i) }))
        .collect()
}
