//! JSON fixtures describing tasks, schemas and the records their adapters serve.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use intsync_common::{
    BidirectionalConfig, ConversionSchema, DedupConfig, FieldMapping, IntegrationId, Record,
    SyncTask, TargetConfig, TaskSchedule, TaskStatus, TenantId,
};
use intsync_connectors::{
    ExternalIdDedupService, FieldLevelConflictEngine, IntegrationAdapter, MappingSchemaService,
    MemoryShardStore, StaticAdapter, StaticAdapterRegistry,
};
use intsync_storage::{
    MemoryConflictRepository, MemoryExecutionRepository, MemoryTaskRepository,
};
use intsync_sync::{
    EngineConfig, MemoryMonitor, Metric, SyncEngine, SyncEvent, SyncMonitor, SyncServices,
    TracingMonitor,
};

/// A stored entity present before any task runs.
#[derive(Debug, Clone, Deserialize)]
pub struct EntityFixture {
    #[serde(rename = "type")]
    pub shard_type: String,
    pub data: Value,
}

/// One task together with its schema and adapter records.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskFixture {
    pub name: String,
    pub target_type: String,
    #[serde(default)]
    pub field_mappings: Vec<FieldMapping>,
    #[serde(default)]
    pub deduplication: DedupConfig,
    #[serde(default)]
    pub bidirectional_sync: BidirectionalConfig,
    #[serde(default)]
    pub target: TargetConfig,
    /// Run cadence; unscheduled tasks are never due.
    #[serde(default)]
    pub schedule_secs: Option<u64>,
    #[serde(default)]
    pub disabled: bool,
    /// Make every fetch fail with this message.
    #[serde(default)]
    pub fail_fetch: Option<String>,
    #[serde(default)]
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Fixture {
    #[serde(default)]
    pub config: Option<EngineConfig>,
    #[serde(default)]
    pub entities: Vec<EntityFixture>,
    pub tasks: Vec<TaskFixture>,
}

/// Forwards to the tracing sink and keeps a copy for the run summary.
#[derive(Default)]
pub struct CliMonitor {
    pub memory: MemoryMonitor,
    tracing: TracingMonitor,
}

impl SyncMonitor for CliMonitor {
    fn record_metric(&self, metric: &Metric) {
        self.tracing.record_metric(metric);
        self.memory.record_metric(metric);
    }

    fn record_event(&self, event: &SyncEvent) {
        self.tracing.record_event(event);
        self.memory.record_event(event);
    }
}

/// An engine wired to the fixture's in-memory collaborators.
pub struct Loaded {
    pub engine: SyncEngine,
    pub tenant: TenantId,
    pub tasks: Vec<(String, SyncTask)>,
    pub store: MemoryShardStore,
    pub monitor: Arc<CliMonitor>,
}

impl Loaded {
    pub fn task(&self, name: &str) -> Option<&SyncTask> {
        self.tasks
            .iter()
            .find(|(task_name, _)| task_name == name)
            .map(|(_, task)| task)
    }
}

impl Fixture {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Invalid fixture JSON")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture {}", path.display()))?;
        Self::from_json(&content)
    }

    /// Effective engine config: `config_override`, else the fixture's, else defaults.
    pub fn engine_config(&self, config_override: Option<EngineConfig>) -> EngineConfig {
        config_override
            .or_else(|| self.config.clone())
            .unwrap_or_default()
    }

    /// Register every task under a fresh tenant and build the engine.
    pub fn install(self, config_override: Option<EngineConfig>) -> Result<Loaded> {
        let config = self.engine_config(config_override);
        let tenant = TenantId::new();

        let task_repository = MemoryTaskRepository::new();
        let schemas = Arc::new(MappingSchemaService::new());
        let adapters = Arc::new(StaticAdapterRegistry::new());
        let store = MemoryShardStore::new();
        let monitor = Arc::new(CliMonitor::default());

        for entity in self.entities {
            store
                .insert(&entity.shard_type, entity.data)
                .context("Invalid entity fixture")?;
        }

        let mut tasks = Vec::with_capacity(self.tasks.len());
        for fixture in self.tasks {
            let schema = ConversionSchema {
                field_mappings: fixture.field_mappings,
                deduplication: fixture.deduplication,
                bidirectional_sync: fixture.bidirectional_sync,
                target: fixture.target,
                ..ConversionSchema::new(tenant, fixture.name.clone(), fixture.target_type)
            };

            let adapter: Arc<dyn IntegrationAdapter> = match fixture.fail_fetch {
                Some(message) => Arc::new(StaticAdapter::failing(message)),
                None => Arc::new(StaticAdapter::new(fixture.records)),
            };
            let integration = IntegrationId::new();
            adapters
                .register(tenant, integration, adapter)
                .with_context(|| format!("Failed to register adapter for {}", fixture.name))?;

            let mut task = SyncTask::new(tenant, integration, schema.id, Value::Null);
            if let Some(secs) = fixture.schedule_secs {
                task = task.with_schedule(TaskSchedule::every(secs));
            }
            if fixture.disabled {
                task = task.with_status(TaskStatus::Disabled);
            }

            schemas.insert(schema);
            task_repository.insert(task.clone());
            tasks.push((fixture.name, task));
        }

        let services = SyncServices {
            tasks: Arc::new(task_repository),
            executions: Arc::new(MemoryExecutionRepository::new()),
            conflicts: Arc::new(MemoryConflictRepository::new()),
            adapters,
            schemas,
            dedup: Arc::new(ExternalIdDedupService::new(store.clone())),
            shards: Arc::new(store.clone()),
            bidirectional: Arc::new(FieldLevelConflictEngine::new()),
            monitor: monitor.clone(),
        };
        let engine = SyncEngine::new(services, config).context("Invalid engine configuration")?;

        Ok(Loaded {
            engine,
            tenant,
            tasks,
            store,
            monitor,
        })
    }
}
