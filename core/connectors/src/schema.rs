//! Conversion schema service: schema lookup and record transformation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use intsync_common::{ConversionSchema, Record, Result, SchemaId};

/// One problem reported by a transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformIssue {
    pub message: String,
    /// Whether the same record may transform successfully on retry.
    pub recoverable: bool,
}

impl TransformIssue {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: false,
        }
    }
}

/// Result of transforming one raw record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformOutcome {
    pub success: bool,
    pub data: Option<Record>,
    #[serde(default)]
    pub errors: Vec<TransformIssue>,
}

impl TransformOutcome {
    pub fn ok(data: Record) -> Self {
        Self {
            success: true,
            data: Some(data),
            errors: Vec::new(),
        }
    }

    pub fn failed(errors: Vec<TransformIssue>) -> Self {
        Self {
            success: false,
            data: None,
            errors,
        }
    }
}

/// Loads conversion schemas and applies them to raw records.
#[async_trait]
pub trait SchemaService: Send + Sync {
    /// Load a schema by id.
    async fn get_schema(&self, id: SchemaId) -> Result<Option<ConversionSchema>>;

    /// Transform a raw record.
    ///
    /// Validation problems are reported in the outcome; `Err` is reserved
    /// for failures of the service itself.
    async fn transform(&self, schema: &ConversionSchema, record: &Record)
        -> Result<TransformOutcome>;
}

/// Schema service applying `field_mappings` as plain renames.
///
/// Sources may be dotted paths into nested objects (`"address.city"`).
/// A schema without mappings passes objects through unchanged.
pub struct MappingSchemaService {
    schemas: RwLock<HashMap<SchemaId, ConversionSchema>>,
}

impl MappingSchemaService {
    /// Create a service with no schemas.
    pub fn new() -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
        }
    }

    /// Register or replace a schema.
    pub fn insert(&self, schema: ConversionSchema) {
        self.schemas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(schema.id, schema);
    }

    fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
        path.split('.')
            .try_fold(record, |value, key| value.get(key))
            .filter(|value| !value.is_null())
    }

    fn apply(schema: &ConversionSchema, record: &Record) -> TransformOutcome {
        let Some(object) = record.as_object() else {
            return TransformOutcome::failed(vec![TransformIssue::fatal(
                "record is not a JSON object",
            )]);
        };

        if schema.field_mappings.is_empty() {
            return TransformOutcome::ok(Value::Object(object.clone()));
        }

        let mut output = Map::new();
        let mut errors = Vec::new();

        for mapping in &schema.field_mappings {
            match Self::lookup(record, &mapping.source) {
                Some(value) => {
                    output.insert(mapping.target.clone(), value.clone());
                }
                None if mapping.required => {
                    errors.push(TransformIssue::fatal(format!(
                        "missing required field '{}'",
                        mapping.source
                    )));
                }
                None => {}
            }
        }

        if errors.is_empty() {
            TransformOutcome::ok(Value::Object(output))
        } else {
            TransformOutcome::failed(errors)
        }
    }
}

impl Default for MappingSchemaService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchemaService for MappingSchemaService {
    async fn get_schema(&self, id: SchemaId) -> Result<Option<ConversionSchema>> {
        Ok(self
            .schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned())
    }

    async fn transform(
        &self,
        schema: &ConversionSchema,
        record: &Record,
    ) -> Result<TransformOutcome> {
        Ok(Self::apply(schema, record))
    }
}
