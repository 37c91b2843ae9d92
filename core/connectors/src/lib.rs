//! Collaborator interfaces the sync engine orchestrates.
//!
//! The engine never fetches, transforms, matches, merges or stores records
//! itself. It drives the narrow interfaces defined here:
//!
//! - [`IntegrationAdapter`] / [`AdapterRegistry`]: fetch raw records from an
//!   external system
//! - [`SchemaService`]: load conversion schemas and transform records
//! - [`DedupService`]: find and merge existing entities matching a record
//! - [`ShardService`]: create or update stored entities
//! - [`BidirectionalEngine`]: detect and resolve local/remote conflicts
//!
//! Each module also ships a small reference implementation. They back the
//! tests and the CLI and are not meant to replace the production services.

pub mod adapter;
pub mod bidirectional;
pub mod dedup;
pub mod registry;
pub mod schema;
pub mod shard;

pub use adapter::{FetchResult, IntegrationAdapter, StaticAdapter};
pub use bidirectional::{
    BidirectionalEngine, DetectedConflict, FieldLevelConflictEngine, ResolvedConflict,
};
pub use dedup::{DedupService, ExternalIdDedupService};
pub use registry::{AdapterRegistry, StaticAdapterRegistry};
pub use schema::{MappingSchemaService, SchemaService, TransformIssue, TransformOutcome};
pub use shard::{MemoryShardStore, ShardResult, ShardService, ShardWrite};
