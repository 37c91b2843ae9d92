//! Persistence abstraction for the integration sync engine.
//!
//! This module provides trait-based interfaces for the three entity kinds the
//! engine persists (tasks, executions, conflicts) and in-memory
//! implementations for tests and local runs.
//!
//! # Design Principles
//! - Storage isolation: no backend-specific logic in the orchestrator
//! - Async operations: all repository calls are async
//! - Single-document atomicity: each call updates one entity atomically

pub mod memory;
pub mod repository;

pub use memory::{MemoryConflictRepository, MemoryExecutionRepository, MemoryTaskRepository};
pub use repository::{ConflictRepository, ExecutionRepository, TaskRepository};
