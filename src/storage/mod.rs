//! Storage layer abstractions and implementations.
//!
//! Each storage concern is defined as an `async_trait` with a PostgreSQL
//! implementation for production and an in-memory implementation used by a
//! single-node development setup and the test suite.

use crate::errors::StorageError;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

pub mod instance;
pub mod provider;
pub mod task;

pub use instance::{InstanceStore, MemoryInstanceStore, PostgresInstanceStore};
pub use provider::{MemoryProviderStore, PostgresProviderStore, ProviderSettings, ProviderStore};
pub use task::{
    MemoryTaskStore, NewTask, PostgresTaskStore, Task, TaskChanges, TaskFilter, TaskStatus,
    TaskStore, TaskType,
};
