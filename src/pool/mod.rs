//! Per-provider worker pools and their registry.
//!
//! Each provider gets its own fixed-size worker group draining a bounded
//! FIFO queue — deliberately not a global pool, so one slow or misbehaving
//! backend can saturate only its own workers. The manager creates pools
//! lazily, replaces them when a provider's configured concurrency changes,
//! and retires them when idle, aged out, or orphaned by provider deletion.

mod manager;
mod worker_pool;

pub use manager::ProviderPoolManager;
pub use worker_pool::{PoolContext, ProviderWorkerPool, TaskOutcome, TaskRequest};
