//! # provisor
//!
//! provisor is the task orchestration engine of a multi-provider
//! virtualization control plane. It provisions, operates, and tears down
//! compute instances (LXD/Incus containers, Proxmox VMs, Docker containers)
//! across independently-reachable backend hosts, each only reachable through
//! slow, fallible channels. Every lifecycle operation runs asynchronously,
//! is individually cancellable, is bounded by a timeout, and is throttled
//! per provider so one overloaded backend cannot starve the others.
//!
//! ## Architecture Overview
//!
//! ### Worker Pools
//! - One fixed-size worker group per provider, draining a bounded FIFO queue
//! - Concurrency is per-provider runtime configuration; a change replaces
//!   the pool rather than resizing it
//! - Pool lifetimes are cancellable independently of task deadlines
//!
//! ### Task State Machine
//! - `pending -> running -> {completed, failed}`, `pending -> cancelled`,
//!   `running -> cancelling -> cancelled`, `running -> timeout`
//! - Every transition is a conditional status-guarded update against the
//!   task row; the `pending -> running` claim is what guarantees
//!   at-most-once execution under concurrent dispatchers
//!
//! ### Cancellation
//! - Cooperative by default: executors receive a cancellation token and the
//!   worker finishes the `cancelling -> cancelled` transition as it unwinds
//! - Administrative force stop marks the task terminal immediately and
//!   cancels the context asynchronously
//!
//! ### Bounded Registries
//! - Live execution contexts and provider pools are tracked in bounded
//!   in-memory registries with tiered eviction and idle/age cleanup
//!
//! ## Configuration
//!
//! The service is configured via environment variables. Key variables:
//! - `DATABASE_URL`: PostgreSQL connection string
//! - `CONTEXT_REGISTRY_CAPACITY`: bound on live execution contexts
//! - `POOL_IDLE_TIMEOUT_SECONDS` / `POOL_MAX_LIFETIME_SECONDS`: pool eviction
//! - `ENQUEUE_TIMEOUT_SECONDS`: backpressure bound for task dispatch
//! - `METRICS_ADAPTER`: `noop` or `statsd`
//!
//! ## Error Handling
//!
//! All error strings use the format: `error-provisor-<domain>-<number> <message>`

/// Background task spawning helpers with consistent lifecycle logging.
pub mod background;

/// Configuration management loaded from environment variables.
pub mod config;

pub(crate) mod constants;

/// Bounded registry of cancellation handles for in-flight tasks.
pub mod context_registry;

/// Task control protocol: terminal transitions, cancellation, force stop.
pub mod control;

pub mod errors;

/// Task executor dispatch: the per-type execution contract and registry.
pub mod executor;

/// Metrics collection for service observability.
pub mod metrics;

/// Per-provider worker pools and their registry.
pub mod pool;

/// Bounded in-memory FIFO work queue shared by a pool's workers.
pub mod queue;

/// The task service façade: creation, dispatch, cancellation entry points,
/// and the query surface.
pub mod service;

/// Storage layer abstractions and implementations.
pub mod storage;

/// Periodic maintenance: registry sweeps and stuck-task reclassification.
pub mod sweeper;
