//! Task executor dispatch.
//!
//! The engine treats what a task actually does against a backend (LXD/Incus
//! over SSH, the Proxmox REST API, the Docker daemon) as opaque: each task
//! type has a registered [`TaskExecutor`], and the worker pool dispatches to
//! it with an [`ExecutionContext`] carrying the cancellation token and a
//! progress reporter. Executors must watch the token — cancellation is
//! cooperative at this boundary — and may retry their own provider calls,
//! but the scheduler never retries an executor error.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::storage::{Task, TaskStore, TaskType};

/// Execution-scoped handle passed to an executor.
pub struct ExecutionContext {
    token: CancellationToken,
    store: Arc<dyn TaskStore>,
    task_id: i64,
}

impl ExecutionContext {
    pub fn new(token: CancellationToken, store: Arc<dyn TaskStore>, task_id: i64) -> Self {
        Self {
            token,
            store,
            task_id,
        }
    }

    /// The cancellation token bound to this execution. Executors should
    /// check it between provider calls or select against it.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Report incremental progress (0-100) and an optional human-readable
    /// status message. Best-effort: a storage failure is logged, never
    /// surfaced to the executor.
    pub async fn report_progress(&self, progress: i32, message: Option<&str>) {
        let clamped = progress.clamp(0, 100);
        if let Err(e) = self
            .store
            .update_progress(self.task_id, clamped, message.map(ToString::to_string))
            .await
        {
            warn!(task_id = self.task_id, error = ?e, "Failed to record task progress");
        }
    }
}

/// Provider-facing execution logic for one task type.
///
/// Implementations perform the actual remote work and must respect the
/// context's cancellation token and the deadline the pool enforces around
/// the call. The returned value, if any, is recorded as the task's result
/// data.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext, task: &Task) -> Result<Option<Value>>;
}

/// Registry dispatching task types to their executors.
///
/// Built once at the composition root and shared across pools via `Arc`.
pub struct ExecutorRegistry {
    executors: HashMap<TaskType, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor for a task type. Builder-style for chained
    /// registration at startup.
    pub fn register(mut self, task_type: TaskType, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executors.insert(task_type, executor);
        self
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(&task_type).cloned()
    }

    pub fn supports(&self, task_type: TaskType) -> bool {
        self.executors.contains_key(&task_type)
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryTaskStore, NewTask};

    struct EchoExecutor;

    #[async_trait]
    impl TaskExecutor for EchoExecutor {
        async fn execute(&self, ctx: &ExecutionContext, task: &Task) -> Result<Option<Value>> {
            ctx.report_progress(50, Some("halfway")).await;
            Ok(Some(serde_json::json!({ "echo": task.task_data })))
        }
    }

    #[tokio::test]
    async fn test_registry_dispatch() {
        let registry = ExecutorRegistry::new().register(TaskType::Start, Arc::new(EchoExecutor));

        assert!(registry.supports(TaskType::Start));
        assert!(!registry.supports(TaskType::Delete));
        assert!(registry.get(TaskType::Start).is_some());
        assert!(registry.get(TaskType::Delete).is_none());
    }

    #[tokio::test]
    async fn test_progress_reporting_updates_store() {
        let store = Arc::new(MemoryTaskStore::new());
        let task = store
            .create_task(NewTask::new(1, TaskType::Start, "data"))
            .await
            .unwrap();

        let ctx = ExecutionContext::new(CancellationToken::new(), store.clone(), task.id);
        let executor = EchoExecutor;
        let result = executor.execute(&ctx, &task).await.unwrap();

        assert_eq!(
            result,
            Some(serde_json::json!({ "echo": "data" }))
        );
        let loaded = store.first_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.progress, 50);
        assert_eq!(loaded.status_message.as_deref(), Some("halfway"));
    }

    #[tokio::test]
    async fn test_progress_clamped_to_range() {
        let store = Arc::new(MemoryTaskStore::new());
        let task = store
            .create_task(NewTask::new(1, TaskType::Stop, "{}"))
            .await
            .unwrap();

        let ctx = ExecutionContext::new(CancellationToken::new(), store.clone(), task.id);
        ctx.report_progress(250, None).await;

        let loaded = store.first_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.progress, 100);
    }
}
