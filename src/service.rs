//! Task service façade.
//!
//! The programmatic surface the HTTP layer calls into: task creation with
//! per-type timeout defaulting, dispatch into the owning provider's worker
//! pool, the cancellation/force-stop entry points (delegated to the control
//! protocol), and the query surface with queue position and ETA reporting.
//!
//! `start_task` never waits for execution: it enqueues a request and
//! returns. The enqueue itself is bounded — a saturated provider queue
//! surfaces as a backpressure error the caller may retry later — and a
//! detached drain logs the eventual outcome under a watchdog.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::background::spawn_detached;
use crate::constants::RESULT_DRAIN_WATCHDOG_SECS;
use crate::context_registry::TaskContextManager;
use crate::control::TaskControl;
use crate::errors::TaskError;
use crate::metrics::SharedMetricsPublisher;
use crate::pool::{ProviderPoolManager, TaskOutcome, TaskRequest};
use crate::storage::{
    NewTask, ProviderStore, Task, TaskFilter, TaskStatus, TaskStore, TaskType,
};

/// Pool key for tasks not bound to any provider.
const UNASSIGNED_PROVIDER: i64 = 0;

/// Parameters for creating a task.
#[derive(Debug, Clone)]
pub struct CreateTaskRequest {
    pub user_id: i64,
    pub provider_id: Option<i64>,
    pub instance_id: Option<i64>,
    pub task_type: String,
    pub task_data: String,
    /// Hard execution ceiling in seconds; `0` selects the per-type default.
    pub timeout_seconds: i64,
    pub is_force_stoppable: bool,
    pub preallocated_cpu: i32,
    pub preallocated_memory_mb: i64,
    pub preallocated_disk_gb: i64,
    pub preallocated_bandwidth_mbps: i64,
}

impl CreateTaskRequest {
    pub fn new(user_id: i64, task_type: impl Into<String>, task_data: impl Into<String>) -> Self {
        Self {
            user_id,
            provider_id: None,
            instance_id: None,
            task_type: task_type.into(),
            task_data: task_data.into(),
            timeout_seconds: 0,
            is_force_stoppable: true,
            preallocated_cpu: 0,
            preallocated_memory_mb: 0,
            preallocated_disk_gb: 0,
            preallocated_bandwidth_mbps: 0,
        }
    }
}

/// Single-task view with scheduling metadata for polling clients.
#[derive(Debug, Clone)]
pub struct TaskDetail {
    pub task: Task,
    /// Seconds left before the execution deadline, for running tasks.
    pub remaining_seconds: Option<i64>,
    /// Number of pending tasks ahead in the provider's queue, for pending
    /// tasks.
    pub queue_position: Option<usize>,
    /// Rough seconds until completion, from estimated durations and the
    /// provider's concurrency.
    pub eta_seconds: Option<i64>,
}

/// Engine-level statistics.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub live_pools: usize,
    pub live_contexts: i64,
    pub status_counts: HashMap<TaskStatus, i64>,
}

/// The orchestration engine's façade.
pub struct TaskService {
    store: Arc<dyn TaskStore>,
    providers: Arc<dyn ProviderStore>,
    pools: Arc<ProviderPoolManager>,
    control: Arc<TaskControl>,
    contexts: Arc<TaskContextManager>,
    metrics: SharedMetricsPublisher,
    enqueue_timeout: Duration,
}

impl TaskService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        providers: Arc<dyn ProviderStore>,
        pools: Arc<ProviderPoolManager>,
        control: Arc<TaskControl>,
        contexts: Arc<TaskContextManager>,
        metrics: SharedMetricsPublisher,
        enqueue_timeout: Duration,
    ) -> Self {
        Self {
            store,
            providers,
            pools,
            control,
            contexts,
            metrics,
            enqueue_timeout,
        }
    }

    /// Create a task in `pending`. Does not start execution.
    pub async fn create_task(&self, request: CreateTaskRequest) -> Result<Task, TaskError> {
        let task_type =
            TaskType::try_from(request.task_type.as_str()).map_err(|_| TaskError::UnknownTaskType {
                task_type: request.task_type.clone(),
            })?;

        let timeout_duration = if request.timeout_seconds > 0 {
            request.timeout_seconds
        } else {
            task_type.default_timeout_secs()
        };

        let new_task = NewTask {
            user_id: request.user_id,
            provider_id: request.provider_id,
            instance_id: request.instance_id,
            task_type,
            task_data: request.task_data,
            timeout_duration,
            estimated_duration: estimate_duration(task_type, request.preallocated_memory_mb),
            is_force_stoppable: request.is_force_stoppable,
            preallocated_cpu: request.preallocated_cpu,
            preallocated_memory_mb: request.preallocated_memory_mb,
            preallocated_disk_gb: request.preallocated_disk_gb,
            preallocated_bandwidth_mbps: request.preallocated_bandwidth_mbps,
        };

        let task = self.store.create_task(new_task).await?;
        info!(
            task_id = task.id,
            task_type = %task.task_type,
            provider_id = ?task.provider_id,
            "Task created"
        );
        self.metrics
            .incr_with_tags("task.created", &[("type", task.task_type.as_str())])
            .await;
        Ok(task)
    }

    /// Dispatch a pending task into its provider's pool.
    ///
    /// Returns once the request is enqueued; the caller observes completion
    /// through the query surface, never synchronously. Enqueueing blocks up
    /// to the configured timeout when the provider's queue is full.
    pub async fn start_task(&self, task_id: i64) -> Result<(), TaskError> {
        let task = self
            .store
            .first_by_id(task_id)
            .await?
            .ok_or(TaskError::NotFound { task_id })?;

        if task.status != TaskStatus::Pending {
            return Err(TaskError::StateAlreadyChanged {
                task_id,
                status: task.status.to_string(),
            });
        }

        let concurrency = self.resolve_concurrency(task.provider_id).await?;
        let pool_key = task.provider_id.unwrap_or(UNASSIGNED_PROVIDER);
        let pool = self.pools.get_or_create(pool_key, concurrency).await;

        let (respond_to, outcome_rx) = oneshot::channel();
        pool.submit(
            TaskRequest {
                task: task.clone(),
                respond_to,
            },
            self.enqueue_timeout,
        )
        .await?;

        debug!(task_id, provider_id = pool_key, concurrency, "Task enqueued");
        self.metrics.incr("task.dispatched").await;

        // Best-effort drain of the outcome, purely for logging. The
        // watchdog bounds how long a dropped or wedged worker can keep
        // this alive.
        spawn_detached("task-outcome-drain", async move {
            match tokio::time::timeout(
                Duration::from_secs(RESULT_DRAIN_WATCHDOG_SECS),
                outcome_rx,
            )
            .await
            {
                Ok(Ok(TaskOutcome::Completed)) => {
                    debug!(task_id, "Task finished successfully");
                }
                Ok(Ok(TaskOutcome::ClaimLost)) => {
                    debug!(task_id, "Task was claimed by another dispatch");
                }
                Ok(Ok(outcome)) => {
                    info!(task_id, ?outcome, "Task finished");
                }
                Ok(Err(_)) => {
                    debug!(task_id, "Worker dropped the outcome channel");
                }
                Err(_) => {
                    warn!(task_id, "No task outcome within the watchdog window");
                }
            }
            Ok(())
        });

        Ok(())
    }

    /// Dispatch every currently-pending task, oldest first, best effort.
    ///
    /// Driven by the wake signal after terminal transitions and by a poll
    /// tick. Backpressure and claim races are normal here: a saturated
    /// provider keeps its tasks pending for the next pass, and a task
    /// another dispatcher grabbed first is simply skipped.
    pub async fn dispatch_pending(&self) -> Result<usize, TaskError> {
        let pending = self
            .store
            .list_tasks(&TaskFilter {
                status: Some(TaskStatus::Pending),
                ..Default::default()
            })
            .await?;

        let mut dispatched = 0;
        for task in pending {
            match self.start_task(task.id).await {
                Ok(()) => dispatched += 1,
                Err(TaskError::Scheduling { source }) => {
                    debug!(task_id = task.id, error = %source, "Provider saturated, task stays pending");
                }
                Err(TaskError::StateAlreadyChanged { .. }) => {}
                Err(e) => {
                    warn!(task_id = task.id, error = %e, "Failed to dispatch pending task");
                }
            }
        }
        Ok(dispatched)
    }

    /// End-user cancellation. See [`TaskControl::cancel_task`].
    pub async fn cancel_task(&self, task_id: i64, user_id: i64) -> Result<(), TaskError> {
        self.control.cancel_task(task_id, user_id).await
    }

    /// Administrative cancellation. See [`TaskControl::cancel_task_by_admin`].
    pub async fn cancel_task_by_admin(&self, task_id: i64, reason: &str) -> Result<(), TaskError> {
        self.control.cancel_task_by_admin(task_id, reason).await
    }

    /// Administrative force stop. See [`TaskControl::force_stop_task`].
    pub async fn force_stop_task(&self, task_id: i64, reason: &str) -> Result<(), TaskError> {
        self.control.force_stop_task(task_id, reason).await
    }

    /// Idempotent terminal transition. See [`TaskControl::complete_task`].
    pub async fn complete_task(
        &self,
        task_id: i64,
        success: bool,
        error_message: Option<String>,
        result_data: Option<serde_json::Value>,
    ) -> Result<(), TaskError> {
        self.control
            .complete_task(task_id, success, error_message, result_data)
            .await
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Option<Task>, TaskError> {
        Ok(self.store.first_by_id(task_id).await?)
    }

    /// Single-task detail with computed remaining time and queue position.
    pub async fn get_task_detail(&self, task_id: i64) -> Result<TaskDetail, TaskError> {
        let task = self
            .store
            .first_by_id(task_id)
            .await?
            .ok_or(TaskError::NotFound { task_id })?;

        let remaining_seconds = match (task.status, task.started_at) {
            (TaskStatus::Running | TaskStatus::Cancelling, Some(started_at)) => {
                let elapsed = (chrono::Utc::now() - started_at).num_seconds();
                Some((task.timeout_duration - elapsed).max(0))
            }
            _ => None,
        };

        let (queue_position, eta_seconds) = if task.status == TaskStatus::Pending {
            let pending = self
                .store
                .list_tasks(&TaskFilter {
                    provider_id: task.provider_id,
                    status: Some(TaskStatus::Pending),
                    ..Default::default()
                })
                .await?;
            let ahead: Vec<&Task> = pending
                .iter()
                .filter(|t| {
                    (t.created_at, t.id) < (task.created_at, task.id)
                })
                .collect();
            let concurrency = self.resolve_concurrency(task.provider_id).await? as i64;
            let ahead_estimate: i64 = ahead.iter().map(|t| t.estimated_duration).sum();
            let eta = ahead_estimate / concurrency.max(1) + task.estimated_duration;
            (Some(ahead.len()), Some(eta))
        } else {
            (None, None)
        };

        Ok(TaskDetail {
            task,
            remaining_seconds,
            queue_position,
            eta_seconds,
        })
    }

    /// Filtered task listing, oldest first.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, TaskError> {
        Ok(self.store.list_tasks(filter).await?)
    }

    /// Aggregate status counts, optionally per provider.
    pub async fn status_counts(
        &self,
        provider_id: Option<i64>,
    ) -> Result<HashMap<TaskStatus, i64>, TaskError> {
        Ok(self.store.count_by_status(provider_id).await?)
    }

    /// Snapshot of engine-level statistics.
    pub async fn stats(&self) -> Result<EngineStats, TaskError> {
        Ok(EngineStats {
            live_pools: self.pools.count().await,
            live_contexts: self.contexts.count(),
            status_counts: self.store.count_by_status(None).await?,
        })
    }

    async fn resolve_concurrency(&self, provider_id: Option<i64>) -> Result<usize, TaskError> {
        match provider_id {
            Some(provider_id) => {
                let settings = self.providers.get_settings(provider_id).await?;
                Ok(settings
                    .map(|s| s.effective_concurrency())
                    .unwrap_or(1))
            }
            None => Ok(1),
        }
    }
}

/// Scale the per-type baseline estimate by the instance's size class, using
/// the preallocated memory hint as the proxy: provisioning and teardown of
/// larger instances move more data.
fn estimate_duration(task_type: TaskType, preallocated_memory_mb: i64) -> i64 {
    let base = task_type.base_estimate_secs();
    let scale = 1 + preallocated_memory_mb / 8192;
    base * scale.max(1)
}
