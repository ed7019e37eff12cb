//! Fixed-size worker group executing tasks for one provider.

use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::MAX_QUEUE_CAPACITY;
use crate::context_registry::TaskContextManager;
use crate::control::TaskControl;
use crate::errors::PoolError;
use crate::executor::{ExecutionContext, ExecutorRegistry};
use crate::metrics::SharedMetricsPublisher;
use crate::queue::{PushError, TaskQueue};
use crate::storage::{Task, TaskChanges, TaskStatus, TaskStore};

/// How a dispatched task ended, reported back on the request's response
/// channel for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed { message: String },
    Cancelled,
    TimedOut,
    /// The conditional `pending -> running` claim affected zero rows:
    /// another actor transitioned the task first, and this worker backed
    /// off without side effects.
    ClaimLost,
}

/// A unit of work submitted to a provider's pool.
pub struct TaskRequest {
    pub task: Task,
    pub respond_to: oneshot::Sender<TaskOutcome>,
}

/// Shared collaborators handed to every pool.
pub struct PoolContext {
    pub contexts: Arc<TaskContextManager>,
    pub store: Arc<dyn TaskStore>,
    pub executors: Arc<ExecutorRegistry>,
    pub control: Arc<TaskControl>,
    pub metrics: SharedMetricsPublisher,
}

/// A fixed-size worker group bound to one provider.
///
/// Workers block on the pool's bounded queue and execute requests in FIFO
/// dequeue order; with more than one worker, completion order is not
/// guaranteed. The pool's lifetime token cancels the workers independently
/// of any individual task's deadline.
pub struct ProviderWorkerPool {
    provider_id: i64,
    worker_count: usize,
    queue: TaskQueue<TaskRequest>,
    lifetime: CancellationToken,
    ctx: Arc<PoolContext>,
}

impl ProviderWorkerPool {
    /// Create the pool and spawn its workers.
    pub fn start(provider_id: i64, worker_count: usize, ctx: Arc<PoolContext>) -> Arc<Self> {
        let worker_count = worker_count.max(1);
        let capacity = (worker_count * 2).min(MAX_QUEUE_CAPACITY);
        let pool = Arc::new(Self {
            provider_id,
            worker_count,
            queue: TaskQueue::new(capacity),
            lifetime: CancellationToken::new(),
            ctx,
        });

        for worker_id in 0..worker_count {
            let pool = pool.clone();
            tokio::spawn(async move { pool.worker(worker_id).await });
        }

        info!(provider_id, worker_count, capacity, "Provider worker pool started");
        pool
    }

    pub fn provider_id(&self) -> i64 {
        self.provider_id
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    pub fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Cancel the pool's lifetime. Workers exit after finishing their
    /// current task; in-flight executions keep their own deadline-bound
    /// tokens and run to completion.
    pub fn shutdown(&self) {
        self.lifetime.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.lifetime.is_cancelled()
    }

    /// Enqueue a request, waiting up to `timeout` for queue space. The
    /// timeout is the system's backpressure signal for a saturated
    /// provider.
    pub async fn submit(&self, request: TaskRequest, timeout: Duration) -> Result<(), PoolError> {
        match self.queue.push_timeout(request, timeout).await {
            Ok(()) => Ok(()),
            Err(PushError::Closed) => Err(PoolError::QueueClosed {
                provider_id: self.provider_id,
            }),
            Err(PushError::Timeout) => Err(PoolError::EnqueueTimeout {
                provider_id: self.provider_id,
                seconds: timeout.as_secs(),
            }),
        }
    }

    async fn worker(self: Arc<Self>, worker_id: usize) {
        debug!(provider_id = self.provider_id, worker_id, "Worker started");
        loop {
            tokio::select! {
                () = self.lifetime.cancelled() => break,
                request = self.queue.pull() => match request {
                    Some(request) => self.execute_task(request).await,
                    None => break,
                },
            }
        }
        debug!(provider_id = self.provider_id, worker_id, "Worker stopped");
    }

    async fn execute_task(&self, request: TaskRequest) {
        let TaskRequest { task, respond_to } = request;
        let deadline = Duration::from_secs(task.timeout_duration.max(1) as u64);
        // Each execution gets its own token rather than a child of the pool
        // lifetime: replacing a pool (concurrency change) must not abort
        // tasks already executing in it. The lifetime only stops the worker
        // loops from picking up further work.
        let token = CancellationToken::new();

        if let Err(e) = self.ctx.contexts.add(task.id, token.clone()).await {
            warn!(task_id = task.id, error = %e, "Context registration failed, failing task");
            let message = format!("context registration failed: {e}");
            if let Err(err) = self
                .ctx
                .control
                .complete_task(task.id, false, Some(message.clone()), None)
                .await
            {
                warn!(task_id = task.id, error = %err, "Failed to record registration failure");
            }
            let _ = respond_to.send(TaskOutcome::Failed { message });
            return;
        }

        // The panic boundary: anything the executor (or this pool's own
        // bookkeeping below the claim) throws is converted into a recorded
        // failure instead of killing the worker.
        let outcome = match AssertUnwindSafe(self.run(&task, token, deadline))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic);
                error!(task_id = task.id, panic = %message, "Task execution panicked");
                if let Err(e) = self
                    .ctx
                    .control
                    .complete_task(
                        task.id,
                        false,
                        Some(format!("task execution panicked: {message}")),
                        None,
                    )
                    .await
                {
                    warn!(task_id = task.id, error = %e, "Failed to record panic outcome");
                }
                TaskOutcome::Failed { message }
            }
        };

        // Always deregistered, whatever happened above.
        self.ctx.contexts.delete(task.id).await;

        if respond_to.send(outcome).is_err() {
            debug!(task_id = task.id, "Task outcome receiver dropped");
        }
    }

    async fn run(&self, task: &Task, token: CancellationToken, deadline: Duration) -> TaskOutcome {
        // The single conditional update that guarantees at-most-once
        // execution: claim the row out of `pending` under its lock.
        let claimed = match self
            .ctx
            .store
            .update_where_status(
                task.id,
                TaskStatus::Pending,
                TaskChanges::status(TaskStatus::Running).with_started_at(Utc::now()),
            )
            .await
        {
            Ok(affected) => affected,
            Err(e) => {
                warn!(task_id = task.id, error = %e, "Claim query failed");
                let message = format!("failed to claim task: {e}");
                let _ = self
                    .ctx
                    .control
                    .complete_task(task.id, false, Some(message.clone()), None)
                    .await;
                return TaskOutcome::Failed { message };
            }
        };
        if claimed == 0 {
            debug!(task_id = task.id, "Task already claimed elsewhere");
            return TaskOutcome::ClaimLost;
        }

        self.ctx
            .metrics
            .incr_with_tags("task.started", &[("type", task.task_type.as_str())])
            .await;

        let Some(executor) = self.ctx.executors.get(task.task_type) else {
            let message = format!("no executor registered for task type {}", task.task_type);
            error!(task_id = task.id, %message, "Dispatch failed");
            let _ = self
                .ctx
                .control
                .complete_task(task.id, false, Some(message.clone()), None)
                .await;
            return TaskOutcome::Failed { message };
        };

        let exec_ctx = ExecutionContext::new(token.clone(), self.ctx.store.clone(), task.id);
        let started = Instant::now();
        let result = tokio::select! {
            () = token.cancelled() => None,
            result = tokio::time::timeout(deadline, executor.execute(&exec_ctx, task)) => Some(result),
        };
        self.ctx
            .metrics
            .time("task.duration", started.elapsed().as_millis() as u64)
            .await;

        match result {
            None => self.unwind_cancelled(task.id).await,
            Some(Err(_elapsed)) => {
                if let Err(e) = self.ctx.control.mark_timeout(task.id).await {
                    warn!(task_id = task.id, error = %e, "Failed to record timeout");
                }
                TaskOutcome::TimedOut
            }
            Some(Ok(Ok(result_data))) => {
                if let Err(e) = self
                    .ctx
                    .control
                    .complete_task(task.id, true, None, result_data)
                    .await
                {
                    warn!(task_id = task.id, error = %e, "Failed to record completion");
                }
                TaskOutcome::Completed
            }
            Some(Ok(Err(exec_error))) => {
                if token.is_cancelled() {
                    // The executor surfaced the cancellation as its error.
                    return self.unwind_cancelled(task.id).await;
                }
                let message = exec_error.to_string();
                if let Err(e) = self
                    .ctx
                    .control
                    .complete_task(task.id, false, Some(message.clone()), None)
                    .await
                {
                    warn!(task_id = task.id, error = %e, "Failed to record failure");
                }
                TaskOutcome::Failed { message }
            }
        }
    }

    /// Finish a cooperative cancellation as this worker unwinds. A force
    /// stop may already have marked the task terminal; that is not an
    /// error here.
    async fn unwind_cancelled(&self, task_id: i64) -> TaskOutcome {
        match self.ctx.control.finish_cancellation(task_id).await {
            Ok(true) => debug!(task_id, "Cancellation finished by worker"),
            Ok(false) => debug!(task_id, "Task already terminal on unwind"),
            Err(e) => warn!(task_id, error = %e, "Failed to finish cancellation"),
        }
        TaskOutcome::Cancelled
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
