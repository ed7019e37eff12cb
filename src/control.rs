//! Task control protocol: terminal transitions and the cancellation paths.
//!
//! Every transition here goes through the store's conditional status-guarded
//! update, so two actors racing for the same transition resolve to exactly
//! one winner; the loser observes zero affected rows and reports "state
//! already changed". Cancellation is cooperative by default (`running ->
//! cancelling`, the worker finishes the transition when it unwinds) with
//! non-cooperative force paths that mark the task terminal immediately,
//! because some provider operations — a blocking remote command mid-flight —
//! cannot be aborted on demand.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::background::spawn_detached;
use crate::constants;
use crate::context_registry::TaskContextManager;
use crate::errors::TaskError;
use crate::metrics::SharedMetricsPublisher;
use crate::storage::{InstanceStore, Task, TaskChanges, TaskStatus, TaskStore, TaskType};

/// Signal consumed by an external dispatch loop to re-check pending work
/// immediately after a terminal transition instead of waiting for its next
/// poll tick.
#[derive(Clone)]
pub struct SchedulerWake {
    notify: Arc<Notify>,
}

impl SchedulerWake {
    pub fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl Default for SchedulerWake {
    fn default() -> Self {
        Self::new()
    }
}

/// Hook releasing quota/resources pre-reserved for a task that failed or was
/// cancelled before producing a managed instance. The surrounding platform
/// supplies the real implementation.
#[async_trait]
pub trait ResourceReservations: Send + Sync {
    async fn release(&self, task: &Task) -> anyhow::Result<()>;
}

/// Default no-op reservation hook.
#[derive(Debug, Clone, Default)]
pub struct NoopReservations;

#[async_trait]
impl ResourceReservations for NoopReservations {
    async fn release(&self, _task: &Task) -> anyhow::Result<()> {
        Ok(())
    }
}

/// State-transition functions shared by the service façade and the worker
/// pools.
pub struct TaskControl {
    store: Arc<dyn TaskStore>,
    instances: Arc<dyn InstanceStore>,
    contexts: Arc<TaskContextManager>,
    reservations: Arc<dyn ResourceReservations>,
    wake: SchedulerWake,
    metrics: SharedMetricsPublisher,
}

impl TaskControl {
    pub fn new(
        store: Arc<dyn TaskStore>,
        instances: Arc<dyn InstanceStore>,
        contexts: Arc<TaskContextManager>,
        reservations: Arc<dyn ResourceReservations>,
        wake: SchedulerWake,
        metrics: SharedMetricsPublisher,
    ) -> Self {
        Self {
            store,
            instances,
            contexts,
            reservations,
            wake,
            metrics,
        }
    }

    pub fn wake_signal(&self) -> SchedulerWake {
        self.wake.clone()
    }

    /// Idempotent terminal transition to `completed` or `failed`.
    ///
    /// A task that is already terminal is left untouched: the duplicate
    /// signal (a panic path racing the normal return path, or a repeated
    /// caller) is a silent no-op.
    pub async fn complete_task(
        &self,
        task_id: i64,
        success: bool,
        error_message: Option<String>,
        result_data: Option<serde_json::Value>,
    ) -> Result<(), TaskError> {
        let task = self
            .store
            .first_by_id(task_id)
            .await?
            .ok_or(TaskError::NotFound { task_id })?;

        if task.status.is_terminal() {
            debug!(task_id, status = %task.status, "Duplicate completion ignored");
            return Ok(());
        }

        let target = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        if !task.status.can_transition_to(target) {
            return Err(TaskError::StateAlreadyChanged {
                task_id,
                status: task.status.to_string(),
            });
        }

        let mut changes = TaskChanges::status(target).with_completed_at(Utc::now());
        if success {
            changes.progress = Some(100);
        }
        if let Some(message) = error_message {
            changes = changes.with_error_message(message);
        }
        if let Some(data) = result_data {
            changes = changes.with_result_data(data);
        }

        let affected = self
            .store
            .update_where_status(task_id, task.status, changes)
            .await?;
        if affected == 0 {
            // Someone else got there first. If the task is terminal now this
            // is just a duplicate completion; otherwise surface the race.
            let current = self.store.first_by_id(task_id).await?;
            return match current {
                Some(t) if t.status.is_terminal() => Ok(()),
                Some(t) => Err(TaskError::StateAlreadyChanged {
                    task_id,
                    status: t.status.to_string(),
                }),
                None => Err(TaskError::NotFound { task_id }),
            };
        }

        info!(task_id, success, "Task completed");
        if success {
            self.metrics.incr("task.completed").await;
        } else {
            self.metrics.incr("task.failed").await;
            self.release_if_unbound(&task);
        }
        self.wake.wake();
        Ok(())
    }

    /// End-user cancellation path. Only permitted for force-stoppable tasks
    /// owned by the calling user.
    pub async fn cancel_task(&self, task_id: i64, user_id: i64) -> Result<(), TaskError> {
        let task = self
            .store
            .first_by_id(task_id)
            .await?
            .ok_or(TaskError::NotFound { task_id })?;

        if task.user_id != user_id {
            return Err(TaskError::NotOwner { task_id, user_id });
        }
        if !task.is_force_stoppable {
            return Err(TaskError::NotForceStoppable { task_id });
        }

        match task.status {
            TaskStatus::Pending => {
                self.cancel_pending(&task, constants::CANCEL_REASON_USER)
                    .await
            }
            TaskStatus::Running => {
                let affected = self
                    .store
                    .update_where_status(
                        task_id,
                        TaskStatus::Running,
                        TaskChanges::status(TaskStatus::Cancelling)
                            .with_cancel_reason(constants::CANCEL_REASON_USER),
                    )
                    .await?;
                if affected == 0 {
                    return self.state_already_changed(task_id).await;
                }

                info!(task_id, user_id, "Task cancellation requested");
                self.metrics.incr("task.cancel.requested").await;

                // The executing worker observes the cancelled token and
                // finishes the cancelling -> cancelled transition itself.
                let contexts = self.contexts.clone();
                spawn_detached("cancel-task-context", async move {
                    if !contexts.cancel(task_id).await {
                        debug!(task_id, "No live context to cancel");
                    }
                    Ok(())
                });
                Ok(())
            }
            status => Err(TaskError::StateAlreadyChanged {
                task_id,
                status: status.to_string(),
            }),
        }
    }

    /// Administrative cancellation. From `pending` this cancels in place;
    /// from `running` it force-stops (immediate terminal marking); from
    /// `cancelling` it force-kills a stalled cooperative cancellation.
    pub async fn cancel_task_by_admin(&self, task_id: i64, reason: &str) -> Result<(), TaskError> {
        let task = self
            .store
            .first_by_id(task_id)
            .await?
            .ok_or(TaskError::NotFound { task_id })?;

        match task.status {
            TaskStatus::Pending => self.cancel_pending(&task, reason).await,
            TaskStatus::Running => self.force_terminal(&task, TaskStatus::Running, reason).await,
            TaskStatus::Cancelling => {
                self.force_terminal(&task, TaskStatus::Cancelling, reason)
                    .await
            }
            status => Err(TaskError::StateAlreadyChanged {
                task_id,
                status: status.to_string(),
            }),
        }
    }

    /// Administrative force stop, always permitted regardless of
    /// `is_force_stoppable`.
    pub async fn force_stop_task(&self, task_id: i64, reason: &str) -> Result<(), TaskError> {
        self.cancel_task_by_admin(task_id, reason).await
    }

    /// Finish a cooperative cancellation: `cancelling -> cancelled`. Called
    /// by the worker as it unwinds after observing its cancelled token.
    /// Returns whether this call performed the transition.
    pub async fn finish_cancellation(&self, task_id: i64) -> Result<bool, TaskError> {
        let affected = self
            .store
            .update_where_status(
                task_id,
                TaskStatus::Cancelling,
                TaskChanges::status(TaskStatus::Cancelled).with_completed_at(Utc::now()),
            )
            .await?;
        if affected == 0 {
            // A force kill may already have marked the task cancelled.
            return Ok(false);
        }

        info!(task_id, "Task cancelled");
        self.metrics.incr("task.cancelled").await;
        if let Some(task) = self.store.first_by_id(task_id).await? {
            self.run_cancelled_cleanup(task);
        }
        self.wake.wake();
        Ok(true)
    }

    /// Sweep support: give up on a cooperative cancellation whose worker
    /// never confirmed (process crash, not panic — panics are caught at the
    /// worker boundary). The recorded reason makes clear the engine stopped
    /// waiting; the provider-side operation is not known to have stopped.
    pub async fn expire_cancelling(&self, task_id: i64) -> Result<bool, TaskError> {
        let affected = self
            .store
            .update_where_status(
                task_id,
                TaskStatus::Cancelling,
                TaskChanges::status(TaskStatus::Cancelled)
                    .with_cancel_reason(constants::CANCEL_REASON_SWEEP)
                    .with_completed_at(Utc::now()),
            )
            .await?;
        if affected == 0 {
            return Ok(false);
        }

        warn!(task_id, "Stuck cancelling task reclassified as cancelled");
        self.metrics.incr("task.cancel.expired").await;
        if let Some(task) = self.store.first_by_id(task_id).await? {
            self.run_cancelled_cleanup(task);
        }
        self.wake.wake();
        Ok(true)
    }

    /// Reclassify a running task whose execution deadline elapsed.
    pub async fn mark_timeout(&self, task_id: i64) -> Result<bool, TaskError> {
        let affected = self
            .store
            .update_where_status(
                task_id,
                TaskStatus::Running,
                TaskChanges::status(TaskStatus::Timeout)
                    .with_completed_at(Utc::now())
                    .with_error_message("execution deadline exceeded"),
            )
            .await?;
        if affected == 0 {
            return Ok(false);
        }

        warn!(task_id, "Task timed out");
        self.metrics.incr("task.timeout").await;
        self.wake.wake();
        Ok(true)
    }

    /// `pending -> cancelled` shared by the user and admin paths.
    async fn cancel_pending(&self, task: &Task, reason: &str) -> Result<(), TaskError> {
        let affected = self
            .store
            .update_where_status(
                task.id,
                TaskStatus::Pending,
                TaskChanges::status(TaskStatus::Cancelled)
                    .with_cancel_reason(reason)
                    .with_completed_at(Utc::now()),
            )
            .await?;
        if affected == 0 {
            return self.state_already_changed(task.id).await;
        }

        info!(task_id = task.id, reason, "Pending task cancelled");
        self.metrics.incr("task.cancelled").await;
        self.release_if_unbound(task);
        self.run_cancelled_cleanup(task.clone());
        self.wake.wake();
        Ok(())
    }

    /// Immediate terminal marking for the force-stop and force-kill paths.
    /// Context cancellation and compensating cleanup run detached; the
    /// executor is not waited on.
    async fn force_terminal(
        &self,
        task: &Task,
        from: TaskStatus,
        reason: &str,
    ) -> Result<(), TaskError> {
        let affected = self
            .store
            .update_where_status(
                task.id,
                from,
                TaskChanges::status(TaskStatus::Cancelled)
                    .with_cancel_reason(reason)
                    .with_completed_at(Utc::now()),
            )
            .await?;
        if affected == 0 {
            return self.state_already_changed(task.id).await;
        }

        info!(task_id = task.id, from = %from, reason, "Task force-stopped");
        self.metrics.incr("task.cancel.forced").await;

        let contexts = self.contexts.clone();
        let task_id = task.id;
        spawn_detached("force-stop-context", async move {
            contexts.cancel(task_id).await;
            Ok(())
        });

        self.release_if_unbound(task);
        self.run_cancelled_cleanup(task.clone());
        self.wake.wake();
        Ok(())
    }

    /// Type-specific compensation after a cancellation. A cancelled `delete`
    /// task leaves its instance flagged `deleting` even though the
    /// underlying deletion may never have started; restore it to a safe
    /// state so the platform does not treat it as gone.
    fn run_cancelled_cleanup(&self, task: Task) {
        let instances = self.instances.clone();
        spawn_detached("cancelled-task-cleanup", async move {
            if let (TaskType::Delete, Some(instance_id)) = (task.task_type, task.instance_id) {
                let restored = instances
                    .update_status_where(instance_id, "deleting", "stopped")
                    .await?;
                if restored > 0 {
                    info!(
                        task_id = task.id,
                        instance_id, "Restored instance status after cancelled delete"
                    );
                }
            }
            Ok(())
        });
    }

    /// Release pre-reserved resources for a task that never produced a
    /// managed instance. Detached; request paths never wait on it.
    fn release_if_unbound(&self, task: &Task) {
        if task.instance_id.is_some() {
            return;
        }
        let reservations = self.reservations.clone();
        let task = task.clone();
        spawn_detached("release-reservations", async move {
            reservations.release(&task).await
        });
    }

    async fn state_already_changed(&self, task_id: i64) -> Result<(), TaskError> {
        let status = self
            .store
            .first_by_id(task_id)
            .await?
            .map(|t| t.status.to_string())
            .unwrap_or_else(|| "missing".to_string());
        Err(TaskError::StateAlreadyChanged { task_id, status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoOpMetricsPublisher;
    use crate::storage::{MemoryInstanceStore, MemoryTaskStore, NewTask};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        store: Arc<MemoryTaskStore>,
        instances: Arc<MemoryInstanceStore>,
        contexts: Arc<TaskContextManager>,
        control: TaskControl,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryTaskStore::new());
        let instances = Arc::new(MemoryInstanceStore::new());
        let contexts = Arc::new(TaskContextManager::new(100, Duration::from_secs(3600)));
        let control = TaskControl::new(
            store.clone(),
            instances.clone(),
            contexts.clone(),
            Arc::new(NoopReservations),
            SchedulerWake::new(),
            Arc::new(NoOpMetricsPublisher::new()),
        );
        Fixture {
            store,
            instances,
            contexts,
            control,
        }
    }

    async fn make_running(fx: &Fixture, new_task: NewTask) -> Task {
        let task = fx.store.create_task(new_task).await.unwrap();
        fx.store
            .update_where_status(
                task.id,
                TaskStatus::Pending,
                TaskChanges::status(TaskStatus::Running).with_started_at(Utc::now()),
            )
            .await
            .unwrap();
        fx.store.first_by_id(task.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_completion_is_idempotent() {
        let fx = fixture();
        let task = make_running(&fx, NewTask::new(1, TaskType::Start, "{}")).await;

        fx.control
            .complete_task(task.id, true, None, Some(serde_json::json!({"ip": "10.0.0.5"})))
            .await
            .unwrap();
        let loaded = fx.store.first_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.progress, 100);
        assert!(loaded.completed_at.is_some());

        // A second completion — even with the opposite outcome — is a no-op.
        fx.control
            .complete_task(task.id, false, Some("late failure".to_string()), None)
            .await
            .unwrap();
        let loaded = fx.store.first_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert!(loaded.error_message.is_none());
    }

    #[tokio::test]
    async fn test_completion_records_failure_message() {
        let fx = fixture();
        let task = make_running(&fx, NewTask::new(1, TaskType::Create, "{}")).await;

        fx.control
            .complete_task(task.id, false, Some("ssh: connection reset".to_string()), None)
            .await
            .unwrap();
        let loaded = fx.store.first_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("ssh: connection reset"));
    }

    #[tokio::test]
    async fn test_user_cancel_of_pending_task() {
        let fx = fixture();
        let task = fx
            .store
            .create_task(NewTask::new(42, TaskType::Create, "{}"))
            .await
            .unwrap();

        fx.control.cancel_task(task.id, 42).await.unwrap();

        let loaded = fx.store.first_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Cancelled);
        assert_eq!(loaded.cancel_reason.as_deref(), Some("cancelled by user"));
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_user_cancel_requires_ownership_and_flag() {
        let fx = fixture();
        let task = fx
            .store
            .create_task(NewTask::new(42, TaskType::Create, "{}"))
            .await
            .unwrap();

        assert!(matches!(
            fx.control.cancel_task(task.id, 7).await,
            Err(TaskError::NotOwner { .. })
        ));

        let mut locked = NewTask::new(42, TaskType::Delete, "{}");
        locked.is_force_stoppable = false;
        let locked = fx.store.create_task(locked).await.unwrap();
        assert!(matches!(
            fx.control.cancel_task(locked.id, 42).await,
            Err(TaskError::NotForceStoppable { .. })
        ));
    }

    #[tokio::test]
    async fn test_user_cancel_of_running_task_is_cooperative() {
        let fx = fixture();
        let task = make_running(&fx, NewTask::new(42, TaskType::Start, "{}")).await;
        let token = CancellationToken::new();
        fx.contexts.add(task.id, token.clone()).await.unwrap();

        fx.control.cancel_task(task.id, 42).await.unwrap();

        // Marked cancelling immediately; the terminal transition belongs to
        // the worker.
        let loaded = fx.store.first_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Cancelling);

        // The detached context cancel lands shortly after.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(token.is_cancelled());

        // Worker unwinds and finishes the transition.
        assert!(fx.control.finish_cancellation(task.id).await.unwrap());
        let loaded = fx.store.first_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_admin_force_stop_of_running_task() {
        let fx = fixture();
        let task = make_running(&fx, NewTask::new(1, TaskType::Restart, "{}")).await;
        let token = CancellationToken::new();
        fx.contexts.add(task.id, token.clone()).await.unwrap();

        fx.control
            .cancel_task_by_admin(task.id, "maintenance window")
            .await
            .unwrap();

        // Cancelled immediately, not cancelling.
        let loaded = fx.store.first_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Cancelled);
        assert_eq!(loaded.cancel_reason.as_deref(), Some("maintenance window"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(token.is_cancelled());

        // The worker's late finish_cancellation finds nothing to do.
        assert!(!fx.control.finish_cancellation(task.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_admin_force_kill_of_stalled_cancelling_task() {
        let fx = fixture();
        let task = make_running(&fx, NewTask::new(42, TaskType::Stop, "{}")).await;
        fx.control.cancel_task(task.id, 42).await.unwrap();

        fx.control
            .cancel_task_by_admin(task.id, "stalled cancellation")
            .await
            .unwrap();
        let loaded = fx.store.first_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_terminal_states_reject_further_transitions() {
        let fx = fixture();
        let task = make_running(&fx, NewTask::new(42, TaskType::Start, "{}")).await;
        fx.control.complete_task(task.id, true, None, None).await.unwrap();

        assert!(matches!(
            fx.control.cancel_task(task.id, 42).await,
            Err(TaskError::StateAlreadyChanged { .. })
        ));
        assert!(matches!(
            fx.control.cancel_task_by_admin(task.id, "too late").await,
            Err(TaskError::StateAlreadyChanged { .. })
        ));
        assert!(!fx.control.mark_timeout(task.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_timeout_from_running() {
        let fx = fixture();
        let task = make_running(&fx, NewTask::new(1, TaskType::Reset, "{}")).await;

        assert!(fx.control.mark_timeout(task.id).await.unwrap());
        let loaded = fx.store.first_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Timeout);
        assert_eq!(
            loaded.error_message.as_deref(),
            Some("execution deadline exceeded")
        );
    }

    #[tokio::test]
    async fn test_cancelled_delete_restores_instance_status() {
        let fx = fixture();
        fx.instances.set_status(9, "deleting").await;

        let mut new_task = NewTask::new(1, TaskType::Delete, "{}");
        new_task.instance_id = Some(9);
        let task = make_running(&fx, new_task).await;

        fx.control
            .cancel_task_by_admin(task.id, "operator abort")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            fx.instances.get_status(9).await.unwrap().as_deref(),
            Some("stopped")
        );
    }

    #[tokio::test]
    async fn test_wake_signal_fires_on_completion() {
        let fx = fixture();
        let wake = fx.control.wake_signal();
        let task = make_running(&fx, NewTask::new(1, TaskType::Start, "{}")).await;

        fx.control.complete_task(task.id, true, None, None).await.unwrap();

        // The permit stored by wake() satisfies this immediately.
        tokio::time::timeout(Duration::from_millis(100), wake.notified())
            .await
            .expect("wake signal should have fired");
    }
}
