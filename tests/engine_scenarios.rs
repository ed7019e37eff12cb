//! End-to-end scenarios through the engine's public surface: an in-memory
//! store, real worker pools, and instrumented executors.

use anyhow::Result;
use async_trait::async_trait;
use provisor::context_registry::TaskContextManager;
use provisor::control::{NoopReservations, ResourceReservations, SchedulerWake, TaskControl};
use provisor::executor::{ExecutionContext, ExecutorRegistry, TaskExecutor};
use provisor::metrics::{NoOpMetricsPublisher, SharedMetricsPublisher};
use provisor::pool::{PoolContext, ProviderPoolManager};
use provisor::service::{CreateTaskRequest, TaskService};
use provisor::storage::{
    MemoryInstanceStore, MemoryProviderStore, MemoryTaskStore, ProviderSettings, Task, TaskStatus,
    TaskStore,
};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Executor that counts executions and completes immediately.
struct CountingExecutor {
    executions: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskExecutor for CountingExecutor {
    async fn execute(&self, _ctx: &ExecutionContext, _task: &Task) -> Result<Option<Value>> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }
}

/// Executor that blocks until released (or cancelled), to hold a worker busy
/// at a deterministic point.
struct GatedExecutor {
    release: Arc<Notify>,
    started: Arc<Notify>,
}

#[async_trait]
impl TaskExecutor for GatedExecutor {
    async fn execute(&self, ctx: &ExecutionContext, _task: &Task) -> Result<Option<Value>> {
        self.started.notify_one();
        tokio::select! {
            () = self.release.notified() => Ok(Some(serde_json::json!({"gated": true}))),
            () = ctx.token().cancelled() => anyhow::bail!("interrupted"),
        }
    }
}

struct Engine {
    service: TaskService,
    store: Arc<MemoryTaskStore>,
    providers: Arc<MemoryProviderStore>,
    contexts: Arc<TaskContextManager>,
    pools: Arc<ProviderPoolManager>,
    executions: Arc<AtomicUsize>,
    release: Arc<Notify>,
    started: Arc<Notify>,
}

fn engine_with(reservations: Arc<dyn ResourceReservations>) -> Engine {
    let store = Arc::new(MemoryTaskStore::new());
    let providers = Arc::new(MemoryProviderStore::new());
    let contexts = Arc::new(TaskContextManager::new(1000, Duration::from_secs(3600)));
    let metrics: SharedMetricsPublisher = Arc::new(NoOpMetricsPublisher::new());
    let wake = SchedulerWake::new();
    let control = Arc::new(TaskControl::new(
        store.clone(),
        Arc::new(MemoryInstanceStore::new()),
        contexts.clone(),
        reservations,
        wake,
        metrics.clone(),
    ));

    let executions = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(Notify::new());
    let started = Arc::new(Notify::new());
    let executors = ExecutorRegistry::new()
        .register(
            provisor::storage::TaskType::Start,
            Arc::new(CountingExecutor {
                executions: executions.clone(),
            }),
        )
        .register(
            provisor::storage::TaskType::Create,
            Arc::new(GatedExecutor {
                release: release.clone(),
                started: started.clone(),
            }),
        );

    let pool_ctx = Arc::new(PoolContext {
        contexts: contexts.clone(),
        store: store.clone(),
        executors: Arc::new(executors),
        control: control.clone(),
        metrics: metrics.clone(),
    });
    let pools = Arc::new(ProviderPoolManager::new(
        pool_ctx,
        Duration::from_secs(600),
        Duration::from_secs(3600),
    ));

    let service = TaskService::new(
        store.clone(),
        providers.clone(),
        pools.clone(),
        control,
        contexts.clone(),
        metrics,
        Duration::from_secs(5),
    );

    Engine {
        service,
        store,
        providers,
        contexts,
        pools,
        executions,
        release,
        started,
    }
}

fn engine() -> Engine {
    engine_with(Arc::new(NoopReservations))
}

async fn wait_for_status(store: &MemoryTaskStore, task_id: i64, status: TaskStatus) -> bool {
    for _ in 0..400 {
        let task = store.first_by_id(task_id).await.unwrap().unwrap();
        if task.status == status {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test]
async fn start_task_with_zero_timeout_gets_type_default() {
    let eng = engine();
    let mut request = CreateTaskRequest::new(1, "start", "{}");
    request.timeout_seconds = 0;
    let task = eng.service.create_task(request).await.unwrap();

    assert_eq!(task.timeout_duration, 300);
    assert_eq!(task.status, TaskStatus::Pending);
}

#[tokio::test]
async fn concurrent_dispatch_executes_exactly_once() {
    let eng = engine();
    eng.providers
        .upsert(ProviderSettings {
            provider_id: 1,
            task_concurrency: Some(2),
        })
        .await;

    let mut request = CreateTaskRequest::new(1, "start", "{}");
    request.provider_id = Some(1);
    let task = eng.service.create_task(request).await.unwrap();

    let (a, b) = tokio::join!(
        eng.service.start_task(task.id),
        eng.service.start_task(task.id)
    );
    // Each dispatcher either enqueued or observed the claim race; neither
    // may fail any other way.
    for result in [a, b] {
        if let Err(e) = result {
            assert!(
                matches!(e, provisor::errors::TaskError::StateAlreadyChanged { .. }),
                "unexpected error: {e}"
            );
        }
    }

    assert!(wait_for_status(&eng.store, task.id, TaskStatus::Completed).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(eng.executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn owner_cancel_of_pending_task_records_reason_and_skips_executor() {
    let eng = engine();
    let task = eng
        .service
        .create_task(CreateTaskRequest::new(77, "start", "{}"))
        .await
        .unwrap();

    eng.service.cancel_task(task.id, 77).await.unwrap();

    let loaded = eng.store.first_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, TaskStatus::Cancelled);
    assert_eq!(loaded.cancel_reason.as_deref(), Some("cancelled by user"));
    assert_eq!(eng.executions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn admin_force_stop_marks_cancelled_immediately() {
    let eng = engine();
    let mut request = CreateTaskRequest::new(1, "create", "{}");
    request.provider_id = Some(1);
    let task = eng.service.create_task(request).await.unwrap();
    eng.service.start_task(task.id).await.unwrap();
    eng.started.notified().await;

    // The execution context is registered while the executor is parked.
    let context = eng.contexts.get(task.id).await.expect("context registered");
    assert!(!context.token.is_cancelled());

    eng.service
        .force_stop_task(task.id, "admin requested stop")
        .await
        .unwrap();

    // Cancelled immediately — not cancelling.
    let loaded = eng.store.first_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, TaskStatus::Cancelled);
    assert_eq!(loaded.cancel_reason.as_deref(), Some("admin requested stop"));

    // The context cancellation lands asynchronously and the worker unwinds.
    for _ in 0..100 {
        if context.token.is_cancelled() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(context.token.is_cancelled());
    for _ in 0..100 {
        if eng.contexts.count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(eng.contexts.count(), 0);
}

#[tokio::test]
async fn concurrency_change_replaces_pool_without_aborting_in_flight_work() {
    let eng = engine();
    eng.providers
        .upsert(ProviderSettings {
            provider_id: 5,
            task_concurrency: Some(1),
        })
        .await;

    // Occupy the serial pool with a gated task.
    let mut request = CreateTaskRequest::new(1, "create", "{}");
    request.provider_id = Some(5);
    let gated = eng.service.create_task(request).await.unwrap();
    eng.service.start_task(gated.id).await.unwrap();
    eng.started.notified().await;

    // Concurrency 1 -> 3. The next dispatch builds a fresh three-worker
    // pool; the old pool is shut down but its in-flight task keeps running.
    eng.providers
        .upsert(ProviderSettings {
            provider_id: 5,
            task_concurrency: Some(3),
        })
        .await;

    let mut request = CreateTaskRequest::new(1, "start", "{}");
    request.provider_id = Some(5);
    let task = eng.service.create_task(request).await.unwrap();
    eng.service.start_task(task.id).await.unwrap();

    // The new task executes in the replacement pool even though the gated
    // task still holds the old pool's only worker.
    assert!(wait_for_status(&eng.store, task.id, TaskStatus::Completed).await);
    let new_pool = eng.pools.get_or_create(5, 3).await;
    assert_eq!(new_pool.worker_count(), 3);

    // Release the gate: the old pool's task completes normally.
    eng.release.notify_one();
    assert!(wait_for_status(&eng.store, gated.id, TaskStatus::Completed).await);
    let loaded = eng.store.first_by_id(gated.id).await.unwrap().unwrap();
    assert_eq!(
        loaded.result_data,
        Some(serde_json::json!({"gated": true}))
    );
}

#[tokio::test]
async fn failed_task_without_instance_releases_reservations() {
    struct RecordingReservations {
        released: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ResourceReservations for RecordingReservations {
        async fn release(&self, _task: &Task) -> Result<()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let released = Arc::new(AtomicUsize::new(0));
    let eng = engine_with(Arc::new(RecordingReservations {
        released: released.clone(),
    }));

    // "stop" has no registered executor in this fixture, so dispatch fails
    // the task; it carries no instance, so the reservation hook fires.
    let task = eng
        .service
        .create_task(CreateTaskRequest::new(1, "stop", "{}"))
        .await
        .unwrap();
    eng.service.start_task(task.id).await.unwrap();

    assert!(wait_for_status(&eng.store, task.id, TaskStatus::Failed).await);
    for _ in 0..100 {
        if released.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn registries_stay_bounded_under_churn() {
    let eng = engine();
    for batch in 0..5i64 {
        let mut ids = vec![];
        for i in 0..10i64 {
            let mut request = CreateTaskRequest::new(1, "start", "{}");
            request.provider_id = Some((batch * 10 + i) % 3 + 1);
            ids.push(eng.service.create_task(request).await.unwrap().id);
        }
        for id in &ids {
            eng.service.start_task(*id).await.unwrap();
        }
        for id in ids {
            assert!(wait_for_status(&eng.store, id, TaskStatus::Completed).await);
        }
        // Pools exist only for the three providers in use; contexts drain
        // back to zero once the batch completes.
        assert!(eng.pools.count().await <= 3);
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(eng.contexts.count(), 0);
    assert_eq!(eng.executions.load(Ordering::SeqCst), 50);
}
