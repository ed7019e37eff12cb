use anyhow::Result;
use provisor::{
    background::spawn_cancellable_task,
    config::Config,
    context_registry::TaskContextManager,
    control::{NoopReservations, SchedulerWake, TaskControl},
    executor::ExecutorRegistry,
    metrics::create_metrics_publisher,
    pool::{PoolContext, ProviderPoolManager},
    service::TaskService,
    storage::{PostgresInstanceStore, PostgresProviderStore, PostgresTaskStore},
    sweeper::Sweeper,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::signal;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Build the executor dispatch table.
///
/// Provider-facing executors (LXD/Incus over SSH, Proxmox, Docker) are
/// separate crates wired in here by the deployment build; the bare daemon
/// runs the scheduling surface with an empty table, failing any dispatched
/// task with a descriptive error.
fn build_executors() -> ExecutorRegistry {
    ExecutorRegistry::new()
}

#[tokio::main]
async fn main() -> Result<()> {
    use tracing_subscriber::prelude::*;

    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "provisor=info,sqlx=warn".into()),
    );

    let fmt_layer = if std::env::var("JSON_LOGS").is_ok() {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_thread_ids(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    let config = Config::new()?;
    tracing::info!("Starting provisor task orchestration engine");

    let metrics = create_metrics_publisher(&config.metrics)?;

    let pg_pool = Arc::new(
        PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await?,
    );

    let task_store = Arc::new(PostgresTaskStore::new(pg_pool.clone()));
    task_store.initialize_schema().await?;
    let provider_store = Arc::new(PostgresProviderStore::new(pg_pool.clone()));
    provider_store.initialize_schema().await?;
    let instance_store = Arc::new(PostgresInstanceStore::new(pg_pool.clone()));
    instance_store.initialize_schema().await?;

    let engine = config.engine.clone();
    let contexts = Arc::new(TaskContextManager::new(
        engine.context_capacity,
        engine.context_max_age,
    ));
    let wake = SchedulerWake::new();
    let control = Arc::new(TaskControl::new(
        task_store.clone(),
        instance_store.clone(),
        contexts.clone(),
        Arc::new(NoopReservations),
        wake.clone(),
        metrics.clone(),
    ));

    let pool_context = Arc::new(PoolContext {
        contexts: contexts.clone(),
        store: task_store.clone(),
        executors: Arc::new(build_executors()),
        control: control.clone(),
        metrics: metrics.clone(),
    });
    let pools = Arc::new(ProviderPoolManager::new(
        pool_context,
        engine.pool_idle_timeout,
        engine.pool_max_lifetime,
    ));

    let service = Arc::new(TaskService::new(
        task_store.clone(),
        provider_store.clone(),
        pools.clone(),
        control.clone(),
        contexts.clone(),
        metrics.clone(),
        engine.enqueue_timeout,
    ));

    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    // Periodic maintenance sweep.
    let sweeper = Sweeper::new(
        task_store.clone(),
        provider_store.clone(),
        contexts.clone(),
        pools.clone(),
        control.clone(),
        metrics.clone(),
        engine.sweep_interval,
        engine.running_stuck_threshold,
        engine.cancelling_stuck_threshold,
    );
    spawn_cancellable_task(&tracker, token.clone(), "sweeper", move |cancel| {
        sweeper.run(cancel)
    });

    // Pending-task dispatch loop: woken immediately after any terminal
    // transition, with a poll tick as the fallback.
    {
        let service = service.clone();
        let wake = wake.clone();
        let poll_interval = config.dispatch_poll_interval;
        spawn_cancellable_task(&tracker, token.clone(), "dispatch", move |cancel| async move {
            loop {
                tokio::select! {
                    () = wake.notified() => {}
                    () = tokio::time::sleep(poll_interval) => {}
                    () = cancel.cancelled() => break,
                }
                match service.dispatch_pending().await {
                    Ok(0) => {}
                    Ok(count) => tracing::debug!(count, "Dispatched pending tasks"),
                    Err(e) => tracing::error!(error = %e, "Pending dispatch pass failed"),
                }
            }
            Ok(())
        });
    }

    // Signal handler.
    {
        let signal_tracker = tracker.clone();
        let signal_token = token.clone();
        tokio::spawn(async move {
            let ctrl_c = async {
                signal::ctrl_c()
                    .await
                    .expect("failed to install Ctrl+C handler");
            };

            #[cfg(unix)]
            let terminate = async {
                signal::unix::signal(signal::unix::SignalKind::terminate())
                    .expect("failed to install signal handler")
                    .recv()
                    .await;
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                () = signal_token.cancelled() => {},
                _ = terminate => {
                    tracing::info!("Received SIGTERM, initiating shutdown");
                },
                _ = ctrl_c => {
                    tracing::info!("Received Ctrl+C, initiating shutdown");
                },
            }

            signal_tracker.close();
            signal_token.cancel();
        });
    }

    token.cancelled().await;
    tracing::info!("Shutting down");

    tracker.close();
    tracker.wait().await;
    pools.cancel_all().await;
    contexts.cancel_all().await;

    tracing::info!("Shutdown complete");
    Ok(())
}
