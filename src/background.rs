//! Background task spawning helpers.
//!
//! This module provides helpers for spawning and managing background tasks
//! with consistent start/stop logging, graceful shutdown support, and a
//! detached fire-and-forget variant whose failures are logged and discarded
//! rather than propagated.

use std::future::Future;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info};

/// Spawn a long-lived background task with lifecycle management.
///
/// Logs task start and completion, and triggers application shutdown (via
/// the token) if the task fails unexpectedly.
pub fn spawn_managed_task<F>(
    tracker: &TaskTracker,
    app_token: CancellationToken,
    task_name: &'static str,
    task_future: F,
) where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    info!(task = task_name, "Starting background task");

    let task_token = app_token.clone();

    tracker.spawn(async move {
        match task_future.await {
            Ok(()) => {
                info!(task = task_name, "Background task completed");
            }
            Err(e) => {
                error!(task = task_name, error = ?e, "Background task failed unexpectedly");
                task_token.cancel();
            }
        }
    });
}

/// Spawn a background task that races its body against the shutdown token.
pub fn spawn_cancellable_task<F, Fut>(
    tracker: &TaskTracker,
    app_token: CancellationToken,
    task_name: &'static str,
    task_builder: F,
) where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    info!(task = task_name, "Starting cancellable background task");

    let task_token = app_token.clone();
    let cancel_token = app_token.clone();

    tracker.spawn(async move {
        tokio::select! {
            result = task_builder(cancel_token.clone()) => {
                match result {
                    Ok(()) => {
                        info!(task = task_name, "Background task completed");
                    }
                    Err(e) => {
                        error!(task = task_name, error = ?e, "Background task failed unexpectedly");
                        task_token.cancel();
                    }
                }
            }
            () = task_token.cancelled() => {
                info!(task = task_name, "Background task shutting down gracefully");
            }
        }
    });
}

/// Spawn a detached best-effort task.
///
/// Request-handling paths never await these; a failure or panic inside one
/// is logged and discarded. The join handle is intentionally dropped.
pub fn spawn_detached<F>(task_name: &'static str, task_future: F)
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        if let Err(e) = task_future.await {
            error!(task = task_name, error = ?e, "Detached task failed");
        } else {
            debug!(task = task_name, "Detached task completed");
        }
    });

    // Panics inside the spawned future abort only that task; tokio captures
    // them in the dropped handle, so nothing can propagate from here.
    drop(handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_managed_task_failure_triggers_shutdown() {
        let tracker = TaskTracker::new();
        let token = CancellationToken::new();

        spawn_managed_task(&tracker, token.clone(), "failing", async {
            anyhow::bail!("boom")
        });

        tracker.close();
        tracker.wait().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancellable_task_stops_on_shutdown() {
        let tracker = TaskTracker::new();
        let token = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));
        let finished_clone = finished.clone();

        spawn_cancellable_task(&tracker, token.clone(), "looper", move |cancel| async move {
            cancel.cancelled().await;
            finished_clone.store(true, Ordering::SeqCst);
            Ok(())
        });

        token.cancel();
        tracker.close();
        tracker.wait().await;
        // The select arm on the shutdown token wins; the task exits either way.
    }

    #[tokio::test]
    async fn test_detached_task_runs() {
        let done = Arc::new(AtomicBool::new(false));
        let done_clone = done.clone();

        spawn_detached("oneshot", async move {
            done_clone.store(true, Ordering::SeqCst);
            Ok(())
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_detached_task_panic_does_not_propagate() {
        spawn_detached("panicking", async move {
            panic!("recovered elsewhere");
        });

        // Reaching this point without the test aborting is the assertion.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
