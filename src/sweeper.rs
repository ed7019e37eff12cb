//! Periodic maintenance task for the engine's registries and stuck tasks.
//!
//! Everything here is a safety net. The happy path cleans up after itself:
//! workers deregister their contexts, pools are replaced or deleted through
//! the manager, tasks reach terminal states through the control protocol.
//! The sweep exists for what the happy path cannot cover — a process that
//! died between claim and completion, a pool that never drains, registries
//! under churn — and reclassifies or evicts accordingly.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context_registry::TaskContextManager;
use crate::control::TaskControl;
use crate::metrics::SharedMetricsPublisher;
use crate::pool::ProviderPoolManager;
use crate::storage::{ProviderStore, TaskStatus, TaskStore};

/// Background task that periodically sweeps registries and stuck tasks.
///
/// In each pass the sweeper:
/// 1. Evicts stale task contexts and, under registry pressure, forces the
///    tiered batch eviction.
/// 2. Evicts idle and aged-out provider pools (orphan bookkeeping included).
/// 3. Drops pools whose provider was deleted from the source of truth.
/// 4. Reclassifies tasks stuck `running` past the threshold as `timeout`.
/// 5. Reclassifies tasks stuck `cancelling` past the threshold as
///    `cancelled`.
/// 6. Publishes registry-size gauges.
pub struct Sweeper {
    store: Arc<dyn TaskStore>,
    providers: Arc<dyn ProviderStore>,
    contexts: Arc<TaskContextManager>,
    pools: Arc<ProviderPoolManager>,
    control: Arc<TaskControl>,
    metrics: SharedMetricsPublisher,
    interval: Duration,
    running_stuck_threshold: Duration,
    cancelling_stuck_threshold: Duration,
}

impl Sweeper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TaskStore>,
        providers: Arc<dyn ProviderStore>,
        contexts: Arc<TaskContextManager>,
        pools: Arc<ProviderPoolManager>,
        control: Arc<TaskControl>,
        metrics: SharedMetricsPublisher,
        interval: Duration,
        running_stuck_threshold: Duration,
        cancelling_stuck_threshold: Duration,
    ) -> Self {
        Self {
            store,
            providers,
            contexts,
            pools,
            control,
            metrics,
            interval,
            running_stuck_threshold,
            cancelling_stuck_threshold,
        }
    }

    /// Run the sweep loop until cancelled.
    pub async fn run(self, cancel_token: CancellationToken) -> anyhow::Result<()> {
        info!(interval_secs = self.interval.as_secs(), "Starting sweeper");

        loop {
            tokio::select! {
                () = tokio::time::sleep(self.interval) => {
                    self.sweep().await;
                }
                () = cancel_token.cancelled() => {
                    info!("Sweeper cancelled");
                    break;
                }
            }
        }

        Ok(())
    }

    /// One maintenance pass. Public so operational tooling can trigger an
    /// immediate sweep.
    pub async fn sweep(&self) {
        let stale_contexts = self.contexts.cleanup_stale().await;
        if stale_contexts > 0 {
            info!(count = stale_contexts, "Evicted stale task contexts");
        }
        let forced = self.contexts.force_limit_size().await;
        if forced > 0 {
            warn!(count = forced, "Context registry pressure forced evictions");
        }

        let idle_pools = self.pools.cleanup_idle().await;
        if idle_pools > 0 {
            info!(count = idle_pools, "Evicted idle provider pools");
        }

        match self.providers.list_provider_ids().await {
            Ok(valid) => {
                let removed = self.pools.cleanup_deleted(&valid).await;
                if removed > 0 {
                    info!(count = removed, "Removed pools for deleted providers");
                }
            }
            Err(e) => {
                error!(error = ?e, "Failed to list providers, skipping deleted-pool cleanup");
            }
        }

        self.reclassify_stuck_running().await;
        self.reclassify_stuck_cancelling().await;

        self.metrics
            .gauge("contexts.live", self.contexts.count().max(0) as u64)
            .await;
        self.metrics
            .gauge("pools.live", self.pools.count().await as u64)
            .await;
    }

    async fn reclassify_stuck_running(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.running_stuck_threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(7200));

        let stuck = match self.store.tasks_stuck_in(TaskStatus::Running, cutoff).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = ?e, "Failed to scan for stuck running tasks");
                return;
            }
        };

        for task in stuck {
            match self.control.mark_timeout(task.id).await {
                Ok(true) => {
                    warn!(task_id = task.id, "Stuck running task reclassified as timeout");
                }
                Ok(false) => {
                    debug!(task_id = task.id, "Stuck task already transitioned");
                }
                Err(e) => {
                    error!(task_id = task.id, error = ?e, "Failed to reclassify stuck task");
                }
            }
        }
    }

    async fn reclassify_stuck_cancelling(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.cancelling_stuck_threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));

        let stuck = match self
            .store
            .tasks_stuck_in(TaskStatus::Cancelling, cutoff)
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = ?e, "Failed to scan for stuck cancelling tasks");
                return;
            }
        };

        for task in stuck {
            match self.control.expire_cancelling(task.id).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(task_id = task.id, "Stuck cancelling task already transitioned");
                }
                Err(e) => {
                    error!(task_id = task.id, error = ?e, "Failed to expire stuck cancellation");
                }
            }
        }
    }
}
