//! Registry of per-provider worker pools.
//!
//! Pools are created lazily on first dispatch. A provider's concurrency is
//! runtime configuration: when it changes, the manager does not resize the
//! live pool — it cancels the old pool's lifetime and builds a replacement,
//! letting in-flight tasks finish under the old lifetime while new
//! dispatches land in the new pool.
//!
//! All three registries (pools, last-access times, creation times) live
//! behind one lock, so any multi-registry mutation is atomic: there is no
//! observable state in which one registry has a provider's entry and
//! another does not. A defensive orphan sweep still runs during idle
//! cleanup; finding anything there indicates a bug elsewhere and is logged
//! as a warning before self-healing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::worker_pool::{PoolContext, ProviderWorkerPool};

struct Registries {
    pools: HashMap<i64, Arc<ProviderWorkerPool>>,
    last_access: HashMap<i64, Instant>,
    created_at: HashMap<i64, Instant>,
}

/// Registry of live provider pools.
pub struct ProviderPoolManager {
    inner: RwLock<Registries>,
    ctx: Arc<PoolContext>,
    idle_timeout: Duration,
    max_lifetime: Duration,
}

impl ProviderPoolManager {
    pub fn new(ctx: Arc<PoolContext>, idle_timeout: Duration, max_lifetime: Duration) -> Self {
        Self {
            inner: RwLock::new(Registries {
                pools: HashMap::new(),
                last_access: HashMap::new(),
                created_at: HashMap::new(),
            }),
            ctx,
            idle_timeout,
            max_lifetime,
        }
    }

    /// Return the provider's pool, creating or replacing it as needed.
    ///
    /// An existing pool is reused only when its worker count matches the
    /// requested concurrency; otherwise it is shut down and replaced, and
    /// tasks already executing in it run to completion under the old
    /// lifetime.
    pub async fn get_or_create(
        &self,
        provider_id: i64,
        concurrency: usize,
    ) -> Arc<ProviderWorkerPool> {
        let concurrency = concurrency.max(1);
        let mut inner = self.inner.write().await;
        let now = Instant::now();

        if let Some(existing) = inner.pools.get(&provider_id) {
            if existing.worker_count() == concurrency {
                let pool = existing.clone();
                inner.last_access.insert(provider_id, now);
                return pool;
            }

            info!(
                provider_id,
                old_concurrency = existing.worker_count(),
                new_concurrency = concurrency,
                "Provider concurrency changed, replacing pool"
            );
            existing.shutdown();
            inner.pools.remove(&provider_id);
            inner.last_access.remove(&provider_id);
            inner.created_at.remove(&provider_id);
        }

        let pool = ProviderWorkerPool::start(provider_id, concurrency, self.ctx.clone());
        inner.pools.insert(provider_id, pool.clone());
        inner.last_access.insert(provider_id, now);
        inner.created_at.insert(provider_id, now);
        pool
    }

    /// Remove a provider's pool and every piece of its bookkeeping in one
    /// step, then cancel the pool's lifetime.
    pub async fn delete(&self, provider_id: i64) -> bool {
        let mut inner = self.inner.write().await;
        let removed = inner.pools.remove(&provider_id);
        inner.last_access.remove(&provider_id);
        inner.created_at.remove(&provider_id);
        drop(inner);

        match removed {
            Some(pool) => {
                pool.shutdown();
                info!(provider_id, "Provider pool deleted");
                true
            }
            None => false,
        }
    }

    /// Evict pools that are idle past the timeout or older than the hard
    /// maximum lifetime — in both cases only once their queue is empty —
    /// and sweep any orphaned bookkeeping entries. Returns how many pools
    /// were evicted.
    pub async fn cleanup_idle(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write().await;

        let victims: Vec<i64> = inner
            .pools
            .iter()
            .filter(|(provider_id, pool)| {
                if !pool.queue_is_empty() {
                    return false;
                }
                let idle_too_long = inner
                    .last_access
                    .get(provider_id)
                    .is_none_or(|at| now.duration_since(*at) > self.idle_timeout);
                let aged_out = inner
                    .created_at
                    .get(provider_id)
                    .is_some_and(|at| now.duration_since(*at) > self.max_lifetime);
                idle_too_long || aged_out
            })
            .map(|(provider_id, _)| *provider_id)
            .collect();

        for provider_id in &victims {
            if let Some(pool) = inner.pools.remove(provider_id) {
                pool.shutdown();
                debug!(provider_id, "Evicted idle provider pool");
            }
            inner.last_access.remove(provider_id);
            inner.created_at.remove(provider_id);
        }

        // Defensive sweep: bookkeeping without a pool should not exist.
        let live: HashSet<i64> = inner.pools.keys().copied().collect();
        let orphaned_access: Vec<i64> = inner
            .last_access
            .keys()
            .filter(|id| !live.contains(id))
            .copied()
            .collect();
        for provider_id in orphaned_access {
            warn!(provider_id, "Orphaned last-access entry without a pool, removing");
            inner.last_access.remove(&provider_id);
        }
        let orphaned_created: Vec<i64> = inner
            .created_at
            .keys()
            .filter(|id| !live.contains(id))
            .copied()
            .collect();
        for provider_id in orphaned_created {
            warn!(provider_id, "Orphaned created-at entry without a pool, removing");
            inner.created_at.remove(&provider_id);
        }

        victims.len()
    }

    /// Drop pools whose provider no longer exists in the source of truth.
    pub async fn cleanup_deleted(&self, valid_provider_ids: &HashSet<i64>) -> usize {
        let mut inner = self.inner.write().await;
        let victims: Vec<i64> = inner
            .pools
            .keys()
            .filter(|id| !valid_provider_ids.contains(id))
            .copied()
            .collect();

        for provider_id in &victims {
            if let Some(pool) = inner.pools.remove(provider_id) {
                pool.shutdown();
                info!(provider_id, "Removed pool for deleted provider");
            }
            inner.last_access.remove(provider_id);
            inner.created_at.remove(provider_id);
        }

        victims.len()
    }

    pub async fn count(&self) -> usize {
        let inner = self.inner.read().await;
        inner.pools.len()
    }

    /// Shut down every pool. Shutdown support.
    pub async fn cancel_all(&self) {
        let mut inner = self.inner.write().await;
        for pool in inner.pools.values() {
            pool.shutdown();
        }
        inner.pools.clear();
        inner.last_access.clear();
        inner.created_at.clear();
    }
}
