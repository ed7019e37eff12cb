//! Bounded registry of cancellation handles for in-flight tasks.
//!
//! Every executing task registers a [`CancellationToken`] here for the
//! duration of its execution, so the control protocol can reach into a
//! running worker and cancel it. A worker's entry is created synchronously
//! when execution begins and removed when it ends, which means a burst of
//! long-tail tasks (hung SSH sessions, stuck provider APIs) would otherwise
//! grow the registry without bound. The registry therefore enforces a hard
//! capacity with tiered eviction: entries whose token is already cancelled
//! go first, then entries past half the maximum age, then the strictly
//! oldest, selected partially rather than via a full sort.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::ContextError;

/// A live execution context for one task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: i64,
    pub token: CancellationToken,
    pub started_at: Instant,
}

/// Registry of live task contexts, bounded by capacity.
pub struct TaskContextManager {
    entries: RwLock<HashMap<i64, TaskContext>>,
    capacity: usize,
    max_age: Duration,
    live: AtomicI64,
}

impl TaskContextManager {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            max_age,
            live: AtomicI64::new(0),
        }
    }

    /// Register the context for a task that is beginning execution.
    ///
    /// At or above 80% of capacity, stale entries are evicted before the
    /// insert. At full capacity a batch of safely-evictable entries
    /// (cancelled or well past half the maximum age) is removed; if that
    /// frees nothing — every entry is fresh, live work — registration fails
    /// and the caller must fail the task.
    pub async fn add(&self, task_id: i64, token: CancellationToken) -> Result<(), ContextError> {
        let mut entries = self.entries.write().await;

        if entries.len() >= self.pressure_threshold() {
            let removed = Self::evict_stale(&mut entries, self.max_age);
            if removed > 0 {
                debug!(removed, "Evicted stale task contexts under pressure");
            }
        }

        if entries.len() >= self.capacity {
            // Only the safe tiers here: evicting fresh live contexts to make
            // room would cancel in-flight work on behalf of an unrelated
            // task. That aggressive tier belongs to the maintenance sweep.
            let removed = self.force_evict(&mut entries, false);
            warn!(
                removed,
                capacity = self.capacity,
                "Context registry at capacity, force-evicted a batch"
            );
        }

        if entries.len() >= self.capacity {
            self.live.store(entries.len() as i64, Ordering::Relaxed);
            return Err(ContextError::PoolFull {
                live: entries.len() as i64,
                capacity: self.capacity,
            });
        }

        // Replacing an entry for the same task id cancels the old handle so
        // the superseded execution cannot linger unobserved.
        if let Some(previous) = entries.insert(
            task_id,
            TaskContext {
                task_id,
                token,
                started_at: Instant::now(),
            },
        ) {
            previous.token.cancel();
        }

        self.live.store(entries.len() as i64, Ordering::Relaxed);
        Ok(())
    }

    /// Non-mutating lookup.
    pub async fn get(&self, task_id: i64) -> Option<TaskContext> {
        let entries = self.entries.read().await;
        entries.get(&task_id).cloned()
    }

    /// Cancel a task's token without removing its entry. The executing
    /// worker removes the entry itself when it unwinds.
    pub async fn cancel(&self, task_id: i64) -> bool {
        let entries = self.entries.read().await;
        match entries.get(&task_id) {
            Some(context) => {
                context.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove a task's entry and cancel its token. Idempotent: removing a
    /// missing or already-removed entry is a no-op.
    pub async fn delete(&self, task_id: i64) {
        let mut entries = self.entries.write().await;
        if let Some(context) = entries.remove(&task_id) {
            context.token.cancel();
        }
        self.live.store(entries.len() as i64, Ordering::Relaxed);
    }

    /// Bulk [`delete`](Self::delete); returns how many entries existed.
    pub async fn delete_batch(&self, task_ids: &[i64]) -> usize {
        let mut entries = self.entries.write().await;
        let mut removed = 0;
        for task_id in task_ids {
            if let Some(context) = entries.remove(task_id) {
                context.token.cancel();
                removed += 1;
            }
        }
        self.live.store(entries.len() as i64, Ordering::Relaxed);
        removed
    }

    /// Remove and cancel every entry older than the configured maximum age.
    /// Called proactively under pressure and by the periodic sweep.
    pub async fn cleanup_stale(&self) -> usize {
        let mut entries = self.entries.write().await;
        let removed = Self::evict_stale(&mut entries, self.max_age);
        self.live.store(entries.len() as i64, Ordering::Relaxed);
        removed
    }

    /// When above 80% of capacity, evict roughly 30% of entries, preferring
    /// (in order) already-cancelled contexts, entries older than half the
    /// maximum age, and finally the strictly oldest entries.
    pub async fn force_limit_size(&self) -> usize {
        let mut entries = self.entries.write().await;
        if entries.len() < self.pressure_threshold() {
            return 0;
        }
        let removed = self.force_evict(&mut entries, true);
        self.live.store(entries.len() as i64, Ordering::Relaxed);
        removed
    }

    pub fn count(&self) -> i64 {
        self.live.load(Ordering::Relaxed)
    }

    /// Cancel and drop every live context. Shutdown support.
    pub async fn cancel_all(&self) {
        let mut entries = self.entries.write().await;
        for context in entries.values() {
            context.token.cancel();
        }
        entries.clear();
        self.live.store(0, Ordering::Relaxed);
    }

    fn pressure_threshold(&self) -> usize {
        (self.capacity * 4 / 5).max(1)
    }

    fn evict_stale(entries: &mut HashMap<i64, TaskContext>, max_age: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<i64> = entries
            .values()
            .filter(|c| now.duration_since(c.started_at) > max_age)
            .map(|c| c.task_id)
            .collect();
        for task_id in &stale {
            if let Some(context) = entries.remove(task_id) {
                context.token.cancel();
            }
        }
        stale.len()
    }

    fn force_evict(&self, entries: &mut HashMap<i64, TaskContext>, evict_fresh: bool) -> usize {
        let target = (self.capacity * 3 / 10).max(1);
        let now = Instant::now();
        let half_age = self.max_age / 2;

        let mut victims: Vec<i64> = Vec::with_capacity(target);

        // Tier 1: contexts that are already cancelled are free to drop.
        for context in entries.values() {
            if victims.len() >= target {
                break;
            }
            if context.token.is_cancelled() {
                victims.push(context.task_id);
            }
        }

        // Tier 2: entries past half the maximum age.
        if victims.len() < target {
            for context in entries.values() {
                if victims.len() >= target {
                    break;
                }
                if !context.token.is_cancelled() && now.duration_since(context.started_at) > half_age
                {
                    victims.push(context.task_id);
                }
            }
        }

        // Tier 3: strictly oldest remaining, via partial selection.
        if evict_fresh && victims.len() < target {
            let need = target - victims.len();
            let mut remaining: Vec<(Instant, i64)> = entries
                .values()
                .filter(|c| !victims.contains(&c.task_id))
                .map(|c| (c.started_at, c.task_id))
                .collect();
            if remaining.len() > need {
                remaining.select_nth_unstable_by_key(need - 1, |(started_at, _)| *started_at);
                remaining.truncate(need);
            }
            victims.extend(remaining.into_iter().map(|(_, task_id)| task_id));
        }

        for task_id in &victims {
            if let Some(context) = entries.remove(task_id) {
                context.token.cancel();
            }
        }
        victims.len()
    }
}
