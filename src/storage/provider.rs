//! Storage for per-provider scheduling settings.
//!
//! Providers are administered outside the engine; the scheduler only reads
//! the configured task concurrency (how many tasks may run against the
//! backend at once) and the set of live provider ids, which drives cleanup
//! of pools whose provider was deleted.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::StorageResult;
use crate::errors::StorageError;

/// Scheduling-relevant slice of a provider row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub provider_id: i64,
    /// Maximum tasks executed concurrently against this backend. `None`
    /// means the provider is serial.
    pub task_concurrency: Option<u32>,
}

impl ProviderSettings {
    /// Effective worker count: serial when unset or zero.
    pub fn effective_concurrency(&self) -> usize {
        self.task_concurrency
            .map(|c| c.max(1) as usize)
            .unwrap_or(1)
    }
}

/// Trait for provider settings storage operations.
#[async_trait]
pub trait ProviderStore: Send + Sync {
    /// Settings for one provider, `None` if the provider does not exist.
    async fn get_settings(&self, provider_id: i64) -> StorageResult<Option<ProviderSettings>>;

    /// Ids of all providers currently present in the source of truth.
    async fn list_provider_ids(&self) -> StorageResult<HashSet<i64>>;
}

/// PostgreSQL implementation of provider settings storage.
pub struct PostgresProviderStore {
    pool: Arc<PgPool>,
}

impl PostgresProviderStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Initialize the database schema for providers.
    pub async fn initialize_schema(&self) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS providers (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL,
                task_concurrency INTEGER,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::QueryFailed { source: e })?;

        Ok(())
    }
}

#[async_trait]
impl ProviderStore for PostgresProviderStore {
    async fn get_settings(&self, provider_id: i64) -> StorageResult<Option<ProviderSettings>> {
        let row: Option<(i64, Option<i32>)> =
            sqlx::query_as("SELECT id, task_concurrency FROM providers WHERE id = $1")
                .bind(provider_id)
                .fetch_optional(self.pool.as_ref())
                .await
                .map_err(|e| StorageError::QueryFailed { source: e })?;

        Ok(row.map(|(id, concurrency)| ProviderSettings {
            provider_id: id,
            task_concurrency: concurrency.and_then(|c| u32::try_from(c).ok()),
        }))
    }

    async fn list_provider_ids(&self) -> StorageResult<HashSet<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM providers")
            .fetch_all(self.pool.as_ref())
            .await
            .map_err(|e| StorageError::QueryFailed { source: e })?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

/// In-memory implementation for testing.
pub struct MemoryProviderStore {
    settings: RwLock<HashMap<i64, ProviderSettings>>,
}

impl MemoryProviderStore {
    pub fn new() -> Self {
        Self {
            settings: RwLock::new(HashMap::new()),
        }
    }

    pub async fn upsert(&self, settings: ProviderSettings) {
        let mut map = self.settings.write().await;
        map.insert(settings.provider_id, settings);
    }

    pub async fn remove(&self, provider_id: i64) {
        let mut map = self.settings.write().await;
        map.remove(&provider_id);
    }
}

impl Default for MemoryProviderStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderStore for MemoryProviderStore {
    async fn get_settings(&self, provider_id: i64) -> StorageResult<Option<ProviderSettings>> {
        let map = self.settings.read().await;
        Ok(map.get(&provider_id).cloned())
    }

    async fn list_provider_ids(&self) -> StorageResult<HashSet<i64>> {
        let map = self.settings.read().await;
        Ok(map.keys().copied().collect())
    }
}
