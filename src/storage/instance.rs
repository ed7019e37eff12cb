//! Storage for managed instance status.
//!
//! The engine does not manage instances; it only needs a conditional status
//! update for post-cancellation compensation (a cancelled `delete` task must
//! move its instance out of `deleting`, since the underlying deletion may or
//! may not have progressed).

use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::StorageResult;
use crate::errors::StorageError;

/// Trait for instance status storage operations.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Set the instance status only if it currently equals `from`; returns
    /// the number of rows affected.
    async fn update_status_where(
        &self,
        instance_id: i64,
        from: &str,
        to: &str,
    ) -> StorageResult<u64>;

    async fn get_status(&self, instance_id: i64) -> StorageResult<Option<String>>;
}

/// PostgreSQL implementation of instance status storage.
pub struct PostgresInstanceStore {
    pool: Arc<PgPool>,
}

impl PostgresInstanceStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Initialize the database schema for instances.
    pub async fn initialize_schema(&self) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                id BIGSERIAL PRIMARY KEY,
                provider_id BIGINT,
                status TEXT NOT NULL DEFAULT 'stopped',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
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
impl InstanceStore for PostgresInstanceStore {
    async fn update_status_where(
        &self,
        instance_id: i64,
        from: &str,
        to: &str,
    ) -> StorageResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE instances
            SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(instance_id)
        .bind(from)
        .bind(to)
        .execute(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::QueryFailed { source: e })?;

        Ok(result.rows_affected())
    }

    async fn get_status(&self, instance_id: i64) -> StorageResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT status FROM instances WHERE id = $1")
            .bind(instance_id)
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(|e| StorageError::QueryFailed { source: e })?;

        Ok(row.map(|(status,)| status))
    }
}

/// In-memory implementation for testing.
pub struct MemoryInstanceStore {
    statuses: RwLock<HashMap<i64, String>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self {
            statuses: RwLock::new(HashMap::new()),
        }
    }

    pub async fn set_status(&self, instance_id: i64, status: impl Into<String>) {
        let mut map = self.statuses.write().await;
        map.insert(instance_id, status.into());
    }
}

impl Default for MemoryInstanceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn update_status_where(
        &self,
        instance_id: i64,
        from: &str,
        to: &str,
    ) -> StorageResult<u64> {
        let mut map = self.statuses.write().await;
        match map.get_mut(&instance_id) {
            Some(status) if status == from => {
                *status = to.to_string();
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn get_status(&self, instance_id: i64) -> StorageResult<Option<String>> {
        let map = self.statuses.read().await;
        Ok(map.get(&instance_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_conditional_status_update() {
        let store = MemoryInstanceStore::new();
        store.set_status(5, "deleting").await;

        assert_eq!(store.update_status_where(5, "deleting", "stopped").await.unwrap(), 1);
        assert_eq!(store.get_status(5).await.unwrap().as_deref(), Some("stopped"));

        // Guard no longer matches.
        assert_eq!(store.update_status_where(5, "deleting", "stopped").await.unwrap(), 0);
        // Unknown instance is a no-op.
        assert_eq!(store.update_status_where(6, "deleting", "stopped").await.unwrap(), 0);
    }
}
