//! Task persistence: the task row model, the store contract the scheduler
//! depends on, and PostgreSQL plus in-memory implementations.
//!
//! The single primitive the scheduler's correctness rests on is
//! [`TaskStore::update_where_status`]: a conditional update that only applies
//! when the row still holds the expected status, reporting how many rows were
//! affected. Every state transition in the engine goes through it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;

use super::StorageResult;
use crate::constants;
use crate::errors::StorageError;

/// Instance lifecycle operation a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    Create,
    Start,
    Stop,
    Restart,
    Delete,
    Reset,
    ResetPassword,
    CreatePortMapping,
    DeletePortMapping,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Create => constants::TASK_TYPE_CREATE,
            TaskType::Start => constants::TASK_TYPE_START,
            TaskType::Stop => constants::TASK_TYPE_STOP,
            TaskType::Restart => constants::TASK_TYPE_RESTART,
            TaskType::Delete => constants::TASK_TYPE_DELETE,
            TaskType::Reset => constants::TASK_TYPE_RESET,
            TaskType::ResetPassword => constants::TASK_TYPE_RESET_PASSWORD,
            TaskType::CreatePortMapping => constants::TASK_TYPE_CREATE_PORT_MAPPING,
            TaskType::DeletePortMapping => constants::TASK_TYPE_DELETE_PORT_MAPPING,
        }
    }

    /// Hard execution ceiling applied when the caller does not supply one.
    pub fn default_timeout_secs(&self) -> i64 {
        match self {
            TaskType::Create => 1800,
            TaskType::Start => 300,
            TaskType::Stop => 300,
            TaskType::Restart => 600,
            TaskType::Delete => 600,
            TaskType::Reset => 900,
            TaskType::ResetPassword => 300,
            TaskType::CreatePortMapping => 180,
            TaskType::DeletePortMapping => 180,
        }
    }

    /// Baseline duration estimate used for queue position / ETA reporting.
    /// Never used for execution control.
    pub fn base_estimate_secs(&self) -> i64 {
        match self {
            TaskType::Create => 300,
            TaskType::Start => 60,
            TaskType::Stop => 45,
            TaskType::Restart => 120,
            TaskType::Delete => 90,
            TaskType::Reset => 240,
            TaskType::ResetPassword => 30,
            TaskType::CreatePortMapping => 15,
            TaskType::DeletePortMapping => 15,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for TaskType {
    type Error = StorageError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            constants::TASK_TYPE_CREATE => Ok(TaskType::Create),
            constants::TASK_TYPE_START => Ok(TaskType::Start),
            constants::TASK_TYPE_STOP => Ok(TaskType::Stop),
            constants::TASK_TYPE_RESTART => Ok(TaskType::Restart),
            constants::TASK_TYPE_DELETE => Ok(TaskType::Delete),
            constants::TASK_TYPE_RESET => Ok(TaskType::Reset),
            constants::TASK_TYPE_CREATE_PORT_MAPPING => Ok(TaskType::CreatePortMapping),
            constants::TASK_TYPE_DELETE_PORT_MAPPING => Ok(TaskType::DeletePortMapping),
            constants::TASK_TYPE_RESET_PASSWORD => Ok(TaskType::ResetPassword),
            other => Err(StorageError::InvalidData {
                details: format!("Unknown task type: {}", other),
            }),
        }
    }
}

/// Task lifecycle state.
///
/// Transitions only move forward: `pending -> running -> {completed, failed}`,
/// `pending -> cancelled`, `running -> cancelling -> cancelled`,
/// `running -> timeout`. Terminal states never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Cancelling => "cancelling",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Pending => matches!(
                next,
                TaskStatus::Running | TaskStatus::Cancelled | TaskStatus::Failed
            ),
            TaskStatus::Running => matches!(
                next,
                TaskStatus::Completed
                    | TaskStatus::Failed
                    | TaskStatus::Cancelling
                    | TaskStatus::Cancelled
                    | TaskStatus::Timeout
            ),
            TaskStatus::Cancelling => matches!(
                next,
                TaskStatus::Cancelled | TaskStatus::Completed | TaskStatus::Failed
            ),
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for TaskStatus {
    type Error = StorageError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "cancelling" => Ok(TaskStatus::Cancelling),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            "timeout" => Ok(TaskStatus::Timeout),
            other => Err(StorageError::InvalidData {
                details: format!("Unknown task status: {}", other),
            }),
        }
    }
}

/// A persisted lifecycle task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub user_id: i64,
    pub provider_id: Option<i64>,
    pub instance_id: Option<i64>,
    pub task_type: TaskType,
    pub status: TaskStatus,
    /// Opaque serialized parameters, interpreted only by the executor for
    /// this task type.
    pub task_data: String,
    /// Hard execution ceiling in seconds, measured from the moment a worker
    /// begins execution.
    pub timeout_duration: i64,
    /// Duration estimate in seconds, used only for ETA reporting.
    pub estimated_duration: i64,
    pub progress: i32,
    pub status_message: Option<String>,
    pub error_message: Option<String>,
    pub cancel_reason: Option<String>,
    /// Whether the owning end-user (as opposed to an administrator) may
    /// cancel this task.
    pub is_force_stoppable: bool,
    pub result_data: Option<serde_json::Value>,
    pub preallocated_cpu: i32,
    pub preallocated_memory_mb: i64,
    pub preallocated_disk_gb: i64,
    pub preallocated_bandwidth_mbps: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields supplied when creating a task. The store assigns the id and
/// timestamps; new tasks always start in `pending`.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub user_id: i64,
    pub provider_id: Option<i64>,
    pub instance_id: Option<i64>,
    pub task_type: TaskType,
    pub task_data: String,
    pub timeout_duration: i64,
    pub estimated_duration: i64,
    pub is_force_stoppable: bool,
    pub preallocated_cpu: i32,
    pub preallocated_memory_mb: i64,
    pub preallocated_disk_gb: i64,
    pub preallocated_bandwidth_mbps: i64,
}

impl NewTask {
    pub fn new(user_id: i64, task_type: TaskType, task_data: impl Into<String>) -> Self {
        Self {
            user_id,
            provider_id: None,
            instance_id: None,
            task_type,
            task_data: task_data.into(),
            timeout_duration: task_type.default_timeout_secs(),
            estimated_duration: task_type.base_estimate_secs(),
            is_force_stoppable: true,
            preallocated_cpu: 0,
            preallocated_memory_mb: 0,
            preallocated_disk_gb: 0,
            preallocated_bandwidth_mbps: 0,
        }
    }
}

/// Partial update applied by [`TaskStore::update_where_status`].
///
/// Only `Some` fields are written; `updated_at` is always refreshed.
#[derive(Debug, Clone, Default)]
pub struct TaskChanges {
    pub status: Option<TaskStatus>,
    pub progress: Option<i32>,
    pub status_message: Option<String>,
    pub error_message: Option<String>,
    pub cancel_reason: Option<String>,
    pub result_data: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskChanges {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_cancel_reason(mut self, reason: impl Into<String>) -> Self {
        self.cancel_reason = Some(reason.into());
        self
    }

    pub fn with_result_data(mut self, data: serde_json::Value) -> Self {
        self.result_data = Some(data);
        self
    }

    pub fn with_started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn with_completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    fn apply(&self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(progress) = self.progress {
            task.progress = progress;
        }
        if let Some(message) = &self.status_message {
            task.status_message = Some(message.clone());
        }
        if let Some(message) = &self.error_message {
            task.error_message = Some(message.clone());
        }
        if let Some(reason) = &self.cancel_reason {
            task.cancel_reason = Some(reason.clone());
        }
        if let Some(data) = &self.result_data {
            task.result_data = Some(data.clone());
        }
        if let Some(at) = self.started_at {
            task.started_at = Some(at);
        }
        if let Some(at) = self.completed_at {
            task.completed_at = Some(at);
        }
        task.updated_at = Utc::now();
    }
}

/// Filter for task listings. `None` fields do not constrain the result.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub provider_id: Option<i64>,
    pub instance_id: Option<i64>,
    pub user_id: Option<i64>,
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Store contract for tasks.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task in `pending` and return it with its assigned id.
    async fn create_task(&self, new_task: NewTask) -> StorageResult<Task>;

    async fn first_by_id(&self, task_id: i64) -> StorageResult<Option<Task>>;

    /// Apply `changes` only if the row's status is still `from`, under a row
    /// lock, and return the number of rows affected (0 or 1). A zero result
    /// means another actor transitioned the task first.
    async fn update_where_status(
        &self,
        task_id: i64,
        from: TaskStatus,
        changes: TaskChanges,
    ) -> StorageResult<u64>;

    /// Unconditional observability update for in-flight progress reporting.
    async fn update_progress(
        &self,
        task_id: i64,
        progress: i32,
        status_message: Option<String>,
    ) -> StorageResult<()>;

    /// List tasks matching the filter, oldest first.
    async fn list_tasks(&self, filter: &TaskFilter) -> StorageResult<Vec<Task>>;

    /// Aggregate count of tasks per status, optionally scoped to a provider.
    async fn count_by_status(
        &self,
        provider_id: Option<i64>,
    ) -> StorageResult<HashMap<TaskStatus, i64>>;

    /// Tasks sitting in `status` whose `updated_at` is older than the given
    /// instant. Used by the periodic sweep to reclassify stuck work.
    async fn tasks_stuck_in(
        &self,
        status: TaskStatus,
        older_than: DateTime<Utc>,
    ) -> StorageResult<Vec<Task>>;
}

/// PostgreSQL implementation of the task store.
pub struct PostgresTaskStore {
    pool: Arc<PgPool>,
}

impl PostgresTaskStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Initialize the database schema for tasks.
    pub async fn initialize_schema(&self) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id BIGSERIAL PRIMARY KEY,
                user_id BIGINT NOT NULL,
                provider_id BIGINT,
                instance_id BIGINT,
                task_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                task_data TEXT NOT NULL DEFAULT '',
                timeout_duration BIGINT NOT NULL,
                estimated_duration BIGINT NOT NULL,
                progress INTEGER NOT NULL DEFAULT 0,
                status_message TEXT,
                error_message TEXT,
                cancel_reason TEXT,
                is_force_stoppable BOOLEAN NOT NULL DEFAULT true,
                result_data JSONB,
                preallocated_cpu INTEGER NOT NULL DEFAULT 0,
                preallocated_memory_mb BIGINT NOT NULL DEFAULT 0,
                preallocated_disk_gb BIGINT NOT NULL DEFAULT 0,
                preallocated_bandwidth_mbps BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::QueryFailed { source: e })?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_tasks_provider_status
            ON tasks (provider_id, status)
            "#,
        )
        .execute(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::QueryFailed { source: e })?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_tasks_status_updated
            ON tasks (status, updated_at)
            "#,
        )
        .execute(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::QueryFailed { source: e })?;

        Ok(())
    }
}

const TASK_COLUMNS: &str = "id, user_id, provider_id, instance_id, task_type, status, task_data, \
     timeout_duration, estimated_duration, progress, status_message, error_message, \
     cancel_reason, is_force_stoppable, result_data, preallocated_cpu, preallocated_memory_mb, \
     preallocated_disk_gb, preallocated_bandwidth_mbps, created_at, updated_at, started_at, \
     completed_at";

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn create_task(&self, new_task: NewTask) -> StorageResult<Task> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            INSERT INTO tasks (
                user_id, provider_id, instance_id, task_type, status, task_data,
                timeout_duration, estimated_duration, is_force_stoppable,
                preallocated_cpu, preallocated_memory_mb, preallocated_disk_gb,
                preallocated_bandwidth_mbps
            )
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(new_task.user_id)
        .bind(new_task.provider_id)
        .bind(new_task.instance_id)
        .bind(new_task.task_type.as_str())
        .bind(&new_task.task_data)
        .bind(new_task.timeout_duration)
        .bind(new_task.estimated_duration)
        .bind(new_task.is_force_stoppable)
        .bind(new_task.preallocated_cpu)
        .bind(new_task.preallocated_memory_mb)
        .bind(new_task.preallocated_disk_gb)
        .bind(new_task.preallocated_bandwidth_mbps)
        .fetch_one(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::QueryFailed { source: e })?;

        row.try_into()
    }

    async fn first_by_id(&self, task_id: i64) -> StorageResult<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"
        ))
        .bind(task_id)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::QueryFailed { source: e })?;

        row.map(TryInto::try_into).transpose()
    }

    async fn update_where_status(
        &self,
        task_id: i64,
        from: TaskStatus,
        changes: TaskChanges,
    ) -> StorageResult<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::TransactionFailed { source: e })?;

        // Row lock so the status check and the guarded update observe the
        // same row version even under concurrent claimers.
        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM tasks WHERE id = $1 FOR UPDATE")
                .bind(task_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| StorageError::QueryFailed { source: e })?;

        match current {
            Some((status,)) if status == from.as_str() => {}
            _ => {
                tx.rollback()
                    .await
                    .map_err(|e| StorageError::TransactionFailed { source: e })?;
                return Ok(0);
            }
        }

        let mut builder =
            sqlx::QueryBuilder::<sqlx::Postgres>::new("UPDATE tasks SET updated_at = NOW()");
        if let Some(status) = changes.status {
            builder.push(", status = ").push_bind(status.as_str());
        }
        if let Some(progress) = changes.progress {
            builder.push(", progress = ").push_bind(progress);
        }
        if let Some(message) = changes.status_message {
            builder.push(", status_message = ").push_bind(message);
        }
        if let Some(message) = changes.error_message {
            builder.push(", error_message = ").push_bind(message);
        }
        if let Some(reason) = changes.cancel_reason {
            builder.push(", cancel_reason = ").push_bind(reason);
        }
        if let Some(data) = changes.result_data {
            builder.push(", result_data = ").push_bind(data);
        }
        if let Some(at) = changes.started_at {
            builder.push(", started_at = ").push_bind(at);
        }
        if let Some(at) = changes.completed_at {
            builder.push(", completed_at = ").push_bind(at);
        }
        builder.push(" WHERE id = ").push_bind(task_id);
        builder.push(" AND status = ").push_bind(from.as_str());

        let affected = builder
            .build()
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::QueryFailed { source: e })?
            .rows_affected();

        tx.commit()
            .await
            .map_err(|e| StorageError::TransactionFailed { source: e })?;

        Ok(affected)
    }

    async fn update_progress(
        &self,
        task_id: i64,
        progress: i32,
        status_message: Option<String>,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET progress = $2,
                status_message = COALESCE($3, status_message),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(progress)
        .bind(status_message)
        .execute(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::QueryFailed { source: e })?;

        Ok(())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> StorageResult<Vec<Task>> {
        let mut builder = sqlx::QueryBuilder::<sqlx::Postgres>::new(format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE 1 = 1"
        ));
        if let Some(provider_id) = filter.provider_id {
            builder.push(" AND provider_id = ").push_bind(provider_id);
        }
        if let Some(instance_id) = filter.instance_id {
            builder.push(" AND instance_id = ").push_bind(instance_id);
        }
        if let Some(user_id) = filter.user_id {
            builder.push(" AND user_id = ").push_bind(user_id);
        }
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(task_type) = filter.task_type {
            builder.push(" AND task_type = ").push_bind(task_type.as_str());
        }
        builder.push(" ORDER BY created_at ASC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }
        if let Some(offset) = filter.offset {
            builder.push(" OFFSET ").push_bind(offset as i64);
        }

        let rows: Vec<TaskRow> = builder
            .build_query_as()
            .fetch_all(self.pool.as_ref())
            .await
            .map_err(|e| StorageError::QueryFailed { source: e })?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn count_by_status(
        &self,
        provider_id: Option<i64>,
    ) -> StorageResult<HashMap<TaskStatus, i64>> {
        let rows: Vec<(String, i64)> = if let Some(provider_id) = provider_id {
            sqlx::query_as(
                "SELECT status, COUNT(*) FROM tasks WHERE provider_id = $1 GROUP BY status",
            )
            .bind(provider_id)
            .fetch_all(self.pool.as_ref())
            .await
        } else {
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(self.pool.as_ref())
                .await
        }
        .map_err(|e| StorageError::QueryFailed { source: e })?;

        let mut counts = HashMap::new();
        for (status, count) in rows {
            counts.insert(TaskStatus::try_from(status.as_str())?, count);
        }
        Ok(counts)
    }

    async fn tasks_stuck_in(
        &self,
        status: TaskStatus,
        older_than: DateTime<Utc>,
    ) -> StorageResult<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM tasks
            WHERE status = $1 AND updated_at < $2
            ORDER BY updated_at ASC
            "#
        ))
        .bind(status.as_str())
        .bind(older_than)
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::QueryFailed { source: e })?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

// Helper struct for database queries
#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: i64,
    user_id: i64,
    provider_id: Option<i64>,
    instance_id: Option<i64>,
    task_type: String,
    status: String,
    task_data: String,
    timeout_duration: i64,
    estimated_duration: i64,
    progress: i32,
    status_message: Option<String>,
    error_message: Option<String>,
    cancel_reason: Option<String>,
    is_force_stoppable: bool,
    result_data: Option<serde_json::Value>,
    preallocated_cpu: i32,
    preallocated_memory_mb: i64,
    preallocated_disk_gb: i64,
    preallocated_bandwidth_mbps: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for Task {
    type Error = StorageError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            id: row.id,
            user_id: row.user_id,
            provider_id: row.provider_id,
            instance_id: row.instance_id,
            task_type: TaskType::try_from(row.task_type.as_str())?,
            status: TaskStatus::try_from(row.status.as_str())?,
            task_data: row.task_data,
            timeout_duration: row.timeout_duration,
            estimated_duration: row.estimated_duration,
            progress: row.progress,
            status_message: row.status_message,
            error_message: row.error_message,
            cancel_reason: row.cancel_reason,
            is_force_stoppable: row.is_force_stoppable,
            result_data: row.result_data,
            preallocated_cpu: row.preallocated_cpu,
            preallocated_memory_mb: row.preallocated_memory_mb,
            preallocated_disk_gb: row.preallocated_disk_gb,
            preallocated_bandwidth_mbps: row.preallocated_bandwidth_mbps,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

/// In-memory implementation, used by tests and single-node development.
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<i64, Task>>,
    next_id: AtomicI64,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create_task(&self, new_task: NewTask) -> StorageResult<Task> {
        let now = Utc::now();
        let task = Task {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            user_id: new_task.user_id,
            provider_id: new_task.provider_id,
            instance_id: new_task.instance_id,
            task_type: new_task.task_type,
            status: TaskStatus::Pending,
            task_data: new_task.task_data,
            timeout_duration: new_task.timeout_duration,
            estimated_duration: new_task.estimated_duration,
            progress: 0,
            status_message: None,
            error_message: None,
            cancel_reason: None,
            is_force_stoppable: new_task.is_force_stoppable,
            result_data: None,
            preallocated_cpu: new_task.preallocated_cpu,
            preallocated_memory_mb: new_task.preallocated_memory_mb,
            preallocated_disk_gb: new_task.preallocated_disk_gb,
            preallocated_bandwidth_mbps: new_task.preallocated_bandwidth_mbps,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };

        let mut tasks = self.tasks.write().await;
        tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn first_by_id(&self, task_id: i64) -> StorageResult<Option<Task>> {
        let tasks = self.tasks.read().await;
        Ok(tasks.get(&task_id).cloned())
    }

    async fn update_where_status(
        &self,
        task_id: i64,
        from: TaskStatus,
        changes: TaskChanges,
    ) -> StorageResult<u64> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&task_id) {
            Some(task) if task.status == from => {
                changes.apply(task);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn update_progress(
        &self,
        task_id: i64,
        progress: i32,
        status_message: Option<String>,
    ) -> StorageResult<()> {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(&task_id) {
            task.progress = progress;
            if status_message.is_some() {
                task.status_message = status_message;
            }
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> StorageResult<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut matched: Vec<Task> = tasks
            .values()
            .filter(|t| filter.provider_id.is_none_or(|p| t.provider_id == Some(p)))
            .filter(|t| filter.instance_id.is_none_or(|i| t.instance_id == Some(i)))
            .filter(|t| filter.user_id.is_none_or(|u| t.user_id == u))
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .filter(|t| filter.task_type.is_none_or(|ty| t.task_type == ty))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let offset = filter.offset.unwrap_or(0);
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    async fn count_by_status(
        &self,
        provider_id: Option<i64>,
    ) -> StorageResult<HashMap<TaskStatus, i64>> {
        let tasks = self.tasks.read().await;
        let mut counts = HashMap::new();
        for task in tasks.values() {
            if provider_id.is_none_or(|p| task.provider_id == Some(p)) {
                *counts.entry(task.status).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn tasks_stuck_in(
        &self,
        status: TaskStatus,
        older_than: DateTime<Utc>,
    ) -> StorageResult<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut matched: Vec<Task> = tasks
            .values()
            .filter(|t| t.status == status && t.updated_at < older_than)
            .cloned()
            .collect();
        matched.sort_by_key(|t| t.updated_at);
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_defaults() {
        assert_eq!(TaskType::Start.default_timeout_secs(), 300);
        assert_eq!(TaskType::Create.default_timeout_secs(), 1800);
        assert_eq!(TaskType::ResetPassword.as_str(), "reset-password");
        assert_eq!(
            TaskType::try_from("create-port-mapping").unwrap(),
            TaskType::CreatePortMapping
        );
        assert!(TaskType::try_from("defenestrate").is_err());
    }

    #[test]
    fn test_status_state_machine() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Cancelling));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Timeout));
        assert!(TaskStatus::Cancelling.can_transition_to(TaskStatus::Cancelled));

        // Terminal states never move again.
        for terminal in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::Timeout,
        ] {
            assert!(terminal.is_terminal());
            for next in [
                TaskStatus::Pending,
                TaskStatus::Running,
                TaskStatus::Cancelling,
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
                TaskStatus::Timeout,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }

        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Cancelling.can_transition_to(TaskStatus::Running));
    }

    #[tokio::test]
    async fn test_memory_store_create_and_get() {
        let store = MemoryTaskStore::new();
        let task = store
            .create_task(NewTask::new(7, TaskType::Start, "{}"))
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.timeout_duration, 300);
        assert_eq!(task.progress, 0);

        let loaded = store.first_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.user_id, 7);
        assert!(store.first_by_id(9999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conditional_update_guards_status() {
        let store = MemoryTaskStore::new();
        let task = store
            .create_task(NewTask::new(1, TaskType::Stop, "{}"))
            .await
            .unwrap();

        let affected = store
            .update_where_status(
                task.id,
                TaskStatus::Pending,
                TaskChanges::status(TaskStatus::Running).with_started_at(Utc::now()),
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);

        // Second claim from pending fails: the row is no longer pending.
        let affected = store
            .update_where_status(
                task.id,
                TaskStatus::Pending,
                TaskChanges::status(TaskStatus::Running),
            )
            .await
            .unwrap();
        assert_eq!(affected, 0);

        let loaded = store.first_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Running);
        assert!(loaded.started_at.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_claims_single_winner() {
        let store = Arc::new(MemoryTaskStore::new());
        let task = store
            .create_task(NewTask::new(1, TaskType::Restart, "{}"))
            .await
            .unwrap();

        let mut handles = vec![];
        for _ in 0..8 {
            let store = store.clone();
            let task_id = task.id;
            handles.push(tokio::spawn(async move {
                store
                    .update_where_status(
                        task_id,
                        TaskStatus::Pending,
                        TaskChanges::status(TaskStatus::Running),
                    )
                    .await
                    .unwrap()
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_list_tasks_filtering_and_order() {
        let store = MemoryTaskStore::new();
        let mut a = NewTask::new(1, TaskType::Create, "{}");
        a.provider_id = Some(10);
        let mut b = NewTask::new(2, TaskType::Start, "{}");
        b.provider_id = Some(10);
        let mut c = NewTask::new(1, TaskType::Start, "{}");
        c.provider_id = Some(11);
        let a = store.create_task(a).await.unwrap();
        let b = store.create_task(b).await.unwrap();
        store.create_task(c).await.unwrap();

        let filter = TaskFilter {
            provider_id: Some(10),
            ..Default::default()
        };
        let listed = store.list_tasks(&filter).await.unwrap();
        assert_eq!(
            listed.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![a.id, b.id]
        );

        let filter = TaskFilter {
            user_id: Some(1),
            task_type: Some(TaskType::Start),
            ..Default::default()
        };
        assert_eq!(store.list_tasks(&filter).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stuck_task_scan() {
        let store = MemoryTaskStore::new();
        let task = store
            .create_task(NewTask::new(1, TaskType::Delete, "{}"))
            .await
            .unwrap();
        store
            .update_where_status(
                task.id,
                TaskStatus::Pending,
                TaskChanges::status(TaskStatus::Running),
            )
            .await
            .unwrap();

        let stuck = store
            .tasks_stuck_in(TaskStatus::Running, Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(stuck.len(), 1);

        let stuck = store
            .tasks_stuck_in(TaskStatus::Running, Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(stuck.is_empty());
    }
}
