use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error-provisor-config-1 Required environment variable not set: {var_name}")]
    EnvVarRequired { var_name: String },

    #[error("error-provisor-config-2 Invalid numeric value: {details}")]
    InvalidNumber { details: String },

    #[error("error-provisor-config-3 Invalid duration value: {value}")]
    InvalidDuration { value: String },

    #[error("error-provisor-config-4 Invalid metrics configuration: {details}")]
    InvalidMetrics { details: String },
}

#[derive(Error, Debug)]
pub enum ContextError {
    #[error(
        "error-provisor-context-1 Context registry full: {live} live entries at capacity {capacity}"
    )]
    PoolFull { live: i64, capacity: usize },
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("error-provisor-pool-1 Enqueue timed out after {seconds}s: provider {provider_id}")]
    EnqueueTimeout { provider_id: i64, seconds: u64 },

    #[error("error-provisor-pool-2 Queue closed: provider {provider_id}")]
    QueueClosed { provider_id: i64 },

    #[error("error-provisor-pool-3 Queue full: provider {provider_id}, capacity {capacity}")]
    QueueFull { provider_id: i64, capacity: usize },
}

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("error-provisor-task-1 Task not found: {task_id}")]
    NotFound { task_id: i64 },

    #[error("error-provisor-task-2 Task state already changed: {task_id} is {status}")]
    StateAlreadyChanged { task_id: i64, status: String },

    #[error("error-provisor-task-3 Task {task_id} is not stoppable by its owner")]
    NotForceStoppable { task_id: i64 },

    #[error("error-provisor-task-4 Unknown task type: {task_type}")]
    UnknownTaskType { task_type: String },

    #[error("error-provisor-task-5 Task {task_id} does not belong to user {user_id}")]
    NotOwner { task_id: i64, user_id: i64 },

    #[error("error-provisor-task-6 Scheduling failed: {source}")]
    Scheduling {
        #[from]
        source: PoolError,
    },

    #[error("error-provisor-task-7 Storage operation failed: {source}")]
    Storage {
        #[from]
        source: StorageError,
    },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("error-provisor-storage-1 Database connection failed: {source}")]
    ConnectionFailed {
        #[source]
        source: sqlx::Error,
    },

    #[error("error-provisor-storage-2 Transaction failed: {source}")]
    TransactionFailed {
        #[source]
        source: sqlx::Error,
    },

    #[error("error-provisor-storage-3 Query execution failed: {source}")]
    QueryFailed {
        #[source]
        source: sqlx::Error,
    },

    #[error("error-provisor-storage-4 Invalid stored data: {details}")]
    InvalidData { details: String },
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("error-provisor-metrics-1 Failed to create metrics publisher: {0}")]
    CreationFailed(String),

    #[error("error-provisor-metrics-2 Invalid metrics configuration: {0}")]
    InvalidConfig(String),
}
