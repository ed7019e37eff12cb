//! Application-wide constants

/// Valid task types for instance lifecycle operations
pub(crate) const TASK_TYPE_CREATE: &str = "create";
pub(crate) const TASK_TYPE_START: &str = "start";
pub(crate) const TASK_TYPE_STOP: &str = "stop";
pub(crate) const TASK_TYPE_RESTART: &str = "restart";
pub(crate) const TASK_TYPE_DELETE: &str = "delete";
pub(crate) const TASK_TYPE_RESET: &str = "reset";
pub(crate) const TASK_TYPE_RESET_PASSWORD: &str = "reset-password";
pub(crate) const TASK_TYPE_CREATE_PORT_MAPPING: &str = "create-port-mapping";
pub(crate) const TASK_TYPE_DELETE_PORT_MAPPING: &str = "delete-port-mapping";

/// Cancel reason recorded for the end-user cancellation path
pub(crate) const CANCEL_REASON_USER: &str = "cancelled by user";

/// Cancel reason recorded when the sweep reclassifies a stuck `cancelling`
/// task. The engine gave up waiting for the worker to confirm; the
/// provider-side operation is not known to have stopped.
pub(crate) const CANCEL_REASON_SWEEP: &str = "cancellation confirmation timed out";

/// Per-pool queue capacity is twice the worker count, capped at this value.
pub(crate) const MAX_QUEUE_CAPACITY: usize = 100;

/// Upper bound on waiting for a caller to consume a task outcome before the
/// drain task gives up and logs.
pub(crate) const RESULT_DRAIN_WATCHDOG_SECS: u64 = 3600;
