//! Event name constants for job lifecycle notifications.
//!
//! Used by the poller when tagging emitted events and log lines.

/// A status snapshot was received for a job that is still tracked.
pub const EVENT_JOB_PROGRESS: &str = "job_progress";

/// Job completed successfully.
pub const EVENT_JOB_COMPLETED: &str = "job_completed";

/// Job failed, timed out, or its status could not be fetched.
pub const EVENT_JOB_FAILED: &str = "job_failed";

/// Tracking was stopped by the caller.
pub const EVENT_JOB_CANCELLED: &str = "job_cancelled";

/// Aggregate progress of a batch after a polling round.
pub const EVENT_BATCH_PROGRESS: &str = "batch_progress";

/// Every job in a batch has completed or failed.
pub const EVENT_BATCH_FINISHED: &str = "batch_finished";

/// A batch stopped before every job settled.
pub const EVENT_BATCH_FAILED: &str = "batch_failed";

/// Batch tracking was stopped by the caller.
pub const EVENT_BATCH_CANCELLED: &str = "batch_cancelled";
