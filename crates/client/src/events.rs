//! Events and terminal errors emitted by the job and batch pollers.
//!
//! Every callback invocation has a matching [`PollEvent`] published on
//! the poller's broadcast channel, so consumers can pick whichever
//! delivery style suits them.

use scanlate_core::job::JobSnapshot;
use scanlate_core::job_events::{
    EVENT_BATCH_CANCELLED, EVENT_BATCH_FAILED, EVENT_BATCH_FINISHED, EVENT_BATCH_PROGRESS,
    EVENT_JOB_CANCELLED, EVENT_JOB_COMPLETED, EVENT_JOB_FAILED, EVENT_JOB_PROGRESS,
};
use scanlate_core::types::JobId;
use serde::Serialize;

/// Display text of [`PollError::Timeout`].
pub const TIMEOUT_MESSAGE: &str = "Timeout: Max attempts reached";

/// Why a polling session ended without the job completing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PollError {
    /// The status request could not be completed.
    #[error("{message}")]
    Transport { message: String },

    /// The backend reported the job as failed.
    #[error("{message}")]
    JobFailed { message: String },

    /// The job was still running after `attempts` polls. It may yet
    /// finish server-side.
    #[error("Timeout: Max attempts reached")]
    Timeout { attempts: u32 },
}

impl PollError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// A lifecycle notification for one tracked job.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PollEvent {
    /// A status snapshot arrived (fired for every successful poll).
    Progress { job_id: JobId, snapshot: JobSnapshot },

    /// The job completed; `snapshot` carries the result payload.
    Completed { job_id: JobId, snapshot: JobSnapshot },

    /// The session ended with an error.
    Failed { job_id: JobId, error: PollError },

    /// The session was stopped or superseded by the caller.
    Cancelled { job_id: JobId },
}

impl PollEvent {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Progress { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Cancelled { job_id } => job_id,
        }
    }

    /// Well-known event name, see [`scanlate_core::job_events`].
    pub fn name(&self) -> &'static str {
        match self {
            Self::Progress { .. } => EVENT_JOB_PROGRESS,
            Self::Completed { .. } => EVENT_JOB_COMPLETED,
            Self::Failed { .. } => EVENT_JOB_FAILED,
            Self::Cancelled { .. } => EVENT_JOB_CANCELLED,
        }
    }

    /// `true` for the last event a session can emit.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}

/// Aggregate counts for a batch of jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub total: usize,
    pub completed: usize,
    /// Jobs the backend reported as failed. They no longer hold the batch
    /// open.
    pub failed: usize,
}

impl BatchProgress {
    /// Jobs that reached a terminal status.
    pub fn settled(&self) -> usize {
        self.completed + self.failed
    }

    pub fn is_settled(&self) -> bool {
        self.settled() >= self.total
    }
}

/// A lifecycle notification for a tracked batch.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    /// A polling round finished.
    Progress { progress: BatchProgress },

    /// Every job completed or failed.
    Finished { progress: BatchProgress },

    /// The batch gave up before every job settled.
    Failed {
        progress: BatchProgress,
        error: PollError,
    },

    /// The batch was stopped or superseded by the caller.
    Cancelled { progress: BatchProgress },
}

impl BatchEvent {
    pub fn progress(&self) -> BatchProgress {
        match self {
            Self::Progress { progress }
            | Self::Finished { progress }
            | Self::Failed { progress, .. }
            | Self::Cancelled { progress } => *progress,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Progress { .. } => EVENT_BATCH_PROGRESS,
            Self::Finished { .. } => EVENT_BATCH_FINISHED,
            Self::Failed { .. } => EVENT_BATCH_FAILED,
            Self::Cancelled { .. } => EVENT_BATCH_CANCELLED,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_is_distinct_from_job_failure() {
        let timeout = PollError::Timeout { attempts: 300 };
        assert_eq!(timeout.to_string(), TIMEOUT_MESSAGE);
        assert!(timeout.is_timeout());

        let failed = PollError::JobFailed {
            message: "OCR engine crashed".into(),
        };
        assert_eq!(failed.to_string(), "OCR engine crashed");
        assert!(!failed.is_timeout());
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = PollEvent::Failed {
            job_id: "job-9".into(),
            error: PollError::Timeout { attempts: 3 },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "failed");
        assert_eq!(json["job_id"], "job-9");
        assert_eq!(json["error"]["kind"], "timeout");
        assert_eq!(json["error"]["attempts"], 3);
        assert_eq!(event.name(), EVENT_JOB_FAILED);
        assert!(event.is_terminal());
    }

    #[test]
    fn batch_progress_counts_failed_jobs_as_settled() {
        let progress = BatchProgress {
            total: 3,
            completed: 2,
            failed: 1,
        };
        assert_eq!(progress.settled(), 3);
        assert!(progress.is_settled());
        assert!(!BatchProgress { failed: 0, ..progress }.is_settled());
    }

    #[test]
    fn batch_events_serialize_with_type_tag() {
        let event = BatchEvent::Finished {
            progress: BatchProgress {
                total: 4,
                completed: 4,
                failed: 0,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "finished");
        assert_eq!(json["progress"]["completed"], 4);
        assert_eq!(event.name(), EVENT_BATCH_FINISHED);
        assert!(event.is_terminal());
    }
}
