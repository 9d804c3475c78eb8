//! Job status snapshots reported by the scanlation backend.
//!
//! A [`JobSnapshot`] is one point-in-time read of `GET /jobs/{id}`. The
//! completed payload is kept as raw JSON so it can be forwarded verbatim;
//! [`JobSnapshot::processing_result`] gives a typed view when needed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::CoreError;
use crate::types::{JobId, Timestamp};

/// Fallback message when the backend marks a job failed without a reason.
pub const GENERIC_FAILURE_MESSAGE: &str = "Job failed";

/// Lifecycle state of a backend job.
///
/// Transitions are monotonic: `queued -> processing -> completed | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted but not picked up yet. The backend creates jobs as
    /// `pending`, which means the same thing.
    #[serde(alias = "pending")]
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// `true` for `completed` and `failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One read of a job's status fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    #[serde(default)]
    pub id: JobId,
    pub status: JobStatus,
    /// Percentage reported by the backend. Not guaranteed to be
    /// monotonic or in range; see [`progress_percent`](Self::progress_percent).
    #[serde(default, deserialize_with = "null_as_default")]
    pub progress: i32,
    /// Human-readable label of the current pipeline stage.
    #[serde(default, deserialize_with = "null_as_default")]
    pub step: String,
    /// Present only once the job has completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Present only once the job has failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Timestamp>,
}

impl JobSnapshot {
    /// Progress clamped to `0..=100`.
    pub fn progress_percent(&self) -> u8 {
        self.progress.clamp(0, 100) as u8
    }

    /// The failure message to surface for a failed job, falling back to
    /// [`GENERIC_FAILURE_MESSAGE`] when the backend gave none.
    pub fn failure_message(&self) -> String {
        match self.error.as_deref() {
            Some(msg) if !msg.trim().is_empty() => msg.to_string(),
            _ => GENERIC_FAILURE_MESSAGE.to_string(),
        }
    }

    /// Parse the completed payload as a [`ProcessingResult`].
    ///
    /// Returns `None` when there is no result or it has a different shape
    /// (e.g. results produced by a newer backend).
    pub fn processing_result(&self) -> Option<ProcessingResult> {
        self.result
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

/// Output of a processed comic page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub id: String,
    pub filename: String,
    pub original_url: String,
    #[serde(default)]
    pub final_url: Option<String>,
    #[serde(default)]
    pub debug_url: Option<String>,
    #[serde(default)]
    pub clean_url: Option<String>,
    #[serde(default)]
    pub clean_bubble_url: Option<String>,
    #[serde(default)]
    pub bubbles_count: u32,
    #[serde(default)]
    pub bubbles_data: Vec<Bubble>,
}

/// A detected speech bubble with its OCR text and translation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bubble {
    /// `[x1, y1, x2, y2]` in source image pixels.
    pub bbox: [f64; 4],
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub translation: String,
    #[serde(default)]
    pub clean_text: Option<String>,
    #[serde(default)]
    pub bubble_type: Option<BubbleType>,
    #[serde(default)]
    pub translation_provider: Option<String>,
    #[serde(default)]
    pub font: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BubbleType {
    Speech,
    Thought,
    Sfx,
    Caption,
}

/// Processing mode requested when submitting a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessMode {
    /// Detect, OCR, translate, clean and typeset.
    #[default]
    Full,
    /// Full pipeline with text-shaped masks and the premium translator.
    Premium,
    /// Remove text only, no translation.
    CleanOnly,
}

impl ProcessMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Premium => "premium",
            Self::CleanOnly => "clean_only",
        }
    }
}

impl fmt::Display for ProcessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "premium" => Ok(Self::Premium),
            "clean_only" => Ok(Self::CleanOnly),
            other => Err(CoreError::Validation(format!(
                "Unknown process mode '{other}' (expected full, premium or clean_only)"
            ))),
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
