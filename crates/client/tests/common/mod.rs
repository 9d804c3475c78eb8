//! Shared fixtures for the client integration tests.
//!
//! [`ScriptedSource`] answers status requests from a per-job script and
//! records how many requests were issued and how many overlapped.
//! [`Recorder`] captures callback invocations in order.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scanlate_client::api::{ApiError, JobStatusSource};
use scanlate_client::events::PollError;
use scanlate_client::poller::PollCallbacks;
use scanlate_core::job::{JobSnapshot, JobStatus};
use tokio::sync::Notify;

/// One scripted answer to a status request.
pub enum Step {
    /// Answer immediately.
    Reply(Result<JobSnapshot, ApiError>),
    /// Answer after a simulated network delay.
    After(Duration, Result<JobSnapshot, ApiError>),
    /// Answer once the test signals the notifier.
    Hold(Arc<Notify>, Result<JobSnapshot, ApiError>),
}

#[derive(Default)]
pub struct ScriptedSource {
    script: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<String>>,
    in_flight: Mutex<HashMap<String, usize>>,
    max_in_flight: Mutex<HashMap<String, usize>>,
}

impl ScriptedSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, job_id: &str, step: Step) {
        self.script
            .lock()
            .unwrap()
            .entry(job_id.to_string())
            .or_default()
            .push_back(step);
    }

    pub fn reply(&self, snapshot: JobSnapshot) {
        let job_id = snapshot.id.clone();
        self.push(&job_id, Step::Reply(Ok(snapshot)));
    }

    pub fn calls_for(&self, job_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == job_id)
            .count()
    }

    pub fn max_in_flight(&self, job_id: &str) -> usize {
        self.max_in_flight
            .lock()
            .unwrap()
            .get(job_id)
            .copied()
            .unwrap_or(0)
    }

    fn enter(&self, job_id: &str) -> InFlight<'_> {
        let mut in_flight = self.in_flight.lock().unwrap();
        let current = in_flight.entry(job_id.to_string()).or_default();
        *current += 1;

        let mut max = self.max_in_flight.lock().unwrap();
        let peak = max.entry(job_id.to_string()).or_default();
        *peak = (*peak).max(*current);

        InFlight {
            source: self,
            job_id: job_id.to_string(),
        }
    }
}

/// Decrements the in-flight counter even when the request future is
/// dropped half-way.
struct InFlight<'a> {
    source: &'a ScriptedSource,
    job_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(count) = self.source.in_flight.lock().unwrap().get_mut(&self.job_id) {
            *count -= 1;
        }
    }
}

#[async_trait]
impl JobStatusSource for ScriptedSource {
    async fn fetch_status(&self, job_id: &str) -> Result<JobSnapshot, ApiError> {
        self.calls.lock().unwrap().push(job_id.to_string());
        let _guard = self.enter(job_id);

        let step = self
            .script
            .lock()
            .unwrap()
            .get_mut(job_id)
            .and_then(|queue| queue.pop_front());

        match step {
            Some(Step::Reply(result)) => result,
            Some(Step::After(delay, result)) => {
                tokio::time::sleep(delay).await;
                result
            }
            Some(Step::Hold(notify, result)) => {
                notify.notified().await;
                result
            }
            None => Err(ApiError::Status {
                status: 599,
                body: format!("script exhausted for {job_id}"),
            }),
        }
    }
}

/// A callback invocation as seen by the test.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Progress(JobSnapshot),
    Complete(JobSnapshot),
    Fail(PollError),
}

#[derive(Clone, Default)]
pub struct Recorder {
    log: Arc<Mutex<Vec<Record>>>,
}

impl Recorder {
    pub fn callbacks(&self) -> PollCallbacks {
        let progress = Arc::clone(&self.log);
        let complete = Arc::clone(&self.log);
        let fail = Arc::clone(&self.log);

        PollCallbacks::new()
            .on_progress(move |s| progress.lock().unwrap().push(Record::Progress(s.clone())))
            .on_complete(move |s| complete.lock().unwrap().push(Record::Complete(s.clone())))
            .on_fail(move |e| fail.lock().unwrap().push(Record::Fail(e.clone())))
    }

    pub fn records(&self) -> Vec<Record> {
        self.log.lock().unwrap().clone()
    }

    pub fn progress_values(&self) -> Vec<i32> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                Record::Progress(s) => Some(s.progress),
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> Vec<PollError> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                Record::Fail(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    pub fn completions(&self) -> Vec<JobSnapshot> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                Record::Complete(s) => Some(s),
                _ => None,
            })
            .collect()
    }
}

pub fn snapshot(job_id: &str, status: JobStatus, progress: i32) -> JobSnapshot {
    JobSnapshot {
        id: job_id.to_string(),
        status,
        progress,
        step: format!("{status} {progress}%"),
        result: None,
        error: None,
        created_at: None,
    }
}

pub fn completed(job_id: &str) -> JobSnapshot {
    JobSnapshot {
        result: Some(serde_json::json!({
            "id": "page-1",
            "filename": "page-1.png",
            "original_url": "/uploads/page-1.png",
            "final_url": "/uploads/final_page-1.png",
            "bubbles_count": 0,
            "bubbles_data": []
        })),
        ..snapshot(job_id, JobStatus::Completed, 100)
    }
}

pub fn failed(job_id: &str, error: Option<&str>) -> JobSnapshot {
    JobSnapshot {
        error: error.map(str::to_string),
        ..snapshot(job_id, JobStatus::Failed, 30)
    }
}

pub fn transport_error() -> ApiError {
    ApiError::Status {
        status: 503,
        body: "Service Unavailable".into(),
    }
}

/// Let spawned tasks run, advancing the paused clock by a millisecond.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
