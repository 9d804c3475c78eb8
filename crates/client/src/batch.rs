//! Aggregate tracking for a batch of jobs submitted together.
//!
//! [`BatchPoller`] polls every job of a batch in rounds: each round asks
//! for the status of every job that has not settled yet, one request at a
//! time, then reports `completed / total` and sleeps for the configured
//! interval. A job settles when the backend reports it `completed` or
//! `failed`; a failed job never ends the batch early. Transport errors for
//! individual jobs are logged and the job is asked again next round.
//!
//! The batch finishes once every job has settled, or fails with
//! [`PollError::Timeout`] after `max_attempts` rounds. Cancellation and
//! stale-result protection work the same way as in
//! [`JobPoller`](crate::poller::JobPoller).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use scanlate_core::error::CoreError;
use scanlate_core::job::{JobSnapshot, JobStatus};
use scanlate_core::types::JobId;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, JobStatusSource};
use crate::config::PollingConfig;
use crate::events::{BatchEvent, BatchProgress, PollError};
use crate::poller::{
    invoke_callback, FailCallback, Next, PendingAttempt, PollerError, EVENT_CHANNEL_CAPACITY,
    SHUTDOWN_TIMEOUT,
};

type ProgressCallback = Box<dyn Fn(&BatchProgress) + Send + Sync>;

/// Lifecycle callbacks for a [`BatchPoller`].
#[derive(Default)]
pub struct BatchCallbacks {
    on_progress: Option<ProgressCallback>,
    on_finish: Option<ProgressCallback>,
    on_fail: Option<FailCallback>,
}

impl BatchCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called after every polling round, including the last one.
    pub fn on_progress(mut self, f: impl Fn(&BatchProgress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    /// Called once when every job has completed or failed.
    pub fn on_finish(mut self, f: impl Fn(&BatchProgress) + Send + Sync + 'static) -> Self {
        self.on_finish = Some(Box::new(f));
        self
    }

    /// Called once when the batch gives up.
    pub fn on_fail(mut self, f: impl Fn(&PollError) + Send + Sync + 'static) -> Self {
        self.on_fail = Some(Box::new(f));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Polling,
    /// Every job completed or failed.
    Finished,
    TimedOut,
    Cancelled,
}

impl BatchState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Idle | Self::Polling)
    }
}

/// Where a single job of the batch stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Pending,
    Completed,
    Failed,
}

/// Tracks a set of backend jobs until all of them have settled.
///
/// Dropping the poller stops any active batch.
pub struct BatchPoller {
    shared: Arc<Shared>,
}

struct Shared {
    source: Arc<dyn JobStatusSource>,
    config: PollingConfig,
    callbacks: BatchCallbacks,
    event_tx: broadcast::Sender<BatchEvent>,
    session: Mutex<Session>,
}

struct TrackedJob {
    id: JobId,
    outcome: JobOutcome,
    last_snapshot: Option<JobSnapshot>,
}

struct Session {
    generation: u64,
    jobs: Vec<TrackedJob>,
    state: BatchState,
    rounds: u32,
    last_error: Option<PollError>,
    pending: Option<PendingAttempt>,
}

impl Session {
    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.state == BatchState::Polling
    }

    fn progress(&self) -> BatchProgress {
        let count = |outcome: JobOutcome| {
            self.jobs
                .iter()
                .filter(|job| job.outcome == outcome)
                .count()
        };
        BatchProgress {
            total: self.jobs.len(),
            completed: count(JobOutcome::Completed),
            failed: count(JobOutcome::Failed),
        }
    }
}

impl BatchPoller {
    pub fn new(
        source: Arc<dyn JobStatusSource>,
        config: PollingConfig,
        callbacks: BatchCallbacks,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            shared: Arc::new(Shared {
                source,
                config,
                callbacks,
                event_tx,
                session: Mutex::new(Session {
                    generation: 0,
                    jobs: Vec::new(),
                    state: BatchState::Idle,
                    rounds: 0,
                    last_error: None,
                    pending: None,
                }),
            }),
        })
    }

    /// Start tracking `job_ids`, cancelling any batch already running.
    ///
    /// Ids are used exactly as given. The first round starts immediately.
    pub fn start<S: AsRef<str>>(&self, job_ids: &[S]) -> Result<(), PollerError> {
        if job_ids.is_empty() {
            return Err(PollerError::EmptyBatch);
        }
        if job_ids.iter().any(|id| id.as_ref().trim().is_empty()) {
            return Err(PollerError::EmptyJobId);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| PollerError::NoRuntime)?;

        let mut session = self.shared.lock_session();
        if session.state == BatchState::Polling {
            tracing::info!(jobs = session.jobs.len(), "Superseding active batch");
            self.shared.cancel_locked(&mut session);
        }

        session.generation += 1;
        session.jobs = job_ids
            .iter()
            .map(|id| TrackedJob {
                id: id.as_ref().to_string(),
                outcome: JobOutcome::Pending,
                last_snapshot: None,
            })
            .collect();
        session.state = BatchState::Polling;
        session.rounds = 0;
        session.last_error = None;

        let generation = session.generation;
        let cancel = CancellationToken::new();
        let task = runtime.spawn(run_batch(
            Arc::clone(&self.shared),
            generation,
            cancel.clone(),
        ));
        session.pending = Some(PendingAttempt { cancel, task });

        tracing::info!(jobs = job_ids.len(), generation, "Started polling batch");
        Ok(())
    }

    /// Stop the active batch. No-op when nothing is being polled.
    pub fn stop(&self) {
        let mut session = self.shared.lock_session();
        if session.state == BatchState::Polling {
            self.shared.cancel_locked(&mut session);
        }
    }

    /// Stop the active batch and wait for its task to exit.
    pub async fn shutdown(&self) {
        let task = {
            let mut session = self.shared.lock_session();
            if session.state == BatchState::Polling {
                self.shared.cancel_locked(&mut session)
            } else {
                None
            }
        };

        if let Some(task) = task {
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.shared.event_tx.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.state() == BatchState::Polling
    }

    pub fn state(&self) -> BatchState {
        self.shared.lock_session().state
    }

    pub fn progress(&self) -> BatchProgress {
        self.shared.lock_session().progress()
    }

    /// Per-job outcome, in the order the ids were given to `start`.
    pub fn outcomes(&self) -> Vec<(JobId, JobOutcome)> {
        self.shared
            .lock_session()
            .jobs
            .iter()
            .map(|job| (job.id.clone(), job.outcome))
            .collect()
    }

    /// Most recent snapshot received for `job_id` in the current batch.
    pub fn last_snapshot(&self, job_id: &str) -> Option<JobSnapshot> {
        self.shared
            .lock_session()
            .jobs
            .iter()
            .find(|job| job.id == job_id)
            .and_then(|job| job.last_snapshot.clone())
    }

    pub fn last_error(&self) -> Option<PollError> {
        self.shared.lock_session().last_error.clone()
    }

    /// Completed polling rounds that left jobs unsettled.
    pub fn rounds(&self) -> u32 {
        self.shared.lock_session().rounds
    }
}

impl Drop for BatchPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_locked(&self, session: &mut Session) -> Option<JoinHandle<()>> {
        session.generation += 1;
        session.state = BatchState::Cancelled;

        let progress = session.progress();
        tracing::info!(
            completed = progress.completed,
            total = progress.total,
            "Stopped polling batch",
        );
        self.emit(BatchEvent::Cancelled { progress });

        session.pending.take().map(|pending| {
            pending.cancel.cancel();
            pending.task
        })
    }

    fn finish_locked(&self, session: &mut Session, state: BatchState) {
        session.state = state;
        if let Some(pending) = session.pending.take() {
            pending.cancel.cancel();
        }
    }

    /// Ids of the jobs still worth asking about, with their positions.
    fn unsettled(&self, generation: u64) -> Option<Vec<(usize, JobId)>> {
        let session = self.lock_session();
        if !session.is_current(generation) {
            return None;
        }
        Some(
            session
                .jobs
                .iter()
                .enumerate()
                .filter(|(_, job)| job.outcome == JobOutcome::Pending)
                .map(|(index, job)| (index, job.id.clone()))
                .collect(),
        )
    }

    /// Record one job's status. Returns `false` once the batch is stale.
    fn apply_job_result(
        &self,
        generation: u64,
        index: usize,
        result: Result<JobSnapshot, ApiError>,
    ) -> bool {
        let mut session = self.lock_session();
        if !session.is_current(generation) {
            tracing::debug!(generation, "Discarding stale batch response");
            return false;
        }
        let Some(job) = session.jobs.get_mut(index) else {
            return false;
        };

        match result {
            Ok(snapshot) => {
                match snapshot.status {
                    JobStatus::Completed => {
                        tracing::info!(job_id = %job.id, "Batch job completed");
                        job.outcome = JobOutcome::Completed;
                    }
                    JobStatus::Failed => {
                        tracing::warn!(
                            job_id = %job.id,
                            error = %snapshot.failure_message(),
                            "Batch job failed",
                        );
                        job.outcome = JobOutcome::Failed;
                    }
                    JobStatus::Queued | JobStatus::Processing => {}
                }
                job.last_snapshot = Some(snapshot);
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Batch job status unavailable");
            }
        }
        true
    }

    /// Report the round and decide whether to keep going.
    fn end_round(&self, generation: u64) -> Next {
        let mut session = self.lock_session();
        if !session.is_current(generation) {
            return Next::Stop;
        }

        let progress = session.progress();
        tracing::debug!(
            completed = progress.completed,
            failed = progress.failed,
            total = progress.total,
            "Batch round finished",
        );
        self.emit(BatchEvent::Progress { progress });
        if let Some(on_progress) = &self.callbacks.on_progress {
            invoke_callback("batch", "on_progress", || on_progress(&progress));
        }

        if progress.is_settled() {
            self.finish_locked(&mut session, BatchState::Finished);
            tracing::info!(
                completed = progress.completed,
                failed = progress.failed,
                "Batch finished",
            );
            self.emit(BatchEvent::Finished { progress });
            if let Some(on_finish) = &self.callbacks.on_finish {
                invoke_callback("batch", "on_finish", || on_finish(&progress));
            }
            return Next::Stop;
        }

        session.rounds += 1;
        if session.rounds >= self.config.max_attempts {
            let error = PollError::Timeout {
                attempts: session.rounds,
            };
            self.finish_locked(&mut session, BatchState::TimedOut);
            session.last_error = Some(error.clone());
            tracing::warn!(
                completed = progress.completed,
                total = progress.total,
                error = %error,
                "Batch polling ended with failure",
            );
            self.emit(BatchEvent::Failed {
                progress,
                error: error.clone(),
            });
            if let Some(on_fail) = &self.callbacks.on_fail {
                invoke_callback("batch", "on_fail", || on_fail(&error));
            }
            return Next::Stop;
        }

        Next::Wait(self.config.interval)
    }

    fn emit(&self, event: BatchEvent) {
        let _ = self.event_tx.send(event);
    }
}

async fn run_batch(shared: Arc<Shared>, generation: u64, cancel: CancellationToken) {
    loop {
        let Some(pending) = shared.unsettled(generation) else {
            return;
        };

        for (index, job_id) in pending {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = shared.source.fetch_status(&job_id) => result,
            };
            if !shared.apply_job_result(generation, index, result) {
                return;
            }
        }

        match shared.end_round(generation) {
            Next::Wait(delay) => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Next::Stop => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;

    struct NeverCalled;

    #[async_trait]
    impl JobStatusSource for NeverCalled {
        async fn fetch_status(&self, _job_id: &str) -> Result<JobSnapshot, ApiError> {
            unreachable!("no request expected")
        }
    }

    fn batch() -> BatchPoller {
        BatchPoller::new(
            Arc::new(NeverCalled),
            PollingConfig::default(),
            BatchCallbacks::new(),
        )
        .unwrap()
    }

    #[test]
    fn empty_batch_is_rejected() {
        let poller = batch();
        let none: [&str; 0] = [];
        assert!(matches!(poller.start(&none), Err(PollerError::EmptyBatch)));
        assert!(matches!(
            poller.start(&["job-1", " "]),
            Err(PollerError::EmptyJobId)
        ));
        assert_eq!(poller.state(), BatchState::Idle);
    }

    #[test]
    fn start_outside_runtime_fails() {
        let poller = batch();
        assert!(matches!(poller.start(&["job-1"]), Err(PollerError::NoRuntime)));
        assert_eq!(poller.progress(), BatchProgress::default());
    }

    #[test]
    fn terminal_states() {
        assert!(!BatchState::Polling.is_terminal());
        assert!(BatchState::Finished.is_terminal());
        assert!(BatchState::TimedOut.is_terminal());
        assert!(BatchState::Cancelled.is_terminal());
    }
}
