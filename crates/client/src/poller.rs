//! Status polling for one backend job at a time.
//!
//! [`JobPoller`] tracks a job from `start` until it completes, fails,
//! times out or is stopped. Each session runs as one spawned task that
//! loops `fetch -> reconcile -> sleep`, so requests for a session are
//! strictly sequential and the next request is only scheduled once the
//! previous one has resolved.
//!
//! Session state lives behind a mutex owned by the poller. Every result
//! is tagged with the generation of the session that requested it and is
//! applied only if that session is still the current, active one.
//! `stop()` and `start()` bump the generation under the same lock, so once
//! they return no callback can fire for the old session.
//!
//! Callbacks run while the session lock is held. They must not call back
//! into the same poller; subscribe to [`PollEvent`]s to react from
//! elsewhere. A panicking callback is logged and otherwise ignored, so the
//! session still reaches its terminal state.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use scanlate_core::error::CoreError;
use scanlate_core::job::{JobSnapshot, JobStatus};
use scanlate_core::types::JobId;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, JobStatusSource};
use crate::config::PollingConfig;
use crate::events::{PollError, PollEvent};

/// Broadcast channel capacity for poll events.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How long [`JobPoller::shutdown`] waits for the session task to exit.
pub(crate) const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

type SnapshotCallback = Box<dyn Fn(&JobSnapshot) + Send + Sync>;
pub(crate) type FailCallback = Box<dyn Fn(&PollError) + Send + Sync>;

/// Lifecycle callbacks registered at construction time.
#[derive(Default)]
pub struct PollCallbacks {
    on_progress: Option<SnapshotCallback>,
    on_complete: Option<SnapshotCallback>,
    on_fail: Option<FailCallback>,
}

impl PollCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with every successfully fetched snapshot, including the one
    /// that completes or fails the job.
    pub fn on_progress(mut self, f: impl Fn(&JobSnapshot) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    /// Called once when the job completes.
    pub fn on_complete(mut self, f: impl Fn(&JobSnapshot) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    /// Called once when the session ends with an error.
    pub fn on_fail(mut self, f: impl Fn(&PollError) + Send + Sync + 'static) -> Self {
        self.on_fail = Some(Box::new(f));
        self
    }
}

/// Where a poller currently is in its lifecycle.
///
/// `Idle` is the initial state. Every terminal state goes back to
/// `Polling` only through a new [`JobPoller::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Polling,
    Completed,
    /// Job failure or transport failure; see [`JobPoller::last_error`].
    Failed,
    TimedOut,
    Cancelled,
}

impl PollState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Idle | Self::Polling)
    }
}

/// Synchronous errors from [`JobPoller::start`] and
/// [`BatchPoller::start`](crate::batch::BatchPoller::start).
///
/// Anything that goes wrong once the session is running is reported via
/// callbacks and events instead.
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("Job id must not be empty")]
    EmptyJobId,

    #[error("Batch must contain at least one job id")]
    EmptyBatch,

    #[error("JobPoller::start must be called from within a Tokio runtime")]
    NoRuntime,
}

/// Tracks one backend job at a time via repeated status requests.
///
/// Dropping the poller stops any active session.
pub struct JobPoller {
    shared: Arc<Shared>,
}

struct Shared {
    source: Arc<dyn JobStatusSource>,
    config: PollingConfig,
    callbacks: PollCallbacks,
    event_tx: broadcast::Sender<PollEvent>,
    session: Mutex<Session>,
}

struct Session {
    /// Bumped by every `start` and `stop`; results from older
    /// generations are discarded.
    generation: u64,
    target_job_id: Option<JobId>,
    state: PollState,
    attempt_count: u32,
    last_snapshot: Option<JobSnapshot>,
    last_error: Option<PollError>,
    /// Set only while `state == Polling`.
    pending: Option<PendingAttempt>,
}

/// Ownership handle for the running session task.
pub(crate) struct PendingAttempt {
    pub(crate) cancel: CancellationToken,
    pub(crate) task: JoinHandle<()>,
}

/// What the session task should do after reconciling a result.
pub(crate) enum Next {
    Wait(Duration),
    Stop,
}

impl JobPoller {
    /// Create an idle poller.
    pub fn new(
        source: Arc<dyn JobStatusSource>,
        config: PollingConfig,
        callbacks: PollCallbacks,
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
                    target_job_id: None,
                    state: PollState::Idle,
                    attempt_count: 0,
                    last_snapshot: None,
                    last_error: None,
                    pending: None,
                }),
            }),
        })
    }

    /// Start tracking `job_id`, cancelling any session already running.
    ///
    /// The id is opaque and used exactly as given; only blank ids are
    /// rejected. The first status request is issued immediately.
    pub fn start(&self, job_id: &str) -> Result<(), PollerError> {
        if job_id.trim().is_empty() {
            return Err(PollerError::EmptyJobId);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| PollerError::NoRuntime)?;

        let mut session = self.shared.lock_session();
        if session.state == PollState::Polling {
            tracing::info!(
                job_id = session.target_job_id.as_deref().unwrap_or_default(),
                "Superseding active polling session",
            );
            self.shared.cancel_locked(&mut session);
        }

        session.generation += 1;
        session.target_job_id = Some(job_id.to_string());
        session.state = PollState::Polling;
        session.attempt_count = 0;
        session.last_snapshot = None;
        session.last_error = None;

        let generation = session.generation;
        let cancel = CancellationToken::new();
        let task = runtime.spawn(run_session(
            Arc::clone(&self.shared),
            generation,
            job_id.to_string(),
            cancel.clone(),
        ));
        session.pending = Some(PendingAttempt { cancel, task });

        tracing::info!(job_id, generation, "Started polling job");
        Ok(())
    }

    /// Stop the active session. No-op when nothing is being polled.
    ///
    /// After this returns no callback fires and no state changes for the
    /// stopped session, even if a response is already on its way.
    pub fn stop(&self) {
        let mut session = self.shared.lock_session();
        if session.state == PollState::Polling {
            self.shared.cancel_locked(&mut session);
        }
    }

    /// Stop the active session and wait for its task to exit.
    pub async fn shutdown(&self) {
        let task = {
            let mut session = self.shared.lock_session();
            if session.state == PollState::Polling {
                self.shared.cancel_locked(&mut session)
            } else {
                None
            }
        };

        if let Some(task) = task {
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await;
        }
    }

    /// Subscribe to lifecycle events for every session of this poller.
    pub fn subscribe(&self) -> broadcast::Receiver<PollEvent> {
        self.shared.event_tx.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.state() == PollState::Polling
    }

    pub fn state(&self) -> PollState {
        self.shared.lock_session().state
    }

    /// Most recent snapshot of the current (or last) session.
    pub fn last_snapshot(&self) -> Option<JobSnapshot> {
        self.shared.lock_session().last_snapshot.clone()
    }

    /// Error that ended the current (or last) session, if any.
    pub fn last_error(&self) -> Option<PollError> {
        self.shared.lock_session().last_error.clone()
    }

    /// Non-terminal responses received by the current session.
    pub fn attempt_count(&self) -> u32 {
        self.shared.lock_session().attempt_count
    }

    pub fn target_job_id(&self) -> Option<JobId> {
        self.shared.lock_session().target_job_id.clone()
    }

    pub fn config(&self) -> &PollingConfig {
        &self.shared.config
    }
}

impl Drop for JobPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn lock_session(&self) -> MutexGuard<'_, Session> {
        // Callbacks are panic-guarded, so the session is consistent even
        // if the lock was poisoned.
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancel the active session and mark it cancelled. Returns the task
    /// handle so callers may wait for it.
    fn cancel_locked(&self, session: &mut Session) -> Option<JoinHandle<()>> {
        session.generation += 1;
        session.state = PollState::Cancelled;

        let job_id = session.target_job_id.clone().unwrap_or_default();
        tracing::info!(job_id = %job_id, "Stopped polling job");
        self.emit(PollEvent::Cancelled { job_id });

        session.pending.take().map(|pending| {
            pending.cancel.cancel();
            pending.task
        })
    }

    /// End the session in a terminal state, releasing the pending handle.
    fn finish_locked(&self, session: &mut Session, state: PollState) {
        session.state = state;
        if let Some(pending) = session.pending.take() {
            // The task calling this is the one being released; it exits
            // on its own once this returns.
            pending.cancel.cancel();
        }
    }

    fn fail_locked(&self, session: &mut Session, state: PollState, job_id: &str, error: PollError) {
        self.finish_locked(session, state);
        session.last_error = Some(error.clone());

        tracing::warn!(job_id, error = %error, "Polling ended with failure");
        self.emit(PollEvent::Failed {
            job_id: job_id.to_string(),
            error: error.clone(),
        });
        if let Some(on_fail) = &self.callbacks.on_fail {
            invoke_callback(job_id, "on_fail", || on_fail(&error));
        }
    }

    /// Reconcile a fetched snapshot into the session.
    fn apply_snapshot(&self, generation: u64, job_id: &str, snapshot: JobSnapshot) -> Next {
        let mut session = self.lock_session();
        if !session.is_current(generation) {
            tracing::debug!(job_id, generation, "Discarding stale status response");
            return Next::Stop;
        }

        tracing::debug!(
            job_id,
            status = %snapshot.status,
            progress = snapshot.progress,
            step = %snapshot.step,
            "Job status received",
        );

        session.last_snapshot = Some(snapshot.clone());
        self.emit(PollEvent::Progress {
            job_id: job_id.to_string(),
            snapshot: snapshot.clone(),
        });
        if let Some(on_progress) = &self.callbacks.on_progress {
            invoke_callback(job_id, "on_progress", || on_progress(&snapshot));
        }

        match snapshot.status {
            JobStatus::Completed => {
                self.finish_locked(&mut session, PollState::Completed);
                tracing::info!(job_id, "Job completed");
                self.emit(PollEvent::Completed {
                    job_id: job_id.to_string(),
                    snapshot: snapshot.clone(),
                });
                if let Some(on_complete) = &self.callbacks.on_complete {
                    invoke_callback(job_id, "on_complete", || on_complete(&snapshot));
                }
                Next::Stop
            }
            JobStatus::Failed => {
                let error = PollError::JobFailed {
                    message: snapshot.failure_message(),
                };
                self.fail_locked(&mut session, PollState::Failed, job_id, error);
                Next::Stop
            }
            JobStatus::Queued | JobStatus::Processing => {
                session.attempt_count += 1;
                if session.attempt_count >= self.config.max_attempts {
                    let error = PollError::Timeout {
                        attempts: session.attempt_count,
                    };
                    self.fail_locked(&mut session, PollState::TimedOut, job_id, error);
                    Next::Stop
                } else {
                    Next::Wait(self.config.interval)
                }
            }
        }
    }

    /// Reconcile a transport failure that is not going to be retried.
    fn apply_transport_error(&self, generation: u64, job_id: &str, error: &ApiError) -> Next {
        let mut session = self.lock_session();
        if !session.is_current(generation) {
            tracing::debug!(job_id, generation, "Discarding stale transport error");
            return Next::Stop;
        }

        let error = PollError::Transport {
            message: error.to_string(),
        };
        self.fail_locked(&mut session, PollState::Failed, job_id, error);
        Next::Stop
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock_session().is_current(generation)
    }

    fn emit(&self, event: PollEvent) {
        // Ignore the SendError -- it only means there are zero receivers.
        let _ = self.event_tx.send(event);
    }
}

impl Session {
    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.state == PollState::Polling
    }
}

/// Run a user callback, logging a panic instead of unwinding through the
/// session task.
pub(crate) fn invoke_callback(job_id: &str, callback: &'static str, f: impl FnOnce()) {
    if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::error!(job_id, callback, "Polling callback panicked");
    }
}

/// Drive one polling session until it reaches a terminal state or is
/// cancelled.
async fn run_session(
    shared: Arc<Shared>,
    generation: u64,
    job_id: JobId,
    cancel: CancellationToken,
) {
    let retry = shared.config.transport_retry.clone();
    let mut retries = 0u32;

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = shared.source.fetch_status(&job_id) => result,
        };

        let next = match result {
            Ok(snapshot) => {
                retries = 0;
                shared.apply_snapshot(generation, &job_id, snapshot)
            }
            Err(e) if retries < retry.max_retries => {
                if !shared.is_current(generation) {
                    return;
                }
                let delay = retry.delay_for(retries);
                retries += 1;
                tracing::warn!(
                    job_id = %job_id,
                    error = %e,
                    retry = retries,
                    delay_ms = delay.as_millis() as u64,
                    "Status request failed, retrying",
                );
                Next::Wait(delay)
            }
            Err(e) => shared.apply_transport_error(generation, &job_id, &e),
        };

        match next {
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

    fn poller() -> JobPoller {
        JobPoller::new(
            Arc::new(NeverCalled),
            PollingConfig::default(),
            PollCallbacks::new(),
        )
        .unwrap()
    }

    #[test]
    fn terminal_states() {
        assert!(!PollState::Idle.is_terminal());
        assert!(!PollState::Polling.is_terminal());
        assert!(PollState::Completed.is_terminal());
        assert!(PollState::Failed.is_terminal());
        assert!(PollState::TimedOut.is_terminal());
        assert!(PollState::Cancelled.is_terminal());
    }

    #[test]
    fn new_poller_is_idle() {
        let poller = poller();
        assert_eq!(poller.state(), PollState::Idle);
        assert!(!poller.is_active());
        assert!(poller.last_snapshot().is_none());
        assert!(poller.last_error().is_none());
        assert!(poller.target_job_id().is_none());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = JobPoller::new(
            Arc::new(NeverCalled),
            PollingConfig::default().with_max_attempts(0),
            PollCallbacks::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn start_outside_runtime_fails_without_side_effects() {
        let poller = poller();
        assert!(matches!(poller.start("job-1"), Err(PollerError::NoRuntime)));
        assert_eq!(poller.state(), PollState::Idle);
    }

    #[test]
    fn empty_job_id_is_rejected() {
        let poller = poller();
        assert!(matches!(poller.start("  "), Err(PollerError::EmptyJobId)));
        assert!(matches!(poller.start(""), Err(PollerError::EmptyJobId)));
        assert_eq!(poller.state(), PollState::Idle);
    }

    #[test]
    fn panicking_callback_is_contained() {
        invoke_callback("job-1", "on_progress", || panic!("consumer bug"));
    }

    #[test]
    fn stop_when_idle_is_a_noop() {
        let poller = poller();
        let mut rx = poller.subscribe();
        poller.stop();
        poller.stop();
        assert_eq!(poller.state(), PollState::Idle);
        assert!(rx.try_recv().is_err());
    }
}
