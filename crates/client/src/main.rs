//! `scanlate-watch` -- follow a scanlation job until it finishes.
//!
//! ```text
//! scanlate-watch <job-id>
//! scanlate-watch submit <image> [full|premium|clean_only] [project-id]
//! scanlate-watch batch <job-id> <job-id>...
//! ```
//!
//! Exits with `0` when the job completes (or every job of a batch has
//! settled) and `1` on failure, timeout or a usage error.
//!
//! # Environment variables
//!
//! | Variable                     | Default                 | Description                         |
//! |------------------------------|-------------------------|-------------------------------------|
//! | `SCANLATE_API_URL`           | `http://localhost:8000` | Backend base URL                    |
//! | `SCANLATE_HTTP_TIMEOUT_SECS` | `300`                   | Per-request HTTP timeout            |
//! | `POLL_INTERVAL_MS`           | `2000`                  | Delay between status requests       |
//! | `POLL_MAX_ATTEMPTS`          | `300`                   | Non-terminal polls before giving up |
//! | `POLL_TRANSPORT_RETRIES`     | `0`                     | Retries on network errors           |

use std::path::PathBuf;
use std::sync::Arc;

use scanlate_client::api::{JobStatusSource, ScanlateApi, SubmitOptions};
use scanlate_client::config::{ApiConfig, PollingConfig};
use scanlate_client::batch::{BatchCallbacks, BatchPoller};
use scanlate_client::events::{BatchEvent, PollEvent};
use scanlate_client::poller::{JobPoller, PollCallbacks};
use scanlate_core::job::JobSnapshot;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: scanlate-watch <job-id> | scanlate-watch submit <image> [mode] [project-id] | scanlate-watch batch <job-id>...";

/// Exit code used when interrupted with Ctrl-C.
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug)]
enum Command {
    Watch { job_id: String },
    Submit { path: PathBuf, options: SubmitOptions },
    Batch { job_ids: Vec<String> },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scanlate_watch=info,scanlate_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let command = parse_args(std::env::args().skip(1)).unwrap_or_else(|e| {
        tracing::error!("{e}");
        eprintln!("{USAGE}");
        std::process::exit(1);
    });

    let api_config = ApiConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid API configuration");
        std::process::exit(1);
    });

    let polling_config = PollingConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid polling configuration");
        std::process::exit(1);
    });

    let api = ScanlateApi::from_config(&api_config).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to build HTTP client");
        std::process::exit(1);
    });

    tracing::info!(
        api_url = %api.api_url(),
        interval_ms = polling_config.interval.as_millis() as u64,
        max_attempts = polling_config.max_attempts,
        "Starting scanlate-watch",
    );

    let job_id = match command {
        Command::Watch { job_id } => job_id,
        Command::Batch { job_ids } => {
            let code = watch_batch(Arc::new(api), polling_config, &job_ids).await;
            std::process::exit(code);
        }
        Command::Submit { path, options } => match api.submit_page(&path, &options).await {
            Ok(submitted) => submitted.job_id,
            Err(e) => {
                tracing::error!(error = %e, file = %path.display(), "Submission failed");
                std::process::exit(1);
            }
        },
    };

    let code = watch(Arc::new(api), polling_config, &job_id).await;
    std::process::exit(code);
}

/// Poll `job_id` until it reaches a terminal state and return the exit code.
async fn watch(source: Arc<dyn JobStatusSource>, config: PollingConfig, job_id: &str) -> i32 {
    let callbacks = PollCallbacks::new().on_progress(|snapshot| {
        tracing::info!(
            status = %snapshot.status,
            progress = snapshot.progress_percent(),
            step = %snapshot.step,
            "Job progress",
        );
    });

    let poller = match JobPoller::new(source, config, callbacks) {
        Ok(poller) => poller,
        Err(e) => {
            tracing::error!(error = %e, "Invalid polling configuration");
            return 1;
        }
    };

    let mut events = poller.subscribe();
    if let Err(e) = poller.start(job_id) {
        tracing::error!(error = %e, "Could not start polling");
        return 1;
    }

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!(job_id, "Interrupted, the job keeps running server-side");
                poller.shutdown().await;
                return EXIT_INTERRUPTED;
            }
            event = events.recv() => event,
        };

        match event {
            Ok(PollEvent::Progress { .. }) => {}
            Ok(PollEvent::Completed { snapshot, .. }) => {
                report_result(&snapshot);
                return 0;
            }
            Ok(PollEvent::Failed { error, .. }) => {
                if error.is_timeout() {
                    tracing::error!(
                        job_id,
                        "Gave up waiting; the job may still finish in the background",
                    );
                } else {
                    tracing::error!(job_id, error = %error, "Job failed");
                }
                return 1;
            }
            Ok(PollEvent::Cancelled { .. }) => return 1,
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Event receiver lagged");
            }
            Err(RecvError::Closed) => return 1,
        }
    }
}

/// Poll every job in `job_ids` until all of them settle and return the
/// exit code.
async fn watch_batch(
    source: Arc<dyn JobStatusSource>,
    config: PollingConfig,
    job_ids: &[String],
) -> i32 {
    let callbacks = BatchCallbacks::new().on_progress(|progress| {
        tracing::info!(
            completed = progress.completed,
            failed = progress.failed,
            total = progress.total,
            "Batch progress",
        );
    });

    let poller = match BatchPoller::new(source, config, callbacks) {
        Ok(poller) => poller,
        Err(e) => {
            tracing::error!(error = %e, "Invalid polling configuration");
            return 1;
        }
    };

    let mut events = poller.subscribe();
    if let Err(e) = poller.start(job_ids) {
        tracing::error!(error = %e, "Could not start polling");
        return 1;
    }

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Interrupted, the jobs keep running server-side");
                poller.shutdown().await;
                return EXIT_INTERRUPTED;
            }
            event = events.recv() => event,
        };

        match event {
            Ok(BatchEvent::Progress { .. }) => {}
            Ok(BatchEvent::Finished { progress }) => {
                for (job_id, outcome) in poller.outcomes() {
                    tracing::info!(job_id = %job_id, outcome = ?outcome, "Batch job settled");
                }
                tracing::info!(
                    completed = progress.completed,
                    failed = progress.failed,
                    "Batch finished",
                );
                return 0;
            }
            Ok(BatchEvent::Failed { progress, error }) => {
                tracing::error!(
                    completed = progress.completed,
                    total = progress.total,
                    error = %error,
                    "Gave up waiting for the batch",
                );
                return 1;
            }
            Ok(BatchEvent::Cancelled { .. }) => return 1,
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Event receiver lagged");
            }
            Err(RecvError::Closed) => return 1,
        }
    }
}

fn report_result(snapshot: &JobSnapshot) {
    match snapshot.processing_result() {
        Some(result) => {
            tracing::info!(
                job_id = %snapshot.id,
                bubbles = result.bubbles_count,
                final_url = result.final_url.as_deref().unwrap_or("-"),
                clean_url = result.clean_url.as_deref().unwrap_or("-"),
                "Job completed",
            );
        }
        None => {
            tracing::info!(job_id = %snapshot.id, result = ?snapshot.result, "Job completed");
        }
    }
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Command, String> {
    let first = args.next().ok_or("missing job id or command")?;

    if first == "batch" {
        let job_ids: Vec<String> = args.collect();
        if job_ids.is_empty() {
            return Err("batch needs at least one job id".into());
        }
        return Ok(Command::Batch { job_ids });
    }

    if first != "submit" {
        if let Some(extra) = args.next() {
            return Err(format!("unexpected argument '{extra}'"));
        }
        return Ok(Command::Watch { job_id: first });
    }

    let path = args.next().ok_or("submit needs an image path")?;
    let mut options = SubmitOptions::default();
    if let Some(mode) = args.next() {
        options.mode = mode.parse().map_err(|e| format!("{e}"))?;
    }
    options.project_id = args.next();
    if let Some(extra) = args.next() {
        return Err(format!("unexpected argument '{extra}'"));
    }

    Ok(Command::Submit {
        path: PathBuf::from(path),
        options,
    })
}
