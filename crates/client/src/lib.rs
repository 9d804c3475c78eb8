//! Scanlation backend client library.
//!
//! Provides the HTTP API wrapper, a job status poller with cancellation
//! and stale-response protection, a batch tracker for many jobs at once,
//! retry policy, lifecycle events and configuration loading for talking to
//! the scanlation processing server.

pub mod api;
pub mod batch;
pub mod config;
pub mod events;
pub mod poller;
pub mod retry;
