//! Domain types shared by the scanlation client crates.
//!
//! Job status snapshots as reported by the processing backend, the typed
//! view of a finished page, and the well-known event names used when
//! logging or forwarding job lifecycle changes.

pub mod error;
pub mod job;
pub mod job_events;
pub mod types;
