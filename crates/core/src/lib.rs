//! Shared domain types for the newsdesk collection-run tracker.
//!
//! Everything in here is plain data plus pure logic: the job model and
//! its lifecycle rules, the wire constants for event frames, and the
//! crate-wide error enum. No I/O lives in this crate.

pub mod error;
pub mod job;
pub mod job_events;
pub mod types;
