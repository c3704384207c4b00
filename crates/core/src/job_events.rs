//! Frame type constants for the collection service event stream.
//!
//! The server pushes JSON frames shaped `{"type": "<kind>", ...}`. Only
//! `job_status` carries meaning for run tracking; its payload is opaque
//! and is treated purely as a "something changed, re-fetch" signal.

/// Something about collection-run state changed on the server.
pub const MSG_TYPE_JOB_STATUS: &str = "job_status";

/// Local lifecycle signal: the event connection was (re)established.
pub const MSG_TYPE_CONNECTED: &str = "connected";

/// Local lifecycle signal: a connection attempt or receive failed.
pub const MSG_TYPE_ERROR: &str = "error";

/// Local lifecycle signal: an established connection closed.
pub const MSG_TYPE_CLOSE: &str = "close";

/// Client-side derived signal: a tracked job changed status.
pub const MSG_TYPE_JOB_TRANSITION: &str = "job_transition";
