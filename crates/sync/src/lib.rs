//! Collection-run tracking and live state synchronization.
//!
//! - [`QueryCache`] -- keyed query results with invalidation, in-flight
//!   de-duplication and generation-counted fetches.
//! - [`PollingCoordinator`] -- reference-counted fixed-interval
//!   invalidation, the backstop for missed push events.
//! - [`JobController`] -- start/stop commands, job list, status and detail
//!   views, bound to `job_status` events on the bus.
//! - [`JobsRemote`] / [`HttpJobsRemote`] -- the remote command boundary.

pub mod api;
pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod polling;
pub mod remote;

pub use api::HttpJobsRemote;
pub use cache::{fetcher, Fetcher, QueryCache, QueryOptions, QuerySnapshot, QuerySubscription};
pub use config::{ConfigError, SyncConfig};
pub use controller::{JobController, StatusWatch};
pub use error::{CommandError, FetchError};
pub use polling::{PollGuard, PollingCoordinator};
pub use remote::JobsRemote;
