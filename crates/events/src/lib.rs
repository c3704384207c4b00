//! Newsdesk in-process event bus.
//!
//! - [`EventBus`] -- synchronous per-topic publish/subscribe hub that
//!   decouples the transport's lifecycle from the job-tracking logic.
//! - [`Topic`] / [`Event`] -- the event envelope.
//! - [`Subscription`] -- revocable listener handle.

pub mod bus;

pub use bus::{Callback, Event, EventBus, Subscription, Topic};
