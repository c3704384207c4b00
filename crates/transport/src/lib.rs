//! Event-stream transport for the collection service.
//!
//! Provides the WebSocket client, frame parsing, reconnection backoff and
//! the long-lived [`TransportChannel`](channel::TransportChannel) that
//! feeds decoded frames into the in-process event bus.

pub mod channel;
pub mod client;
pub mod messages;
pub mod reconnect;

pub use channel::{ConnectionState, TransportChannel};
pub use client::{EventStreamClient, TransportError};
pub use reconnect::ReconnectConfig;
