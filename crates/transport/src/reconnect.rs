//! Reconnect policy for the event stream.
//!
//! After a session is lost, [`reconnect_loop`] sleeps one backoff step
//! before every attempt and keeps going until a connection is made or the
//! [`CancellationToken`] fires. The default policy is a fixed 3 s delay;
//! a multiplier above `1.0` makes it grow geometrically up to
//! [`ReconnectConfig::max_delay`].

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{EventConnection, EventStreamClient, TransportError};

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Backoff policy between reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Wait before the first attempt after a loss.
    pub initial_delay: Duration,
    /// Ceiling for the wait.
    pub max_delay: Duration,
    /// Growth factor applied after each failed attempt. `1.0` keeps the
    /// delay constant.
    pub multiplier: f64,
}

impl ReconnectConfig {
    /// The same `delay` before every attempt.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
        }
    }

    /// Iterator over the successive waits this policy produces.
    pub fn delays(&self) -> Backoff {
        Backoff {
            next: self.initial_delay.min(self.max_delay),
            max: self.max_delay,
            multiplier: self.multiplier.max(1.0),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::fixed(DEFAULT_RECONNECT_DELAY)
    }
}

/// Endless sequence of reconnect delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    multiplier: f64,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        self.next = Duration::try_from_secs_f64(current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max)
            .min(self.max);
        Some(current)
    }
}

/// Retry `client.connect()` until it succeeds or `cancel` fires.
///
/// `on_failure(attempt, error)` runs after every failed attempt; attempts
/// are numbered from 1. Returns `None` only on cancellation.
pub async fn reconnect_loop<F>(
    client: &EventStreamClient,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
    mut on_failure: F,
) -> Option<EventConnection>
where
    F: FnMut(u32, &TransportError),
{
    for (attempt, delay) in (1u32..).zip(config.delays()) {
        let result = tokio::select! {
            _ = cancel.cancelled() => None,
            result = async {
                tokio::time::sleep(delay).await;
                tracing::info!(
                    ws_url = client.ws_url(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnecting to event stream",
                );
                client.connect().await
            } => Some(result),
        };

        match result {
            None => {
                tracing::debug!(ws_url = client.ws_url(), attempt, "Reconnect cancelled");
                return None;
            }
            Some(Ok(conn)) => {
                tracing::info!(ws_url = client.ws_url(), attempt, "Event stream restored");
                return Some(conn);
            }
            Some(Err(e)) => {
                tracing::warn!(ws_url = client.ws_url(), attempt, error = %e, "Reconnect attempt failed");
                on_failure(attempt, &e);
            }
        }
    }
    None
}
