//! Long-lived event-stream channel.
//!
//! [`TransportChannel`] owns the single persistent connection to the
//! collection service. It runs one background task per `connect()` that
//! loops connect -> read frames -> reconnect, and republishes everything
//! on the [`EventBus`]:
//!
//! - every successful (re)connect emits `connected`,
//! - every failed attempt or receive error emits `error`,
//! - every end of an established session emits `close`,
//! - every well-formed server frame is published under its `type`.
//!
//! Transport problems never reach callers. While the channel is down the
//! rest of the system keeps converging through polling.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{SinkExt, StreamExt};
use newsdesk_events::{Event, EventBus, Topic};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::client::{EventConnection, EventStreamClient, TransportError};
use crate::messages::parse_frame;
use crate::reconnect::{reconnect_loop, ReconnectConfig};

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// A connection task is running but no session is established yet
    /// (first attempt or backing off between retries).
    Connecting,
    Connected,
}

/// Bookkeeping shared between the handle and its connection task.
struct Control {
    /// Bumped by every `connect`/`disconnect`; a task only touches shared
    /// state while its own epoch is current.
    epoch: u64,
    cancel: Option<CancellationToken>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
}

struct Shared {
    control: Mutex<Control>,
    state: watch::Sender<ConnectionState>,
}

impl Shared {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a state change on behalf of the task running `epoch`.
    /// Returns `false` if that task has been superseded.
    fn update(
        &self,
        epoch: u64,
        state: ConnectionState,
        outbound: Option<mpsc::UnboundedSender<Message>>,
    ) -> bool {
        let mut control = self.control();
        if control.epoch != epoch {
            return false;
        }
        control.outbound = outbound;
        self.state.send_replace(state);
        true
    }
}

/// Handle to the persistent event-stream connection.
///
/// Create one per process and share it via `Arc`. Dropping the handle
/// stops the background task.
pub struct TransportChannel {
    client: Arc<EventStreamClient>,
    bus: Arc<EventBus>,
    reconnect: ReconnectConfig,
    shared: Arc<Shared>,
}

impl TransportChannel {
    pub fn new(ws_url: impl Into<String>, bus: Arc<EventBus>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            client: Arc::new(EventStreamClient::new(ws_url)),
            bus,
            reconnect: ReconnectConfig::default(),
            shared: Arc::new(Shared {
                control: Mutex::new(Control {
                    epoch: 0,
                    cancel: None,
                    outbound: None,
                }),
                state,
            }),
        }
    }

    /// Override the reconnect backoff.
    pub fn with_reconnect(mut self, config: ReconnectConfig) -> Self {
        self.reconnect = config;
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Start the connection task unless one is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let mut control = self.shared.control();
        if control.cancel.is_some() {
            tracing::debug!("Transport already connecting or connected");
            return;
        }

        control.epoch += 1;
        let epoch = control.epoch;
        let cancel = CancellationToken::new();
        control.cancel = Some(cancel.clone());
        control.outbound = None;
        self.shared.state.send_replace(ConnectionState::Connecting);
        drop(control);

        let client = Arc::clone(&self.client);
        let bus = Arc::clone(&self.bus);
        let shared = Arc::clone(&self.shared);
        let reconnect = self.reconnect.clone();

        tokio::spawn(async move {
            tracing::info!(epoch, ws_url = client.ws_url(), "Starting transport task");
            run_connection_loop(&client, &bus, &shared, &reconnect, epoch, &cancel).await;
            tracing::info!(epoch, "Transport task exited");
        });
    }

    /// Tear the connection down and suppress reconnects until the next
    /// [`connect`](Self::connect).
    pub fn disconnect(&self) {
        let mut control = self.shared.control();
        let Some(cancel) = control.cancel.take() else {
            return;
        };
        control.epoch += 1;
        control.outbound = None;
        self.shared.state.send_replace(ConnectionState::Disconnected);
        drop(control);

        tracing::info!("Disconnecting transport");
        cancel.cancel();
    }

    /// Send a JSON message to the server.
    ///
    /// Only succeeds while connected; otherwise the message is dropped and
    /// `false` is returned. Delivery is best effort either way.
    pub fn send<T: Serialize>(&self, message: &T) -> bool {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping unserializable outbound message");
                return false;
            }
        };

        let control = self.shared.control();
        match &control.outbound {
            Some(tx) => tx.send(Message::Text(text)).is_ok(),
            None => {
                tracing::debug!("Transport not connected, dropping outbound message");
                false
            }
        }
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        if let Some(cancel) = self.shared.control().cancel.take() {
            cancel.cancel();
        }
    }
}

/// How an established session ended.
enum SessionEnd {
    Cancelled,
    Lost,
}

/// Core connection loop: connect -> process frames -> reconnect.
///
/// Runs until the cancellation token is triggered.
async fn run_connection_loop(
    client: &EventStreamClient,
    bus: &EventBus,
    shared: &Shared,
    reconnect: &ReconnectConfig,
    epoch: u64,
    cancel: &CancellationToken,
) {
    let emit_failure = |attempt: u32, e: &TransportError| {
        bus.emit(
            Topic::Error,
            serde_json::json!({ "message": e.to_string(), "attempt": attempt }),
        );
    };

    let first = tokio::select! {
        _ = cancel.cancelled() => return,
        result = client.connect() => result,
    };
    let mut conn = match first {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(error = %e, "Connection failed, entering reconnect loop");
            emit_failure(0, &e);
            match reconnect_loop(client, reconnect, cancel, emit_failure).await {
                Some(conn) => conn,
                None => return,
            }
        }
    };

    loop {
        let (tx, rx) = mpsc::unbounded_channel();
        if !shared.update(epoch, ConnectionState::Connected, Some(tx)) {
            return;
        }
        bus.emit(
            Topic::Connected,
            serde_json::json!({ "connection_id": conn.connection_id }),
        );

        let end = run_session(conn, rx, bus, cancel).await;

        if let SessionEnd::Cancelled = end {
            bus.emit(Topic::Close, serde_json::json!({ "reason": "disconnect" }));
            return;
        }

        bus.emit(
            Topic::Close,
            serde_json::json!({ "reason": "connection_lost" }),
        );
        if !shared.update(epoch, ConnectionState::Connecting, None) {
            return;
        }

        tracing::info!("Event stream lost, entering reconnect loop");
        conn = match reconnect_loop(client, reconnect, cancel, emit_failure).await {
            Some(conn) => conn,
            None => return,
        };
    }
}

/// Drive one session: forward outbound messages and publish inbound
/// frames until the connection ends or `cancel` fires.
async fn run_session(
    conn: EventConnection,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    bus: &EventBus,
    cancel: &CancellationToken,
) -> SessionEnd {
    let connection_id = conn.connection_id;
    let (mut sink, mut stream) = conn.ws_stream.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return SessionEnd::Cancelled;
            }
            Some(msg) = outbound.recv() => {
                if let Err(e) = sink.send(msg).await {
                    tracing::warn!(connection_id = %connection_id, error = %e, "WebSocket send failed");
                    bus.emit(Topic::Error, serde_json::json!({ "message": e.to_string() }));
                    return SessionEnd::Lost;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => publish_frame(bus, &text),
                    Some(Ok(Message::Binary(_))) => {
                        tracing::trace!(connection_id = %connection_id, "Ignoring binary frame");
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        // Handled automatically by tungstenite.
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(connection_id = %connection_id, ?frame, "Server closed event stream");
                        return SessionEnd::Lost;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        let e = TransportError::Protocol(e.to_string());
                        tracing::error!(connection_id = %connection_id, error = %e, "WebSocket receive error");
                        bus.emit(Topic::Error, serde_json::json!({ "message": e.to_string() }));
                        return SessionEnd::Lost;
                    }
                    None => {
                        tracing::info!(connection_id = %connection_id, "WebSocket stream exhausted");
                        return SessionEnd::Lost;
                    }
                }
            }
        }
    }
}

/// Decode a text frame and publish it; malformed frames are logged and
/// dropped.
fn publish_frame(bus: &EventBus, text: &str) {
    match parse_frame(text) {
        Ok(frame) => {
            let topic = Topic::from_frame_type(&frame.kind);
            tracing::debug!(topic = %topic, "Event frame received");
            bus.publish(Event::new(topic).with_payload(serde_json::Value::Object(frame.payload)));
        }
        Err(e) => {
            tracing::warn!(error = %e, raw_message = %text, "Dropping malformed event frame");
        }
    }
}
