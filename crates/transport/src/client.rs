//! WebSocket client for the collection service event stream.
//!
//! [`EventStreamClient`] holds the endpoint configuration. Call
//! [`EventStreamClient::connect`] to establish a live
//! [`EventConnection`].

use tokio_tungstenite::{connect_async, MaybeTlsStream};

/// Configuration handle for the event stream endpoint.
pub struct EventStreamClient {
    ws_url: String,
}

/// A live WebSocket connection to the event stream.
pub struct EventConnection {
    /// Unique id sent during the handshake so the server can address us.
    pub connection_id: String,
    /// The raw WebSocket stream for reading/writing frames.
    pub ws_stream: tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

impl EventStreamClient {
    /// * `ws_url` - WebSocket base URL, e.g. `ws://host:8000`.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Connect to `{ws_url}/ws`.
    ///
    /// Generates a fresh `clientId` (UUID v4) for every attempt so that a
    /// reconnect is never mistaken for the previous session.
    pub async fn connect(&self) -> Result<EventConnection, TransportError> {
        let connection_id = uuid::Uuid::new_v4().to_string();
        let url = format!("{}/ws?clientId={}", self.ws_url, connection_id);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            TransportError::Connection(format!(
                "Failed to connect to event stream at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(
            connection_id = %connection_id,
            "Connected to event stream at {}",
            self.ws_url,
        );

        Ok(EventConnection {
            connection_id,
            ws_stream,
        })
    }
}

/// Errors raised inside the transport. They are logged and re-emitted on
/// the bus as `error` events, never returned to API callers.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A protocol-level error on an established connection.
    #[error("Protocol error: {0}")]
    Protocol(String),
}
