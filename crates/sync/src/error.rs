use std::time::Duration;

use newsdesk_core::error::CoreError;

/// A remote read failed. Delivered to the affected cache key's
/// subscribers next to the last good value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("Request failed: {0}")]
    Request(String),

    /// The service returned a non-2xx status code.
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    /// The body did not match the expected shape.
    #[error("Invalid response body: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            FetchError::Decode(e.to_string())
        } else {
            FetchError::Request(e.to_string())
        }
    }
}

/// A user-initiated start/stop command did not go through. Returned
/// directly to the caller.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The executor (or the client's own view of it) refused the command.
    #[error("Command rejected: {0}")]
    Rejected(String),

    /// No answer within the request timeout. The command may still
    /// complete on the server.
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    /// `stop` was requested while nothing is running.
    #[error("No collection run is in progress")]
    NoRunningJob,

    /// The command options failed validation before anything was sent.
    #[error(transparent)]
    Invalid(#[from] CoreError),

    /// The command request failed for a reason other than a refusal.
    #[error(transparent)]
    Remote(#[from] FetchError),
}
