//! Event-stream frame type and parser.
//!
//! The server sends JSON text frames shaped `{"type": "<kind>", ...}`.
//! Everything besides `type` is kept as an opaque payload object.

use serde::Deserialize;
use serde_json::{Map, Value};

/// One decoded server frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// Parse a text frame.
///
/// Returns `Err` for malformed JSON, non-object frames, or a missing or
/// non-string `type`. Callers log and drop these.
pub fn parse_frame(text: &str) -> Result<ServerFrame, serde_json::Error> {
    serde_json::from_str(text)
}
