//! Synthesized responses for when neither the network nor the cache has data.

use serde_json::{json, Value};

use super::types::Response;

/// Status of the offline-and-uncached API response.
pub const OFFLINE_STATUS: u16 = 503;

/// Error message of the offline-and-uncached API response.
pub const OFFLINE_MESSAGE: &str = "Offline - no cached data available";

/// Build a JSON response with the given status and body.
pub fn build_fallback(status: u16, body: &Value) -> Response {
  // Serializing a Value cannot fail
  let bytes = serde_json::to_vec(body).unwrap_or_default();
  Response::new(status, bytes).with_header("Content-Type", "application/json")
}

/// The 503 served by the network-first strategy when it has nothing else.
pub fn offline_response() -> Response {
  build_fallback(OFFLINE_STATUS, &json!({ "error": OFFLINE_MESSAGE }))
}
