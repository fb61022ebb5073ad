//! JSON body encoding shared by requests and replies.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Content type stamped on every message body.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Serializes a value into a JSON message body.
///
/// # Errors
///
/// Returns the serializer error for values JSON cannot represent
/// (e.g. maps with non-string keys).
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}

/// Deserializes a JSON message body.
///
/// # Errors
///
/// Returns the parser error if the bytes are not valid JSON for `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(bytes)
}
