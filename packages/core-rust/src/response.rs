//! The reply body every operation produces.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Reply body shipped back to the caller.
///
/// Wire form is `{ "success": bool, "message": string, "result"?: any }`.
/// `result` is omitted when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    pub success: bool,
    pub message: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present"
    )]
    pub result: Option<Value>,
}

/// Keeps an explicit `"result": null` as `Some(Value::Null)`.
///
/// Without this, serde collapses a present `null` into `None` and a handler
/// returning `Some(Value::Null)` would not survive the trip over the wire.
fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Some(Value::deserialize(deserializer)?))
}

impl ResponseBody {
    /// A successful body without a result.
    #[must_use]
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            result: None,
        }
    }

    /// A failed body without a result.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            result: None,
        }
    }

    /// The body returned for an operation tag with no registered handler.
    #[must_use]
    pub fn invalid_operation(operation: &str) -> Self {
        Self::failure(format!("Invalid operation: {operation}"))
    }

    /// Attaches a result value.
    #[must_use]
    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Successful body carrying any serializable result.
    ///
    /// # Errors
    ///
    /// Returns the serialization error if `result` cannot be converted to JSON.
    pub fn success_with<T: Serialize>(
        message: impl Into<String>,
        result: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::success(message).with_result(serde_json::to_value(result)?))
    }
}
