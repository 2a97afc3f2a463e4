use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::request::CmdId;
use crate::Result;
use crate::ws::WsError;

/// Update pushed by the server for one subscription.
///
/// Values under `data` are opaque, usually a list of `[timestamp, value]` pairs, and
/// are passed through as sent. Fields this crate does not interpret are kept in `extra`.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryMessage {
    /// Command id of the subscription this update belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<CmdId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    /// Values per key. After routing, every requested key is present.
    #[serde(default, deserialize_with = "data_or_empty")]
    pub data: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TelemetryMessage {
    /// Ensure every key in `keys` has an entry, inserting an empty list where missing.
    pub fn fill_missing_keys<'k, I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = &'k str>,
    {
        for key in keys {
            self.data
                .entry(key)
                .or_insert_with(|| Value::Array(Vec::new()));
        }
    }
}

/// `null` data, or `null` under a key, reads as empty.
fn data_or_empty<'de, D>(deserializer: D) -> std::result::Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let data = Option::<Map<String, Value>>::deserialize(deserializer)?;
    Ok(data
        .unwrap_or_default()
        .into_iter()
        .map(|(key, values)| match values {
            Value::Null => (key, Value::Array(Vec::new())),
            values => (key, values),
        })
        .collect())
}

/// Parse one inbound text frame.
pub fn parse_message(bytes: &[u8]) -> Result<TelemetryMessage> {
    serde_json::from_slice(bytes).map_err(|e| WsError::MessageParse(e).into())
}
