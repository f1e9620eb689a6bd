//! Payload encoding for request and reply bodies.
//!
//! The default wire encoding is JSON. Raw byte buffers pass through
//! untouched, and text is encoded straight to a JSON string without
//! building a value tree first.
//!
//! Error replies use a tagged object as their wire contract:
//!
//! ```text
//! {"error": true, "message": "<text>"}
//! ```

use crate::error::{Result, WarrenError};
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

/// Field that marks a reply body as a tagged error.
pub const ERROR_TAG: &str = "error";

/// Field carrying the error text of a tagged error reply.
pub const ERROR_MESSAGE: &str = "message";

/// Application data handed to a socket for sending.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Already-encoded bytes, sent as-is
    Bytes(Bytes),
    /// Text, sent as a JSON string
    Text(String),
    /// Structured data, sent as JSON
    Json(Value),
}

impl Payload {
    /// Serialize any `Serialize` value into a JSON payload.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// Serialize a payload to wire bytes.
pub fn pack(payload: &Payload) -> Result<Bytes> {
    match payload {
        Payload::Bytes(bytes) => Ok(bytes.clone()),
        Payload::Text(text) => Ok(Bytes::from(serde_json::to_vec(text.as_str())?)),
        Payload::Json(value) => Ok(Bytes::from(serde_json::to_vec(value)?)),
    }
}

/// Deserialize a wire payload.
///
/// # Errors
///
/// Returns `WarrenError::Parse` if the bytes are not valid JSON.
pub fn parse(bytes: &[u8]) -> Result<Value> {
    serde_json::from_slice(bytes).map_err(|e| WarrenError::parse(e.to_string()))
}

/// Encode a handler failure as a tagged error reply body.
pub fn encode_error_reply(message: &str) -> Bytes {
    let mut body = serde_json::Map::with_capacity(2);
    body.insert(ERROR_TAG.to_string(), Value::Bool(true));
    body.insert(ERROR_MESSAGE.to_string(), Value::String(message.to_string()));
    // A map of a bool and a string always serializes
    Bytes::from(Value::Object(body).to_string())
}

/// Interpret a parsed reply body: tagged error objects become
/// `WarrenError::Application`, everything else is returned as data.
pub fn decode_reply(value: Value) -> Result<Value> {
    if let Value::Object(map) = &value {
        if map.get(ERROR_TAG) == Some(&Value::Bool(true)) {
            let message = match map.get(ERROR_MESSAGE) {
                Some(Value::String(m)) => m.clone(),
                Some(other) => other.to_string(),
                None => String::from("unknown error"),
            };
            return Err(WarrenError::Application(message));
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bytes_pass_through() {
        let raw = Bytes::from_static(b"\x00\x01not json");
        assert_eq!(pack(&Payload::Bytes(raw.clone())).unwrap(), raw);
    }

    #[test]
    fn test_text_is_a_json_string() {
        let packed = pack(&Payload::from("hello")).unwrap();
        assert_eq!(&packed[..], b"\"hello\"");
        assert_eq!(parse(&packed).unwrap(), json!("hello"));
    }

    #[test]
    fn test_json_value() {
        let packed = pack(&Payload::from(json!({"foo": "bar"}))).unwrap();
        assert_eq!(parse(&packed).unwrap(), json!({"foo": "bar"}));
    }

    #[test]
    fn test_parse_malformed() {
        let err = parse(b"{\"foo\":").unwrap_err();
        assert!(matches!(err, WarrenError::Parse(_)));
    }

    #[test]
    fn test_error_reply_contract() {
        let body = encode_error_reply("no such user");
        let value = parse(&body).unwrap();
        assert_eq!(value, json!({"error": true, "message": "no such user"}));
        assert_eq!(
            decode_reply(value).unwrap_err(),
            WarrenError::Application("no such user".into())
        );
    }

    #[test]
    fn test_plain_reply_is_data() {
        let value = json!({"reply": "wooo"});
        assert_eq!(decode_reply(value.clone()).unwrap(), value);

        // Only a literal `true` tag marks an error
        let value = json!({"error": "nope"});
        assert_eq!(decode_reply(value.clone()).unwrap(), value);
    }

    #[test]
    fn test_payload_json_helper() {
        #[derive(Serialize)]
        struct Job {
            id: u32,
        }
        let payload = Payload::json(&Job { id: 7 }).unwrap();
        assert_eq!(payload, Payload::Json(json!({"id": 7})));
    }
}
