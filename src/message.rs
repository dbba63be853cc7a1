//! JSON-RPC records carried by the transports.
//!
//! Records are decoded through [`serde_json::Value`] so that the shape
//! invariants can be checked explicitly: a record is a request (`id` and
//! `method`), a notification (`method`, no `id`) or a response (`id` and
//! exactly one of `result` / `error`). Anything else is a message error.
//! Top-level members outside JSON-RPC are kept and written back unchanged.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Result, TransportError};

const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC request id.
///
/// Only strings and integers representable as `i64` are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    fn from_value(value: Value) -> Result<Self> {
        // ---
        match value {
            Value::String(s) => Ok(Self::String(s)),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Number)
                .ok_or_else(|| TransportError::message_msg(format!("unsupported numeric id {n}"))),
            other => Err(TransportError::message_msg(format!(
                "id must be a string or an integer, got {other}"
            ))),
        }
    }

    /// Borrow the id as a string when it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            Self::Number(_) => None,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// Result XOR error member of a response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Result(Value),
    Error(Value),
}

/// One JSON-RPC record.
///
/// A response to a request whose id could not be determined carries
/// `"id": null`, represented here as `id: None`. `extra` holds any other
/// top-level members the record arrived with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum JsonRpcMessage {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
        extra: Map<String, Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
        extra: Map<String, Value>,
    },
    Response {
        id: Option<RequestId>,
        outcome: ResponseOutcome,
        extra: Map<String, Value>,
    },
}

impl JsonRpcMessage {
    // ---

    /// Build a request record.
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Self::Request {
            id: id.into(),
            method: method.into(),
            params: Some(params),
            extra: Map::new(),
        }
    }

    /// Build a notification record.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification {
            method: method.into(),
            params,
            extra: Map::new(),
        }
    }

    /// Build a successful response record.
    pub fn result(id: impl Into<RequestId>, result: Value) -> Self {
        Self::Response {
            id: Some(id.into()),
            outcome: ResponseOutcome::Result(result),
            extra: Map::new(),
        }
    }

    /// Build an error response record with a JSON-RPC error object.
    pub fn error(id: Option<RequestId>, code: i64, message: impl Into<String>) -> Self {
        Self::Response {
            id,
            outcome: ResponseOutcome::Error(serde_json::json!({
                "code": code,
                "message": message.into(),
            })),
            extra: Map::new(),
        }
    }

    /// The record's id; `None` for notifications and null-id responses.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request { id, .. } => Some(id),
            Self::Response { id, .. } => id.as_ref(),
            Self::Notification { .. } => None,
        }
    }

    /// Replace the id of a request or response. Returns `false` (and leaves
    /// the record untouched) for notifications and null-id responses.
    pub fn replace_id(&mut self, new_id: RequestId) -> bool {
        // ---
        match self {
            Self::Request { id, .. } => {
                *id = new_id;
                true
            }
            Self::Response { id: Some(id), .. } => {
                *id = new_id;
                true
            }
            _ => false,
        }
    }

    /// Method name of requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response { .. } => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request { .. })
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, Self::Notification { .. })
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Self::Response { .. })
    }

    /// Decode one record from UTF-8 JSON bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        // ---
        let value: Value = serde_json::from_slice(bytes)?;
        Self::try_from(value)
    }

    /// Decode one record from JSON text.
    pub fn parse(text: &str) -> Result<Self> {
        // ---
        let value: Value = serde_json::from_str(text)?;
        Self::try_from(value)
    }

    /// Encode the record as compact JSON bytes.
    pub fn to_bytes(&self) -> Result<Bytes> {
        // ---
        let bytes = serde_json::to_vec(&Value::from(self.clone()))?;
        Ok(Bytes::from(bytes))
    }
}

impl TryFrom<Value> for JsonRpcMessage {
    type Error = TransportError;

    fn try_from(value: Value) -> Result<Self> {
        // ---
        let Value::Object(mut obj) = value else {
            return Err(TransportError::message_msg(
                "JSON-RPC record must be an object",
            ));
        };

        match obj.remove("jsonrpc") {
            None => {}
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            Some(other) => {
                return Err(TransportError::message_msg(format!(
                    "unsupported jsonrpc version {other}"
                )))
            }
        }

        let id = match obj.remove("id") {
            None => None,
            Some(Value::Null) => Some(None),
            Some(v) => Some(Some(RequestId::from_value(v)?)),
        };
        let method = obj.remove("method");
        let params = obj.remove("params");
        let result = obj.remove("result");
        let error = obj.remove("error");
        let extra = obj;

        if let Some(method) = method {
            let Value::String(method) = method else {
                return Err(TransportError::message_msg("method must be a string"));
            };
            if result.is_some() || error.is_some() {
                return Err(TransportError::message_msg(
                    "record carries both a method and a result/error",
                ));
            }
            return match id {
                None => Ok(Self::Notification { method, params, extra }),
                Some(Some(id)) => Ok(Self::Request { id, method, params, extra }),
                Some(None) => Err(TransportError::message_msg("request id must not be null")),
            };
        }

        let Some(id) = id else {
            return Err(TransportError::message_msg(
                "record has neither a method nor an id",
            ));
        };

        let outcome = match (result, error) {
            (Some(result), None) => ResponseOutcome::Result(result),
            (None, Some(error)) => ResponseOutcome::Error(error),
            (Some(_), Some(_)) => {
                return Err(TransportError::message_msg(
                    "response carries both result and error",
                ))
            }
            (None, None) => {
                return Err(TransportError::message_msg(
                    "response carries neither result nor error",
                ))
            }
        };

        if id.is_none() && matches!(outcome, ResponseOutcome::Result(_)) {
            return Err(TransportError::message_msg(
                "successful response must carry an id",
            ));
        }

        Ok(Self::Response { id, outcome, extra })
    }
}

impl From<JsonRpcMessage> for Value {
    fn from(message: JsonRpcMessage) -> Self {
        // ---
        let id_value = |id: RequestId| match id {
            RequestId::Number(n) => Value::from(n),
            RequestId::String(s) => Value::from(s),
        };

        let (mut obj, members) = match message {
            JsonRpcMessage::Request { id, method, params, extra } => (
                extra,
                [
                    ("id", Some(id_value(id))),
                    ("method", Some(Value::from(method))),
                    ("params", params),
                ],
            ),
            JsonRpcMessage::Notification { method, params, extra } => (
                extra,
                [
                    ("id", None),
                    ("method", Some(Value::from(method))),
                    ("params", params),
                ],
            ),
            JsonRpcMessage::Response { id, outcome, extra } => {
                let (key, value) = match outcome {
                    ResponseOutcome::Result(v) => ("result", v),
                    ResponseOutcome::Error(v) => ("error", v),
                };
                (
                    extra,
                    [
                        ("id", Some(id.map(id_value).unwrap_or(Value::Null))),
                        (key, Some(value)),
                        ("params", None),
                    ],
                )
            }
        };

        obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
        for (key, value) in members {
            if let Some(value) = value {
                obj.insert(key.into(), value);
            }
        }

        Value::Object(obj)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_shapes() {
        // ---
        let req = JsonRpcMessage::parse(r#"{"id":1,"method":"add","params":{"a":5,"b":3}}"#)
            .unwrap();
        assert!(req.is_request());
        assert_eq!(req.id(), Some(&RequestId::Number(1)));
        assert_eq!(req.method(), Some("add"));

        let note = JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .unwrap();
        assert!(note.is_notification());
        assert_eq!(note.id(), None);

        let resp = JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","id":"abc","result":{}}"#).unwrap();
        assert!(resp.is_response());
        assert_eq!(resp.id(), Some(&RequestId::String("abc".into())));

        let err = JsonRpcMessage::parse(
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#,
        )
        .unwrap();
        assert_eq!(err.id(), None);
        assert!(err.is_response());
    }

    #[test]
    fn test_rejects_malformed_records() {
        // ---
        for bad in [
            r#"[1,2]"#,
            r#"{"id":1}"#,
            r#"{"id":1,"result":1,"error":{}}"#,
            r#"{"id":1,"method":"x","result":1}"#,
            r#"{"id":{"nested":true},"method":"x"}"#,
            r#"{"id":1.5,"method":"x"}"#,
            r#"{"jsonrpc":"1.0","id":1,"method":"x"}"#,
            r#"{"id":null,"result":1}"#,
            r#"{"method":42}"#,
        ] {
            let err = JsonRpcMessage::parse(bad).unwrap_err();
            assert!(
                matches!(err, TransportError::Message { .. }),
                "input {bad}: {err:?}"
            );
        }
    }

    #[test]
    fn test_encode_adds_version_and_keeps_id_type() {
        // ---
        let msg = JsonRpcMessage::result(7, json!({"value": 8}));
        let value: Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();

        assert_eq!(value, json!({"jsonrpc": "2.0", "id": 7, "result": {"value": 8}}));
    }

    #[test]
    fn test_unknown_members_survive() {
        // ---
        let text = r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{},"x-trace":"t-1"}"#;
        let mut msg = JsonRpcMessage::parse(text).unwrap();
        msg.replace_id(RequestId::from("client-abc-4"));

        let value: Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(value["x-trace"], json!("t-1"));
        assert_eq!(value["id"], json!("client-abc-4"));
        assert_eq!(value["method"], json!("tools/call"));
    }

    #[test]
    fn test_replace_id() {
        // ---
        let mut req = JsonRpcMessage::request(1, "add", json!({}));
        assert!(req.replace_id(RequestId::from("client-abc-1")));
        assert_eq!(req.id(), Some(&RequestId::String("client-abc-1".into())));

        let mut note = JsonRpcMessage::notification("ping", None);
        assert!(!note.replace_id(RequestId::from(3)));
        assert_eq!(note.id(), None);
    }

    #[test]
    fn test_serde_round_trip_through_value() {
        // ---
        let msg: JsonRpcMessage =
            serde_json::from_value(json!({"id": "x", "error": {"code": 1, "message": "m"}}))
                .unwrap();
        let back = serde_json::to_value(&msg).unwrap();
        assert_eq!(back["error"]["code"], json!(1));
        assert_eq!(back["id"], json!("x"));
    }
}
