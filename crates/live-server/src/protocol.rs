//! JSON wire frames.
//!
//! Client to server: `[verb, requestId, body]`, `[verb, body]` or `[verb]`.
//! Server to client:
//! - success: `[requestId, "success", body]` (`["success", body]` without id)
//! - error: `["error", requestId, {code, message?}]`
//! - push: `[eventType, body]`

use crate::errors::{LiveError, ProtocolError};
use serde_json::{json, Map, Value};

/// Verb of the keepalive frame.
pub const PING: &str = "ping";

/// Verb of the login frame.
pub const AUTHENTICATE: &str = "authenticate";

/// A parsed client frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientFrame {
    pub verb: String,
    pub request_id: Option<Value>,
    pub body: Value,
}

impl ClientFrame {
    /// Parse a text frame.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Malformed` if the text is not a JSON array of
    /// one to three elements starting with a string verb.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Malformed(format!("invalid json: {e}")))?;
        let Value::Array(items) = value else {
            return Err(ProtocolError::Malformed("frame is not an array".to_string()));
        };

        let mut items = items.into_iter();
        let verb = match items.next() {
            Some(Value::String(verb)) if !verb.is_empty() => verb,
            _ => return Err(ProtocolError::Malformed("missing verb".to_string())),
        };
        let rest: Vec<Value> = items.collect();

        let (request_id, body) = match <[Value; 2]>::try_from(rest) {
            Ok([request_id, body]) => (Some(request_id), body),
            Err(rest) if rest.len() <= 1 => (
                None,
                rest.into_iter()
                    .next()
                    .unwrap_or_else(|| Value::Object(Map::new())),
            ),
            Err(_) => return Err(ProtocolError::Malformed("too many elements".to_string())),
        };

        Ok(Self {
            verb,
            request_id,
            body,
        })
    }

    /// Module prefix of a dotted verb (`poll` for `poll.vote`).
    #[must_use]
    pub fn prefix(&self) -> &str {
        self.verb.split('.').next().unwrap_or_default()
    }
}

/// `[requestId, "success", body]`, or `["success", body]` without an id.
#[must_use]
pub fn success_frame(request_id: Option<&Value>, body: Value) -> Value {
    match request_id {
        Some(id) => json!([id, "success", body]),
        None => json!(["success", body]),
    }
}

/// `["error", requestId, {code, message?}]`; the id is omitted when absent.
#[must_use]
pub fn error_frame(request_id: Option<&Value>, code: &str, message: Option<&str>) -> Value {
    let mut detail = Map::new();
    detail.insert("code".to_string(), Value::String(code.to_string()));
    if let Some(message) = message {
        detail.insert("message".to_string(), Value::String(message.to_string()));
    }
    match request_id {
        Some(id) => json!(["error", id, detail]),
        None => json!(["error", detail]),
    }
}

/// Error frame for a `LiveError`, hiding internal details.
#[must_use]
pub fn error_frame_for(request_id: Option<&Value>, error: &LiveError) -> Value {
    error_frame(
        request_id,
        &error.code(),
        error.client_message().as_deref(),
    )
}

/// `[eventType, body]`.
#[must_use]
pub fn push_frame(kind: &str, body: Value) -> Value {
    json!([kind, body])
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_frame() {
        let frame = ClientFrame::parse(r#"["poll.vote", 7, {"id": "x"}]"#).unwrap();
        assert_eq!(frame.verb, "poll.vote");
        assert_eq!(frame.request_id, Some(json!(7)));
        assert_eq!(frame.body, json!({"id": "x"}));
        assert_eq!(frame.prefix(), "poll");
    }

    #[test]
    fn test_parse_short_frames() {
        let ping = ClientFrame::parse(r#"["ping", 1]"#).unwrap();
        assert_eq!(ping.request_id, None);
        assert_eq!(ping.body, json!(1));

        let bare = ClientFrame::parse(r#"["room.leave"]"#).unwrap();
        assert_eq!(bare.body, json!({}));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for text in [
            "not json",
            r#"{"verb": "x"}"#,
            "[]",
            "[1, 2, 3]",
            r#"[""]"#,
            r#"["a", 1, {}, "extra"]"#,
        ] {
            let err = ClientFrame::parse(text).unwrap_err();
            assert_eq!(err.code(), "protocol.malformed", "input: {text}");
        }
    }

    #[test]
    fn test_success_frames() {
        assert_eq!(
            success_frame(Some(&json!(3)), json!({"a": 1})),
            json!([3, "success", {"a": 1}])
        );
        assert_eq!(success_frame(None, json!({})), json!(["success", {}]));
    }

    #[test]
    fn test_error_frames() {
        assert_eq!(
            error_frame(Some(&json!("r1")), "protocol.denied", None),
            json!(["error", "r1", {"code": "protocol.denied"}])
        );
        assert_eq!(
            error_frame(None, "connection.replaced", Some("Connection replaced")),
            json!(["error", {"code": "connection.replaced", "message": "Connection replaced"}])
        );
    }

    #[test]
    fn test_internal_errors_are_hidden() {
        let err = LiveError::Internal("db password is hunter2".to_string());
        let frame = error_frame_for(Some(&json!(1)), &err);
        assert!(!frame.to_string().contains("hunter2"));
        assert_eq!(frame.get(2).unwrap()["code"], "server.error");
    }
}
