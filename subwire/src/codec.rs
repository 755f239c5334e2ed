//! JSON codec for protocol messages.

use std::sync::Arc;

use serde_json::Value;

use crate::message::Message;

/// A key/value transform applied while encoding or decoding messages.
///
/// Works like the `JSON.stringify` replacer and `JSON.parse` reviver: it is invoked once per
/// key/value pair (object keys, stringified array indices and the root under the empty key)
/// and its return value takes the pair's place. The replacer runs top-down from the root, the
/// reviver bottom-up towards it.
pub type JsonTransform = Arc<dyn Fn(&str, Value) -> Value + Send + Sync>;

/// Errors that can occur while decoding an inbound frame.
///
/// Distinguishes text that is not JSON at all from well-formed JSON that is not a valid
/// protocol message.
#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum DecodeError {
    /// The frame is not parseable as JSON.
    #[display("invalid JSON: {_0}")]
    InvalidJson(serde_json::Error),

    /// The frame is JSON, but not a valid protocol message.
    #[display("{_0}")]
    #[error(ignore)]
    InvalidMessage(String),
}

/// Errors that can occur while encoding an outbound message.
#[derive(Debug, derive_more::Display, derive_more::Error, derive_more::From)]
#[display("message is not serializable: {_0}")]
pub struct EncodeError(serde_json::Error);

/// Encodes and decodes protocol messages to and from wire text.
///
/// The codec validates the message envelope only; payloads pass through untouched (modulo the
/// configured transforms).
#[derive(Clone, Default)]
pub struct MessageCodec {
    replacer: Option<JsonTransform>,
    reviver: Option<JsonTransform>,
}

impl MessageCodec {
    /// Creates a codec without any transforms.
    pub fn new() -> Self {
        Self::default()
    }

    /// Specifies a transform applied to every key/value pair while encoding.
    #[must_use]
    pub fn with_replacer(mut self, replacer: JsonTransform) -> Self {
        self.replacer = Some(replacer);
        self
    }

    /// Specifies a transform applied to every key/value pair while decoding.
    #[must_use]
    pub fn with_reviver(mut self, reviver: JsonTransform) -> Self {
        self.reviver = Some(reviver);
        self
    }

    /// Serialises a message to wire text.
    pub fn encode(&self, message: &Message) -> Result<String, EncodeError> {
        let mut value = serde_json::to_value(message)?;
        if let Some(replacer) = &self.replacer {
            value = replace("", value, replacer);
        }
        Ok(serde_json::to_string(&value)?)
    }

    /// Parses and validates a message from wire text.
    pub fn decode(&self, text: &str) -> Result<Message, DecodeError> {
        let mut value: Value = serde_json::from_str(text).map_err(DecodeError::InvalidJson)?;
        if let Some(reviver) = &self.reviver {
            value = revive("", value, reviver);
        }
        validate(&value)?;
        serde_json::from_value(value).map_err(|e| DecodeError::InvalidMessage(e.to_string()))
    }
}

fn replace(key: &str, value: Value, f: &JsonTransform) -> Value {
    match f(key, value) {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    let v = replace(&k, v, f);
                    (k, v)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .enumerate()
                .map(|(i, v)| replace(&i.to_string(), v, f))
                .collect(),
        ),
        v => v,
    }
}

fn revive(key: &str, value: Value, f: &JsonTransform) -> Value {
    let value = match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    let v = revive(&k, v, f);
                    (k, v)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .enumerate()
                .map(|(i, v)| revive(&i.to_string(), v, f))
                .collect(),
        ),
        v => v,
    };
    f(key, value)
}

fn validate(value: &Value) -> Result<(), DecodeError> {
    let invalid = |msg: String| Err(DecodeError::InvalidMessage(msg));

    let Some(obj) = value.as_object() else {
        return invalid(format!(
            "message is expected to be an object, but got {}",
            json_type_name(value),
        ));
    };

    let Some(tag) = obj.get("type") else {
        return invalid("message is missing the 'type' property".into());
    };
    let Some(tag) = tag.as_str() else {
        return invalid("message 'type' property is expected to be a string".into());
    };

    let id_of = |obj: &serde_json::Map<String, Value>| -> Result<(), DecodeError> {
        match obj.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => Ok(()),
            _ => Err(DecodeError::InvalidMessage(format!(
                "'{tag}' message expects a non-empty 'id' property",
            ))),
        }
    };

    // A `null` payload counts as absent, like every other nullable field on the wire.
    let payload = obj.get("payload").filter(|p| !p.is_null());

    match tag {
        "connection_init" | "connection_ack" | "ping" | "pong" => match payload {
            Some(p) if !p.is_object() => invalid(format!(
                "'{tag}' message expects the 'payload' property to be an object",
            )),
            _ => Ok(()),
        },
        "subscribe" | "next" => {
            id_of(obj)?;
            if payload.is_none() {
                return invalid(format!("'{tag}' message expects a 'payload' property"));
            }
            Ok(())
        }
        "error" => {
            id_of(obj)?;
            match payload.and_then(Value::as_array) {
                Some(errors) if !errors.is_empty() => Ok(()),
                _ => invalid(
                    "'error' message expects the 'payload' property to be a non-empty array"
                        .into(),
                ),
            }
        }
        "complete" => id_of(obj),
        _ => invalid(format!("invalid message 'type' property {tag:?}")),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_round_trip() {
        let codec = MessageCodec::new();
        let messages = vec![
            Message::ConnectionInit { payload: None },
            Message::ConnectionInit {
                payload: Some(json!({"token": "secret"})),
            },
            Message::ConnectionAck { payload: None },
            Message::Ping { payload: None },
            Message::Pong {
                payload: Some(json!({"iCome": "back"})),
            },
            Message::Subscribe {
                id: "1".into(),
                payload: json!({"query": "subscription { greetings }"}),
            },
            Message::Next {
                id: "1".into(),
                payload: json!({"data": {"greetings": "Hi"}}),
            },
            Message::Error {
                id: "1".into(),
                payload: vec![json!({"message": "kaboom"})],
            },
            Message::Complete { id: "1".into() },
        ];
        for message in messages {
            let text = codec.encode(&message).unwrap();
            assert_eq!(codec.decode(&text).unwrap(), message);
        }
    }

    #[test]
    fn test_not_json_is_distinguished_from_bad_shape() {
        let codec = MessageCodec::new();
        assert!(matches!(
            codec.decode("not json at all"),
            Err(DecodeError::InvalidJson(_)),
        ));
        assert!(matches!(
            codec.decode("[]"),
            Err(DecodeError::InvalidMessage(_)),
        ));
    }

    #[test]
    fn test_rejects_invalid_shapes() {
        let codec = MessageCodec::new();
        for text in [
            r#"{"payload":{}}"#,
            r#"{"type":"gibberish"}"#,
            r#"{"type":7}"#,
            r#"{"type":"subscribe","payload":{"query":"{ __typename }"}}"#,
            r#"{"type":"subscribe","id":"","payload":{"query":"{ __typename }"}}"#,
            r#"{"type":"subscribe","id":"1"}"#,
            r#"{"type":"complete"}"#,
            r#"{"type":"error","id":"1","payload":[]}"#,
            r#"{"type":"error","id":"1","payload":{"message":"nope"}}"#,
            r#"{"type":"ping","payload":"pling"}"#,
        ] {
            assert!(
                matches!(codec.decode(text), Err(DecodeError::InvalidMessage(_))),
                "expected shape error for {text}",
            );
        }
    }

    #[test]
    fn test_null_payload_counts_as_absent() {
        let codec = MessageCodec::new();
        assert_eq!(
            codec
                .decode(r#"{"type":"connection_init","payload":null}"#)
                .unwrap(),
            Message::ConnectionInit { payload: None },
        );
    }

    #[test]
    fn test_replacer_rewrites_type() {
        let codec = MessageCodec::new().with_replacer(Arc::new(|key, value| {
            if key == "type" && value == json!("connection_ack") {
                json!("CONNECTION_ACK")
            } else {
                value
            }
        }));
        assert_eq!(
            codec
                .encode(&Message::ConnectionAck { payload: None })
                .unwrap(),
            r#"{"type":"CONNECTION_ACK"}"#,
        );
    }

    #[test]
    fn test_reviver_round_trips_replacer() {
        let replaced = MessageCodec::new()
            .with_replacer(Arc::new(|key, value| {
                if key == "type" {
                    if let Some(tag) = value.as_str() {
                        return json!(tag.to_uppercase());
                    }
                }
                value
            }))
            .encode(&Message::Complete { id: "1".into() })
            .unwrap();
        assert_eq!(replaced, r#"{"type":"COMPLETE","id":"1"}"#);

        let codec = MessageCodec::new().with_reviver(Arc::new(|key, value| {
            if key == "type" {
                if let Some(tag) = value.as_str() {
                    return json!(tag.to_lowercase());
                }
            }
            value
        }));
        assert_eq!(
            codec.decode(&replaced).unwrap(),
            Message::Complete { id: "1".into() },
        );
    }
}
