//! The protocol message envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message defines the envelope of every protocol message, in both directions.
///
/// Payloads are carried opaquely as [`serde_json::Value`]s and are never interpreted by the
/// transport. The `type` tag is the only field the transport dispatches on; `id`-bearing
/// variants name one in-flight operation on the connection.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "type")]
pub enum Message {
    /// ConnectionInit is sent by the client upon connecting, beginning the session.
    ConnectionInit {
        /// Optional parameters of any type sent from the client. These are often used for
        /// authentication.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// ConnectionAck is sent in response to a ConnectionInit message if the server accepted
    /// the session.
    ConnectionAck {
        /// Optional payload returned by the connection acceptance hook.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Ping is a liveness probe. Either side may send it at any time.
    Ping {
        /// Optional parameters of any type used to transfer additional details about the ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Pong is the response to a Ping message, echoing its payload.
    Pong {
        /// Optional parameters of any type used to transfer additional details about the pong.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Subscribe requests an operation specified in the message payload.
    Subscribe {
        /// The id of the operation. This can be anything, but must be unique. If there are
        /// other in-flight operations with the same id, the message will cause an error.
        id: String,

        /// The operation payload. Its schema belongs to the caller; the transport hands it to
        /// the subscription factory untouched.
        payload: Value,
    },
    /// Next contains an intermediate result of a running operation.
    Next {
        /// The id of the operation that the result is for.
        id: String,

        /// The result payload.
        payload: Value,
    },
    /// Error indicates that an operation failed before or during execution. It terminates the
    /// operation; no Complete follows it.
    Error {
        /// The id of the operation that triggered this error.
        id: String,

        /// One or more error descriptors. Never empty.
        payload: Vec<Value>,
    },
    /// Complete indicates the end of an operation. Sent by the server once an operation is
    /// done, or by the client to cancel one.
    Complete {
        /// The id of the operation that has completed.
        id: String,
    },
}

impl Message {
    /// Returns the operation id for id-bearing messages.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Subscribe { id, .. }
            | Self::Next { id, .. }
            | Self::Error { id, .. }
            | Self::Complete { id } => Some(id),
            _ => None,
        }
    }

    /// Returns the `type` tag of this message as it appears on the wire.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::ConnectionInit { .. } => "connection_init",
            Self::ConnectionAck { .. } => "connection_ack",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Subscribe { .. } => "subscribe",
            Self::Next { .. } => "next",
            Self::Error { .. } => "error",
            Self::Complete { .. } => "complete",
        }
    }
}
