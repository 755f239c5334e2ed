//! Subprotocol negotiation and WebSocket close codes.

/// The WebSocket subprotocol token advertised and accepted during the upgrade.
pub const GRAPHQL_TRANSPORT_WS_PROTOCOL: &str = "graphql-transport-ws";

/// The WebSocket close-frame reason is limited to 123 UTF-8 bytes.
const CLOSE_REASON_MAX_BYTES: usize = 123;

/// Selects the supported subprotocol from the client-offered identifiers.
///
/// Accepts any iterable of string-likes; each offered item may itself be a comma or
/// whitespace separated list, as in a raw `Sec-WebSocket-Protocol` header value. Tokens are
/// matched by exact equality after splitting and trimming, regardless of position. Returns
/// [`None`] when no offered form contains the supported token.
pub fn handle_protocols<I>(offered: I) -> Option<&'static str>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    offered
        .into_iter()
        .flat_map(|item| {
            item.as_ref()
                .split(',')
                .flat_map(str::split_whitespace)
                .map(str::to_owned)
                .collect::<Vec<_>>()
        })
        .any(|token| token == GRAPHQL_TRANSPORT_WS_PROTOCOL)
        .then_some(GRAPHQL_TRANSPORT_WS_PROTOCOL)
}

/// Close codes emitted by the transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseCode {
    /// Malformed or unexpected message.
    BadRequest,
    /// Subscribe attempted before the session was acknowledged.
    Unauthorized,
    /// The connection acceptance hook refused the session.
    Forbidden,
    /// The client did not initialise the session in time.
    ConnectionInitialisationTimeout,
    /// An operation with the same id is already in flight.
    SubscriberAlreadyExists,
    /// A superfluous ConnectionInit was received.
    TooManyInitialisationRequests,
    /// An unhandled producer or handler error.
    InternalServerError,
    /// The socket was accepted without negotiating the supported subprotocol.
    SubprotocolNotAcceptable,
    /// The server is shutting down.
    GoingAway,
}

impl CloseCode {
    /// Returns the WebSocket close code.
    pub fn code(self) -> u16 {
        match self {
            Self::BadRequest => 4400,
            Self::Unauthorized => 4401,
            Self::Forbidden => 4403,
            Self::ConnectionInitialisationTimeout => 4408,
            Self::SubscriberAlreadyExists => 4409,
            Self::TooManyInitialisationRequests => 4429,
            Self::InternalServerError => 4500,
            Self::SubprotocolNotAcceptable => 4406,
            Self::GoingAway => 1001,
        }
    }

    /// Returns the default close reason for this code.
    pub fn reason(self) -> &'static str {
        match self {
            Self::BadRequest => "Bad request",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::ConnectionInitialisationTimeout => "Connection initialisation timeout",
            Self::SubscriberAlreadyExists => "Subscriber already exists",
            Self::TooManyInitialisationRequests => "Too many initialisation requests",
            Self::InternalServerError => "Internal server error",
            Self::SubprotocolNotAcceptable => "Subprotocol not acceptable",
            Self::GoingAway => "Going away",
        }
    }
}

/// Fits a close reason into the WebSocket close-frame limit.
///
/// Reasons derived from arbitrary error text can exceed the frame limit; such reasons are
/// swapped for the (known short) fallback instead of being cut mid-sentence.
pub fn limit_close_reason(reason: String, fallback: &'static str) -> String {
    if reason.len() <= CLOSE_REASON_MAX_BYTES {
        reason
    } else {
        fallback.into()
    }
}
