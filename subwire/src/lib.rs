//! Server-side core of the [`graphql-transport-ws` GraphQL over WebSocket Protocol][proto],
//! with pluggable payloads.
//!
//! The transport multiplexes long-lived request/response streams over a single WebSocket: a
//! client issues operations under caller-chosen ids, each operation produces zero or more
//! result payloads followed by a completion or error, and either side may cancel or close at
//! any time. Payloads are never interpreted here; a user-supplied [`SubscriptionFactory`]
//! turns each `subscribe` payload into an async [`Producer`].
//!
//! The crate is framework-agnostic: an adapter implements [`Socket`] for its WebSocket
//! library, hands accepted sockets to [`Server::opened`], and drives the returned
//! [`Connection`] with inbound frames.
//!
//! [proto]: https://github.com/enisdenjo/graphql-ws/blob/v5.14.0/PROTOCOL.md

mod codec;
mod connection;
mod keep_alive;
mod message;
mod producer;
mod protocol;
mod registry;
mod server;
mod stream;

use std::{future::Future, sync::Arc, time::Duration};

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;

pub use self::{
    codec::{DecodeError, EncodeError, JsonTransform, MessageCodec},
    connection::{Connection, Context},
    message::Message,
    producer::{BoxError, BoxProducer, EmitError, Emitter, Producer, SubscriptionFactory},
    protocol::{handle_protocols, limit_close_reason, CloseCode, GRAPHQL_TRANSPORT_WS_PROTOCOL},
    server::{Server, Socket},
    stream::StreamProducer,
};

/// Outcome of the [`on_connect`](ServerOptions::on_connect) hook.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectDecision {
    /// Accept the session and acknowledge without a payload.
    Accept,
    /// Accept the session and attach the given payload to the acknowledgement.
    AcceptWithPayload(Value),
    /// Refuse the session. The connection is closed as forbidden.
    Reject,
}

type OnConnect<E> =
    Box<dyn Fn(Arc<Context<E>>) -> BoxFuture<'static, Result<ConnectDecision, BoxError>> + Send + Sync>;
type OnLifecycle<E> =
    Box<dyn Fn(Arc<Context<E>>, u16, String) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;
type OnSubscribe<E> = Box<
    dyn Fn(Arc<Context<E>>, String, Value) -> BoxFuture<'static, Result<Option<Vec<Value>>, BoxError>>
        + Send
        + Sync,
>;
type OnOperation<E> = Box<
    dyn Fn(Arc<Context<E>>, String, BoxProducer) -> BoxFuture<'static, Result<BoxProducer, BoxError>>
        + Send
        + Sync,
>;
type OnNext<E> = Box<
    dyn Fn(Arc<Context<E>>, String, Value) -> BoxFuture<'static, Result<Value, BoxError>>
        + Send
        + Sync,
>;
type OnError<E> = Box<
    dyn Fn(Arc<Context<E>>, String, Vec<Value>) -> BoxFuture<'static, Result<Vec<Value>, BoxError>>
        + Send
        + Sync,
>;
type OnComplete<E> =
    Box<dyn Fn(Arc<Context<E>>, String) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;
type OnPingPong<E> = Box<
    dyn Fn(Arc<Context<E>>, Option<Value>) -> BoxFuture<'static, Result<(), BoxError>>
        + Send
        + Sync,
>;

pub(crate) struct Hooks<E> {
    pub(crate) on_connect: Option<OnConnect<E>>,
    pub(crate) on_disconnect: Option<OnLifecycle<E>>,
    pub(crate) on_close: Option<OnLifecycle<E>>,
    pub(crate) on_subscribe: Option<OnSubscribe<E>>,
    pub(crate) on_operation: Option<OnOperation<E>>,
    pub(crate) on_next: Option<OnNext<E>>,
    pub(crate) on_error: Option<OnError<E>>,
    pub(crate) on_complete: Option<OnComplete<E>>,
    pub(crate) on_ping: Option<OnPingPong<E>>,
    pub(crate) on_pong: Option<OnPingPong<E>>,
}

impl<E> Default for Hooks<E> {
    fn default() -> Self {
        Self {
            on_connect: None,
            on_disconnect: None,
            on_close: None,
            on_subscribe: None,
            on_operation: None,
            on_next: None,
            on_error: None,
            on_complete: None,
            on_ping: None,
            on_pong: None,
        }
    }
}

/// ServerOptions configures the behaviour of every connection a [`Server`] accepts: the
/// subscription factory, timeouts, the wire codec transforms and the optional user hooks.
///
/// `E` is caller-supplied per-connection state, available to every hook and to the factory
/// through [`Context::extra`].
pub struct ServerOptions<E = ()> {
    pub(crate) factory: Box<dyn SubscriptionFactory<E>>,
    pub(crate) connection_init_wait_timeout: Duration,
    pub(crate) keep_alive_interval: Duration,
    pub(crate) max_in_flight_operations: usize,
    pub(crate) production: bool,
    pub(crate) codec: MessageCodec,
    pub(crate) hooks: Hooks<E>,
}

impl<E: Send + Sync + 'static> ServerOptions<E> {
    /// Constructs the options around the given subscription factory, with defaults for
    /// everything else.
    pub fn new(factory: impl SubscriptionFactory<E>) -> Self {
        Self {
            factory: Box::new(factory),
            connection_init_wait_timeout: Duration::from_secs(3),
            keep_alive_interval: Duration::from_secs(12),
            max_in_flight_operations: 0,
            production: production_from_env(),
            codec: MessageCodec::new(),
            hooks: Hooks::default(),
        }
    }

    /// Specifies how long a connection may take to send its first `connection_init` before it
    /// is closed as timed out.
    ///
    /// Specifying a [`Duration::ZERO`] disables the timer. Defaults to 3 seconds.
    #[must_use]
    pub fn with_connection_init_wait_timeout(mut self, timeout: Duration) -> Self {
        self.connection_init_wait_timeout = timeout;
        self
    }

    /// Specifies the interval at which transport-level pings are sent, and within which the
    /// matching pong must arrive before the socket is terminated.
    ///
    /// Specifying a [`Duration::ZERO`] disables keep-alives. Defaults to 12 seconds.
    #[must_use]
    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Specifies the maximum number of in-flight operations that a connection can have.
    ///
    /// Attempting to start more fails that operation with an error message; the connection
    /// stays open. By default there is no limit.
    #[must_use]
    pub fn with_max_in_flight_operations(mut self, max: usize) -> Self {
        self.max_in_flight_operations = max;
        self
    }

    /// Forces production mode on or off.
    ///
    /// In production mode, close reasons derived from internal errors are replaced with a
    /// generic message. Defaults to whether the `SUBWIRE_ENV` environment variable is set to
    /// `production`.
    #[must_use]
    pub fn with_production(mut self, production: bool) -> Self {
        self.production = production;
        self
    }

    /// Specifies a key/value transform applied while encoding outbound messages.
    #[must_use]
    pub fn with_json_replacer(
        mut self,
        replacer: impl Fn(&str, Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.codec = self.codec.with_replacer(Arc::new(replacer));
        self
    }

    /// Specifies a key/value transform applied while decoding inbound messages.
    #[must_use]
    pub fn with_json_reviver(
        mut self,
        reviver: impl Fn(&str, Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.codec = self.codec.with_reviver(Arc::new(reviver));
        self
    }

    /// Installs a hook invoked when a `connection_init` is received, deciding whether the
    /// session is accepted. Absent, every session is accepted without a payload.
    #[must_use]
    pub fn on_connect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<Context<E>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ConnectDecision, BoxError>> + Send + 'static,
    {
        self.hooks.on_connect = Some(Box::new(move |ctx| hook(ctx).boxed()));
        self
    }

    /// Installs a hook invoked when an acknowledged connection closes, with the observed
    /// close code and reason.
    #[must_use]
    pub fn on_disconnect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<Context<E>>, u16, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.hooks.on_disconnect = Some(Box::new(move |ctx, code, reason| {
            hook(ctx, code, reason).boxed()
        }));
        self
    }

    /// Installs a hook invoked when any connection closes, acknowledged or not.
    #[must_use]
    pub fn on_close<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<Context<E>>, u16, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.hooks.on_close = Some(Box::new(move |ctx, code, reason| {
            hook(ctx, code, reason).boxed()
        }));
        self
    }

    /// Installs a hook invoked for every accepted `subscribe` before the factory runs.
    /// Returning error descriptors fails the operation without constructing a producer.
    #[must_use]
    pub fn on_subscribe<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<Context<E>>, String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Vec<Value>>, BoxError>> + Send + 'static,
    {
        self.hooks.on_subscribe = Some(Box::new(move |ctx, id, payload| {
            hook(ctx, id, payload).boxed()
        }));
        self
    }

    /// Installs a hook invoked with the factory-built producer before it is started. The
    /// returned producer is the one that runs, allowing substitution or decoration.
    #[must_use]
    pub fn on_operation<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<Context<E>>, String, BoxProducer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<BoxProducer, BoxError>> + Send + 'static,
    {
        self.hooks.on_operation = Some(Box::new(move |ctx, id, producer| {
            hook(ctx, id, producer).boxed()
        }));
        self
    }

    /// Installs a hook invoked for every result payload before it is emitted, allowing
    /// transformation.
    #[must_use]
    pub fn on_next<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<Context<E>>, String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        self.hooks.on_next = Some(Box::new(move |ctx, id, payload| {
            hook(ctx, id, payload).boxed()
        }));
        self
    }

    /// Installs a hook invoked for every operation error list before it is emitted, allowing
    /// transformation.
    #[must_use]
    pub fn on_error<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<Context<E>>, String, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Value>, BoxError>> + Send + 'static,
    {
        self.hooks.on_error = Some(Box::new(move |ctx, id, errors| {
            hook(ctx, id, errors).boxed()
        }));
        self
    }

    /// Installs a hook invoked whenever an installed operation terminates, for any reason.
    #[must_use]
    pub fn on_complete<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<Context<E>>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.hooks.on_complete = Some(Box::new(move |ctx, id| hook(ctx, id).boxed()));
        self
    }

    /// Installs a hook invoked for inbound protocol `ping` messages. When set, the automatic
    /// `pong` reply is suppressed and replying becomes the hook's responsibility.
    #[must_use]
    pub fn on_ping<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<Context<E>>, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.hooks.on_ping = Some(Box::new(move |ctx, payload| hook(ctx, payload).boxed()));
        self
    }

    /// Installs a hook invoked for inbound protocol `pong` messages, which are otherwise
    /// ignored.
    #[must_use]
    pub fn on_pong<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<Context<E>>, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.hooks.on_pong = Some(Box::new(move |ctx, payload| hook(ctx, payload).boxed()));
        self
    }
}

fn production_from_env() -> bool {
    std::env::var("SUBWIRE_ENV").is_ok_and(|v| v == "production")
}
