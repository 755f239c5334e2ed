//! The contract between the transport and user-supplied subscription producers.

use std::{fmt, future::Future, sync::Arc};

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;

use crate::connection::Context;

/// A type-erased error at the hook and producer boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A boxed [`Producer`], as returned by subscription factories.
pub type BoxProducer = Box<dyn Producer>;

/// Errors surfaced to producers when an emission cannot be delivered.
#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum EmitError {
    /// The operation has been completed or cancelled; nothing more may be emitted for it.
    #[display("operation is no longer active")]
    Completed,

    /// The connection has been closed.
    #[display("connection is closed")]
    Closed,

    /// The underlying socket failed to accept the frame.
    #[display("send failed: {_0}")]
    Transport(#[error(not(source))] BoxError),
}

pub(crate) trait EmitSink: Send + Sync {
    fn emit_next<'a>(&'a self, id: &'a str, payload: Value)
        -> BoxFuture<'a, Result<(), EmitError>>;
}

/// A capability for emitting results of one operation, handed to [`Producer::start`].
///
/// Emissions are delivered in call order: each [`next`](Emitter::next) settles only once the
/// frame has been written, so awaiting it before emitting again is what keeps per-operation
/// ordering intact on the wire.
#[derive(Clone)]
pub struct Emitter {
    pub(crate) sink: Arc<dyn EmitSink>,
    pub(crate) id: Arc<str>,
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Emitter").field(&self.id).finish()
    }
}

impl Emitter {
    /// Returns the id of the operation this emitter is scoped to.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Emits one result payload for the operation.
    pub async fn next(&self, payload: Value) -> Result<(), EmitError> {
        self.sink.emit_next(&self.id, payload).await
    }
}

/// A started subscription's emission source.
///
/// Producers own their resources and are released through [`stop`](Producer::stop). The
/// registry drives one producer per in-flight operation.
pub trait Producer: Send + 'static {
    /// Runs the operation, emitting intermediate results through `emitter`.
    ///
    /// Settling with `Ok(None)` completes the operation; `Ok(Some(errors))` fails it with the
    /// given error descriptors; `Err` is treated as fatal for the whole connection.
    fn start(&mut self, emitter: Emitter) -> BoxFuture<'static, Result<Option<Vec<Value>>, BoxError>>;

    /// Releases the producer's resources and makes the future returned by
    /// [`start`](Producer::start) settle. Must be idempotent.
    fn stop(&mut self) -> BoxFuture<'static, ()>;
}

/// SubscriptionFactory turns an accepted `subscribe` message into a [`Producer`].
///
/// Implementations are provided for closures taking the connection context, the operation id
/// and the (uninterpreted) subscribe payload.
pub trait SubscriptionFactory<E>: Send + Sync + 'static {
    /// Builds the producer for one operation.
    fn subscribe(
        &self,
        ctx: Arc<Context<E>>,
        id: String,
        payload: Value,
    ) -> BoxFuture<'static, Result<BoxProducer, BoxError>>;
}

impl<E, F, Fut> SubscriptionFactory<E> for F
where
    F: Fn(Arc<Context<E>>, String, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<BoxProducer, BoxError>> + Send + 'static,
    E: Send + Sync + 'static,
{
    fn subscribe(
        &self,
        ctx: Arc<Context<E>>,
        id: String,
        payload: Value,
    ) -> BoxFuture<'static, Result<BoxProducer, BoxError>> {
        self(ctx, id, payload).boxed()
    }
}
