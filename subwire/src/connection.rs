//! Per-connection state machine and message orchestration.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::{sync::Notify, task::JoinHandle};

use crate::{
    keep_alive::KeepAlive,
    message::Message,
    producer::{BoxError, EmitError, EmitSink, Emitter},
    protocol::{limit_close_reason, CloseCode},
    registry::{Entry, Registry},
    server::Socket,
    ConnectDecision, ServerOptions,
};

/// Per-connection context, shared with every hook and the subscription factory.
///
/// Created when the socket is opened, mutated only by the orchestrator, and dropped once the
/// connection is torn down.
pub struct Context<E> {
    extra: E,
    shared: Mutex<ContextShared>,
}

#[derive(Default)]
struct ContextShared {
    connection_params: Option<Value>,
    connection_init_received: bool,
    acknowledged: bool,
}

impl<E> Context<E> {
    pub(crate) fn new(extra: E) -> Self {
        Self {
            extra,
            shared: Mutex::new(ContextShared::default()),
        }
    }

    /// The caller-supplied per-connection state.
    pub fn extra(&self) -> &E {
        &self.extra
    }

    /// The parameters the client attached to its `connection_init`, if any.
    pub fn connection_params(&self) -> Option<Value> {
        self.shared.lock().connection_params.clone()
    }

    /// Whether a `connection_init` has been received. Set before the
    /// [`on_connect`](crate::ServerOptions::on_connect) hook runs.
    pub fn connection_init_received(&self) -> bool {
        self.shared.lock().connection_init_received
    }

    /// Whether the session has been acknowledged. `subscribe` is legal only afterwards.
    pub fn acknowledged(&self) -> bool {
        self.shared.lock().acknowledged
    }
}

/// A live connection, as handed to the adapter by [`Server::opened`](crate::Server::opened).
///
/// The adapter drives it with inbound frames through [`message`](Connection::message) (awaited
/// per frame, which is what keeps inbound processing in arrival order), reports transport-level
/// pongs through [`pong_received`](Connection::pong_received), and invokes
/// [`closed`](Connection::closed) once the socket has been observed closed.
pub struct Connection<E> {
    pub(crate) inner: Arc<Inner<E>>,
}

impl<E: Send + Sync + 'static> Connection<E> {
    /// The connection's context.
    pub fn context(&self) -> Arc<Context<E>> {
        Arc::clone(&self.inner.ctx)
    }

    /// Handles one inbound text frame.
    pub async fn message(&self, text: &str) {
        self.inner.handle_message(text).await;
    }

    /// Handles an inbound binary frame, which the protocol does not allow.
    pub async fn binary_received(&self) {
        self.inner
            .close(
                CloseCode::BadRequest.code(),
                "Only text frames are accepted",
            )
            .await;
    }

    /// Reports a transport-level pong frame, keeping the connection alive.
    pub fn pong_received(&self) {
        self.inner.pong.notify_one();
    }

    /// Runs the teardown sequence once the socket has been observed closed: stops every
    /// producer, awaits their completion, and invokes the completion and close hooks.
    pub async fn closed(&self, code: u16, reason: &str) {
        self.inner.handle_closed(code, reason).await;
    }
}

pub(crate) struct Inner<E> {
    pub(crate) options: Arc<ServerOptions<E>>,
    pub(crate) socket: Arc<dyn Socket>,
    pub(crate) ctx: Arc<Context<E>>,
    registry: Mutex<Registry>,
    /// Set once the connection is closing; inbound messages are discarded and outbound sends
    /// become no-ops from then on.
    closing: AtomicBool,
    /// Set once teardown has run, making `closed` idempotent.
    cleaned: AtomicBool,
    send_gate: tokio::sync::Mutex<()>,
    init_timer: Mutex<Option<JoinHandle<()>>>,
    keep_alive: Mutex<Option<KeepAlive>>,
    pub(crate) pong: Arc<Notify>,
}

impl<E: Send + Sync + 'static> Inner<E> {
    pub(crate) fn new(
        options: Arc<ServerOptions<E>>,
        socket: Arc<dyn Socket>,
        extra: E,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            socket,
            ctx: Arc::new(Context::new(extra)),
            registry: Mutex::new(Registry::default()),
            closing: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
            send_gate: tokio::sync::Mutex::new(()),
            init_timer: Mutex::new(None),
            keep_alive: Mutex::new(None),
            pong: Arc::new(Notify::new()),
        })
    }

    pub(crate) fn start_timers(self: &Arc<Self>) {
        let timeout = self.options.connection_init_wait_timeout;
        if !timeout.is_zero() {
            let weak = Arc::downgrade(self);
            *self.init_timer.lock() = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = weak.upgrade() {
                    if !inner.ctx.connection_init_received() {
                        inner
                            .close(
                                CloseCode::ConnectionInitialisationTimeout.code(),
                                CloseCode::ConnectionInitialisationTimeout.reason(),
                            )
                            .await;
                    }
                }
            }));
        }

        let interval = self.options.keep_alive_interval;
        if !interval.is_zero() {
            *self.keep_alive.lock() = Some(KeepAlive::start(
                Arc::clone(&self.socket),
                interval,
                Arc::clone(&self.pong),
            ));
        }
    }

    fn cancel_init_timer(&self) {
        if let Some(timer) = self.init_timer.lock().take() {
            timer.abort();
        }
    }

    fn shutdown_timers(&self) {
        self.cancel_init_timer();
        if let Some(keep_alive) = self.keep_alive.lock().take() {
            keep_alive.abort();
        }
    }

    /// Closes the connection. Later calls, sends and inbound messages are no-ops.
    pub(crate) async fn close(&self, code: u16, reason: &str) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_timers();
        tracing::debug!(code, reason, "closing connection");
        if let Err(e) = self.socket.close(code, reason.into()).await {
            tracing::warn!(error = %e, "failed to close socket");
        }
    }

    async fn internal_close(&self, message: &str) {
        let fallback = CloseCode::InternalServerError.reason();
        let reason = if self.options.production {
            fallback.into()
        } else {
            limit_close_reason(message.into(), fallback)
        };
        self.close(CloseCode::InternalServerError.code(), &reason)
            .await;
    }

    /// Sends one message, holding the send gate so frames of concurrent operations are
    /// serialised onto the socket. No-op once the connection is closing.
    async fn send_message(&self, message: &Message) -> Result<(), BoxError> {
        if self.closing.load(Ordering::SeqCst) {
            return Ok(());
        }
        let text = self.options.codec.encode(message)?;
        let _gate = self.send_gate.lock().await;
        if self.closing.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.socket.send(text).await
    }

    async fn emit_error(&self, id: &str, errors: Vec<Value>) -> Result<(), BoxError> {
        let errors = match &self.options.hooks.on_error {
            Some(hook) => hook(Arc::clone(&self.ctx), id.into(), errors).await?,
            None => errors,
        };
        self.send_message(&Message::Error {
            id: id.into(),
            payload: errors,
        })
        .await
    }

    async fn invoke_on_complete(&self, id: &str) -> Result<(), BoxError> {
        if let Some(hook) = &self.options.hooks.on_complete {
            hook(Arc::clone(&self.ctx), id.into()).await?;
        }
        Ok(())
    }

    pub(crate) async fn handle_message(self: &Arc<Self>, text: &str) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        match self.options.codec.decode(text) {
            Err(e) => {
                let reason = limit_close_reason(e.to_string(), CloseCode::BadRequest.reason());
                self.close(CloseCode::BadRequest.code(), &reason).await;
            }
            Ok(message) => {
                if let Err(e) = self.dispatch(message).await {
                    self.internal_close(&e.to_string()).await;
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, message: Message) -> Result<(), BoxError> {
        match message {
            Message::ConnectionInit { payload } => self.handle_connection_init(payload).await,
            Message::Ping { payload } => self.handle_ping(payload).await,
            Message::Pong { payload } => {
                if let Some(hook) = &self.options.hooks.on_pong {
                    hook(Arc::clone(&self.ctx), payload).await?;
                }
                Ok(())
            }
            Message::Subscribe { id, payload } => self.handle_subscribe(id, payload).await,
            Message::Complete { id } => self.handle_complete(&id).await,
            message @ (Message::ConnectionAck { .. }
            | Message::Next { .. }
            | Message::Error { .. }) => {
                self.close(
                    CloseCode::BadRequest.code(),
                    &format!("Unexpected message of type {:?} received", message.type_tag()),
                )
                .await;
                Ok(())
            }
        }
    }

    async fn handle_connection_init(&self, payload: Option<Value>) -> Result<(), BoxError> {
        let duplicate = {
            let mut shared = self.ctx.shared.lock();
            if shared.connection_init_received {
                true
            } else {
                shared.connection_init_received = true;
                shared.connection_params = payload;
                false
            }
        };
        if duplicate {
            let code = CloseCode::TooManyInitialisationRequests;
            self.close(code.code(), code.reason()).await;
            return Ok(());
        }

        // The init timer must not fire while the hook below runs.
        self.cancel_init_timer();

        let decision = match &self.options.hooks.on_connect {
            Some(hook) => hook(Arc::clone(&self.ctx)).await?,
            None => ConnectDecision::Accept,
        };
        let payload = match decision {
            ConnectDecision::Reject => {
                self.close(CloseCode::Forbidden.code(), CloseCode::Forbidden.reason())
                    .await;
                return Ok(());
            }
            ConnectDecision::Accept => None,
            ConnectDecision::AcceptWithPayload(payload) => Some(payload),
        };
        self.send_message(&Message::ConnectionAck { payload }).await?;
        self.ctx.shared.lock().acknowledged = true;
        Ok(())
    }

    async fn handle_ping(&self, payload: Option<Value>) -> Result<(), BoxError> {
        match &self.options.hooks.on_ping {
            Some(hook) => hook(Arc::clone(&self.ctx), payload).await?,
            None => self.send_message(&Message::Pong { payload }).await?,
        }
        Ok(())
    }

    async fn handle_subscribe(self: &Arc<Self>, id: String, payload: Value) -> Result<(), BoxError> {
        if !self.ctx.acknowledged() {
            self.close(
                CloseCode::Unauthorized.code(),
                CloseCode::Unauthorized.reason(),
            )
            .await;
            return Ok(());
        }

        if self.registry.lock().reserve(&id).is_err() {
            let reason = limit_close_reason(
                format!("Subscriber for {id} already exists"),
                CloseCode::SubscriberAlreadyExists.reason(),
            );
            self.close(CloseCode::SubscriberAlreadyExists.code(), &reason)
                .await;
            return Ok(());
        }

        let max = self.options.max_in_flight_operations;
        if max > 0 && self.registry.lock().in_flight() > max {
            self.registry.lock().remove(&id);
            self.emit_error(
                &id,
                vec![serde_json::json!({"message": "Too many in-flight operations"})],
            )
            .await?;
            return Ok(());
        }

        // The subscribe is handled once the reservation is in and the producer task is
        // scheduled; the factory and producer run independently so a live operation cannot
        // stall the inbound pipeline. The task is attached under the registry lock so it
        // cannot observe its own reservation without a task handle.
        let inner = Arc::clone(self);
        let task_id = id.clone();
        let mut registry = self.registry.lock();
        let task = tokio::spawn(async move { inner.run_operation(task_id, payload).await });
        registry.attach_task(&id, task);
        Ok(())
    }

    async fn run_operation(self: Arc<Self>, id: String, payload: Value) {
        if let Err(e) = self.operation(&id, payload).await {
            self.internal_close(&e.to_string()).await;
        }
    }

    async fn operation(self: &Arc<Self>, id: &str, payload: Value) -> Result<(), BoxError> {
        if let Some(hook) = &self.options.hooks.on_subscribe {
            if let Some(errors) = hook(Arc::clone(&self.ctx), id.into(), payload.clone()).await? {
                self.emit_error(id, errors).await?;
                self.registry.lock().remove(id);
                return Ok(());
            }
        }

        if self.closing.load(Ordering::SeqCst) || !self.registry.lock().contains(id) {
            return Ok(());
        }

        let mut producer = self
            .options
            .factory
            .subscribe(Arc::clone(&self.ctx), id.into(), payload)
            .await?;
        if let Some(hook) = &self.options.hooks.on_operation {
            producer = hook(Arc::clone(&self.ctx), id.into(), producer).await?;
        }

        let emitter = Emitter {
            sink: Arc::clone(self) as Arc<dyn EmitSink>,
            id: id.into(),
        };
        let started = producer.start(emitter);

        let installed = if self.closing.load(Ordering::SeqCst) {
            Err(producer)
        } else {
            self.registry.lock().install(id, producer)
        };
        if let Err(mut producer) = installed {
            // Cancelled (or the connection closed) while the producer was being prepared.
            // Cleanup cannot rely on the close pipeline reaching this operation.
            producer.stop().await;
            started.await.ok();
            return Ok(());
        }

        let settled = started.await;
        let entry = self.registry.lock().remove(id);
        match settled {
            Ok(None) => {
                if let Some(entry) = entry {
                    stop_entry(entry).await;
                    self.send_message(&Message::Complete { id: id.into() }).await?;
                    self.invoke_on_complete(id).await?;
                }
                Ok(())
            }
            Ok(Some(errors)) => {
                if let Some(entry) = entry {
                    stop_entry(entry).await;
                    self.emit_error(id, errors).await?;
                    self.invoke_on_complete(id).await?;
                }
                Ok(())
            }
            Err(e) => match entry {
                Some(entry) => {
                    stop_entry(entry).await;
                    Err(e)
                }
                None => Ok(()),
            },
        }
    }

    async fn handle_complete(&self, id: &str) -> Result<(), BoxError> {
        let entry = self.registry.lock().remove(id);
        let Some(entry) = entry else {
            return Ok(());
        };
        let (producer, task) = entry.into_parts();
        if let Some(mut producer) = producer {
            producer.stop().await;
            if let Some(task) = task {
                task.await.ok();
            }
            self.invoke_on_complete(id).await?;
        }
        // A bare reservation has no producer yet; its task observes the missing entry and
        // releases whatever the factory hands back.
        Ok(())
    }

    pub(crate) async fn handle_closed(&self, code: u16, reason: &str) {
        self.closing.store(true, Ordering::SeqCst);
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_timers();
        tracing::debug!(code, reason, "connection closed");

        let entries: Vec<(String, Entry)> = {
            let mut registry = self.registry.lock();
            registry
                .snapshot_ids()
                .into_iter()
                .filter_map(|id| registry.remove(&id).map(|entry| (id, entry)))
                .collect()
        };
        for (id, entry) in entries {
            let (producer, task) = entry.into_parts();
            if let Some(mut producer) = producer {
                producer.stop().await;
                if let Some(task) = task {
                    task.await.ok();
                }
                if let Some(hook) = &self.options.hooks.on_complete {
                    if let Err(e) = hook(Arc::clone(&self.ctx), id.clone()).await {
                        tracing::warn!(id = %id, error = %e, "on_complete failed during teardown");
                    }
                }
            } else if let Some(task) = task {
                // A bare reservation never started a producer: there is nothing to stop and
                // no completion to report. Its factory may be stuck, so cancel the task
                // rather than wait on it.
                task.abort();
            }
        }

        if self.ctx.acknowledged() {
            if let Some(hook) = &self.options.hooks.on_disconnect {
                if let Err(e) = hook(Arc::clone(&self.ctx), code, reason.into()).await {
                    tracing::warn!(error = %e, "on_disconnect failed during teardown");
                }
            }
        }
        if let Some(hook) = &self.options.hooks.on_close {
            if let Err(e) = hook(Arc::clone(&self.ctx), code, reason.into()).await {
                tracing::warn!(error = %e, "on_close failed during teardown");
            }
        }
    }

    /// Closes the connection because the whole server is shutting down, surfacing the socket
    /// close error to the caller.
    pub(crate) async fn dispose(&self) -> Result<(), BoxError> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown_timers();
        self.socket
            .close(
                CloseCode::GoingAway.code(),
                CloseCode::GoingAway.reason().into(),
            )
            .await
    }
}

async fn stop_entry(entry: Entry) {
    let (producer, task) = entry.into_parts();
    if let Some(mut producer) = producer {
        producer.stop().await;
    }
    // The task handle is the running operation itself; it is never awaited from within.
    drop(task);
}

impl<E: Send + Sync + 'static> EmitSink for Inner<E> {
    fn emit_next<'a>(
        &'a self,
        id: &'a str,
        payload: Value,
    ) -> BoxFuture<'a, Result<(), EmitError>> {
        self.emit(id, payload).boxed()
    }
}

impl<E: Send + Sync + 'static> Inner<E> {
    async fn emit(&self, id: &str, payload: Value) -> Result<(), EmitError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(EmitError::Closed);
        }
        if !self.registry.lock().contains(id) {
            return Err(EmitError::Completed);
        }
        let payload = match &self.options.hooks.on_next {
            Some(hook) => match hook(Arc::clone(&self.ctx), id.into(), payload).await {
                Ok(payload) => payload,
                Err(e) => {
                    self.internal_close(&e.to_string()).await;
                    return Err(EmitError::Transport(e));
                }
            },
            None => payload,
        };
        match self
            .send_message(&Message::Next {
                id: id.into(),
                payload,
            })
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                self.internal_close(&e.to_string()).await;
                Err(EmitError::Transport(e))
            }
        }
    }
}
