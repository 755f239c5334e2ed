//! The server entry point and the contract an adapter's socket must satisfy.

use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::{
    connection::{Connection, Inner},
    producer::BoxError,
    protocol::{handle_protocols, CloseCode},
    ServerOptions,
};

/// The transport surface an adapter provides for one accepted WebSocket.
///
/// Implementations wrap a concrete socket library's write half. All methods take `&self`;
/// implementations synchronise internally. `ping` and `terminate` exist for the keep-alive
/// driver: `ping` sends a transport-level ping frame (not a protocol `ping` message) and
/// `terminate` drops the connection abruptly, without a close frame.
pub trait Socket: Send + Sync + 'static {
    /// The subprotocol token selected during the WebSocket upgrade.
    fn protocol(&self) -> &str;

    /// Writes one text frame. Settles once written, or fails.
    fn send(&self, text: String) -> BoxFuture<'_, Result<(), BoxError>>;

    /// Sends a close frame with the given code and reason.
    fn close(&self, code: u16, reason: String) -> BoxFuture<'_, Result<(), BoxError>>;

    /// Sends a transport-level ping frame.
    fn ping(&self, payload: Vec<u8>) -> BoxFuture<'_, Result<(), BoxError>>;

    /// Drops the connection abruptly, without a closing handshake.
    fn terminate(&self) -> BoxFuture<'_, ()>;
}

/// The subscription server. One instance serves any number of sockets; per-connection state
/// is created in [`opened`](Server::opened) and shares nothing across connections beyond the
/// options.
pub struct Server<E = ()> {
    options: Arc<ServerOptions<E>>,
    connections: Mutex<Vec<Weak<Inner<E>>>>,
}

impl<E: Send + Sync + 'static> Server<E> {
    /// Creates a server from the given options.
    pub fn new(options: ServerOptions<E>) -> Self {
        Self {
            options: Arc::new(options),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Accepts a freshly upgraded socket, returning the connection for the adapter to drive.
    ///
    /// Starts the connection-init timer and the keep-alive driver. A socket whose negotiated
    /// subprotocol is not ours is refused with a subprotocol close before any protocol
    /// exchange.
    pub fn opened(&self, socket: impl Socket, extra: E) -> Connection<E> {
        let socket: Arc<dyn Socket> = Arc::new(socket);
        let inner = Inner::new(Arc::clone(&self.options), Arc::clone(&socket), extra);

        if handle_protocols([socket.protocol()]).is_none() {
            let refused = Arc::clone(&inner);
            tokio::spawn(async move {
                refused
                    .close(
                        CloseCode::SubprotocolNotAcceptable.code(),
                        CloseCode::SubprotocolNotAcceptable.reason(),
                    )
                    .await;
            });
            return Connection { inner };
        }

        tracing::debug!(protocol = socket.protocol(), "connection opened");
        inner.start_timers();
        let mut connections = self.connections.lock();
        connections.retain(|conn| conn.strong_count() > 0);
        connections.push(Arc::downgrade(&inner));
        drop(connections);
        Connection { inner }
    }

    /// Closes every live connection with a going-away close, for graceful shutdown.
    ///
    /// Close failures are logged and swallowed until every client has been notified; the
    /// first one is then returned.
    pub async fn dispose(&self) -> Result<(), BoxError> {
        let connections: Vec<_> = self.connections.lock().drain(..).collect();
        let mut first_error = None;
        for connection in connections.into_iter().filter_map(|conn| conn.upgrade()) {
            if let Err(e) = connection.dispose().await {
                tracing::warn!(error = %e, "failed to close connection during dispose");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
