//! [`subwire`] subscription transport glue for [`tokio-tungstenite`] WebSockets.
//!
//! The adapter wraps an accepted [`WebSocketStream`] into the [`Socket`] contract and drives
//! the [`Connection`](subwire::Connection) from the stream half: text frames become protocol
//! messages, binary frames are refused, transport pongs feed the keep-alive, and the observed
//! close runs the connection teardown.
//!
//! [`tokio-tungstenite`]: https://docs.rs/tokio-tungstenite

use std::sync::Arc;

use futures::{
    future::{BoxFuture, FutureExt},
    stream::{SplitSink, StreamExt},
    SinkExt,
};
use subwire::{handle_protocols, BoxError, Server, Socket};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{Mutex, Notify},
};
use tokio_tungstenite::{
    tungstenite::{
        self,
        http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue},
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message as WsMessage,
    },
    WebSocketStream,
};

/// The [`Socket`] contract over the write half of a [`WebSocketStream`].
pub struct TungsteniteSocket<S> {
    protocol: String,
    sink: Mutex<SplitSink<WebSocketStream<S>, WsMessage>>,
    terminated: Arc<Notify>,
}

impl<S> Socket for TungsteniteSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn send(&self, text: String) -> BoxFuture<'_, Result<(), BoxError>> {
        async move {
            let mut sink = self.sink.lock().await;
            sink.send(WsMessage::Text(text.into()))
                .await
                .map_err(Into::into)
        }
        .boxed()
    }

    fn close(&self, code: u16, reason: String) -> BoxFuture<'_, Result<(), BoxError>> {
        async move {
            let mut sink = self.sink.lock().await;
            sink.send(WsMessage::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            })))
            .await
            .map_err(Into::into)
        }
        .boxed()
    }

    fn ping(&self, payload: Vec<u8>) -> BoxFuture<'_, Result<(), BoxError>> {
        async move {
            let mut sink = self.sink.lock().await;
            sink.send(WsMessage::Ping(payload.into()))
                .await
                .map_err(Into::into)
        }
        .boxed()
    }

    fn terminate(&self) -> BoxFuture<'_, ()> {
        // Makes `serve` bail out of its read loop, dropping the stream without a closing
        // handshake.
        self.terminated.notify_one();
        futures::future::ready(()).boxed()
    }
}

/// Accepts a raw stream as a WebSocket, negotiating the subprotocol during the upgrade.
///
/// Returns the accepted stream together with the selected subprotocol token, [`None`] when
/// the client offered no acceptable one. The caller decides whether to serve such sockets;
/// [`serve`] refuses them before any protocol exchange.
pub async fn accept<S>(
    stream: S,
) -> Result<(WebSocketStream<S>, Option<&'static str>), tungstenite::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut selected = None;
    let socket = tokio_tungstenite::accept_hdr_async(
        stream,
        |request: &tungstenite::handshake::server::Request,
         mut response: tungstenite::handshake::server::Response| {
            let offered = request
                .headers()
                .get(SEC_WEBSOCKET_PROTOCOL)
                .and_then(|value| value.to_str().ok());
            if let Some(token) = handle_protocols(offered) {
                selected = Some(token);
                response
                    .headers_mut()
                    .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(token));
            }
            Ok(response)
        },
    )
    .await?;
    Ok((socket, selected))
}

/// Serves one accepted WebSocket on the given server until it closes.
///
/// `protocol` is the subprotocol token selected during the upgrade (the empty string when
/// none was). The future settles once the socket has closed and the connection teardown has
/// run.
pub async fn serve<S, E>(
    socket: WebSocketStream<S>,
    protocol: impl Into<String>,
    server: &Server<E>,
    extra: E,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: Send + Sync + 'static,
{
    let (sink, mut stream) = socket.split();
    let terminated = Arc::new(Notify::new());
    let connection = server.opened(
        TungsteniteSocket {
            protocol: protocol.into(),
            sink: Mutex::new(sink),
            terminated: Arc::clone(&terminated),
        },
        extra,
    );

    let mut observed_close = None;
    loop {
        tokio::select! {
            _ = terminated.notified() => break,
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => connection.message(text.as_str()).await,
                Some(Ok(WsMessage::Binary(_))) => connection.binary_received().await,
                Some(Ok(WsMessage::Pong(_))) => connection.pong_received(),
                // Inbound transport pings are answered by tungstenite itself.
                Some(Ok(WsMessage::Ping(_) | WsMessage::Frame(_))) => {}
                Some(Ok(WsMessage::Close(frame))) => {
                    observed_close =
                        frame.map(|f| (u16::from(f.code), f.reason.as_str().to_owned()));
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "websocket read failed");
                    break;
                }
                None => break,
            },
        }
    }

    let (code, reason) = observed_close.unwrap_or((1006, "Abnormal Closure".into()));
    connection.closed(code, &reason).await;
}
