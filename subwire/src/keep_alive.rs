//! Transport-level liveness probing.
//!
//! Keep-alive runs on the transport's native ping/pong frames, never on the protocol `ping`
//! and `pong` messages, so user ping hooks do not fire for it.

use std::{sync::Arc, time::Duration};

use tokio::{sync::Notify, task::JoinHandle};

use crate::server::Socket;

/// The recurring ping driver for one socket. Ticks every `interval`; a tick whose pong does
/// not arrive within another `interval` terminates the socket abruptly, without a close
/// frame.
pub(crate) struct KeepAlive {
    task: JoinHandle<()>,
}

impl KeepAlive {
    pub(crate) fn start(socket: Arc<dyn Socket>, interval: Duration, pong: Arc<Notify>) -> Self {
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if socket.ping(Vec::new()).await.is_err() {
                    return;
                }
                tokio::select! {
                    _ = pong.notified() => {}
                    _ = tokio::time::sleep(interval) => {
                        tracing::warn!("keep-alive pong missing, terminating socket");
                        socket.terminate().await;
                        return;
                    }
                }
            }
        });
        Self { task }
    }

    /// Releases the driver. Called on every close path.
    pub(crate) fn abort(&self) {
        self.task.abort();
    }
}
