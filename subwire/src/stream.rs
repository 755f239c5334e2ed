//! Bridging event streams into [`Producer`]s.

use futures::{
    channel::oneshot,
    future::{self, BoxFuture, Either, FutureExt},
    stream::{BoxStream, Stream, StreamExt},
};
use serde_json::Value;

use crate::producer::{BoxError, Emitter, Producer};

/// A [`Producer`] backed by an event stream.
///
/// Every `Ok` item is emitted as an intermediate result; the first `Err` item fails the
/// operation with its error descriptors; stream exhaustion completes it. Stopping interrupts
/// the stream through a oneshot, so a pending stream settles promptly.
pub struct StreamProducer {
    stream: Option<BoxStream<'static, Result<Value, Vec<Value>>>>,
    stop_tx: Option<oneshot::Sender<()>>,
    stop_rx: Option<oneshot::Receiver<()>>,
}

impl StreamProducer {
    /// Wraps the given event stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Value, Vec<Value>>> + Send + 'static,
    {
        let (stop_tx, stop_rx) = oneshot::channel();
        Self {
            stream: Some(stream.boxed()),
            stop_tx: Some(stop_tx),
            stop_rx: Some(stop_rx),
        }
    }
}

impl Producer for StreamProducer {
    fn start(
        &mut self,
        emitter: Emitter,
    ) -> BoxFuture<'static, Result<Option<Vec<Value>>, BoxError>> {
        let stream = self.stream.take();
        let stop_rx = self.stop_rx.take();
        async move {
            let (Some(mut stream), Some(mut stop_rx)) = (stream, stop_rx) else {
                return Ok(None);
            };
            loop {
                match future::select(stop_rx, stream.next()).await {
                    Either::Left(_) => return Ok(None),
                    Either::Right((item, rx)) => {
                        stop_rx = rx;
                        match item {
                            None => return Ok(None),
                            Some(Ok(payload)) => {
                                if emitter.next(payload).await.is_err() {
                                    // The operation is gone; there is nobody left to emit to.
                                    return Ok(None);
                                }
                            }
                            Some(Err(errors)) => return Ok(Some(errors)),
                        }
                    }
                }
            }
        }
        .boxed()
    }

    fn stop(&mut self) -> BoxFuture<'static, ()> {
        if let Some(tx) = self.stop_tx.take() {
            tx.send(()).ok();
        }
        future::ready(()).boxed()
    }
}
