//! Frame reader and dispatcher

use std::future::Future;
use std::ops::ControlFlow;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use tm_protocol::{Message, TopicCodec};

use super::BoxedReader;

/// Why a reader loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The pipe reached end of stream
    Eof,
    /// A frame could not be decoded
    Malformed,
    /// The handler asked to stop
    Stopped,
    /// The owner cancelled the reader
    Cancelled,
}

/// Handle to a running reader/dispatcher pair
pub struct ReadHandle {
    /// Cancelled once the reader loop has ended for any reason
    closed: CancellationToken,
    /// Stops both loops
    stop: CancellationToken,
    reader: JoinHandle<ReadOutcome>,
    dispatcher: JoinHandle<()>,
}

impl ReadHandle {
    /// Token that fires when the pipe stops delivering frames
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Ask both loops to stop
    pub fn cancel(&self) {
        self.stop.cancel();
    }

    /// Wait for both loops to finish
    pub async fn join(self) -> ReadOutcome {
        let outcome = match self.reader.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("Pipe reader task failed: {}", e);
                ReadOutcome::Cancelled
            }
        };
        if let Err(e) = self.dispatcher.await {
            tracing::warn!("Pipe dispatcher task failed: {}", e);
        }
        outcome
    }
}

/// Start reading frames from `pipe`, invoking `handler` for each message
///
/// Decoded messages are queued (up to `capacity`) between the reader and
/// the handler. The handler returns [`ControlFlow::Break`] to stop
/// reading. Both loops end when `cancel` fires.
pub fn start_read<F, Fut>(
    name: impl Into<String>,
    pipe: BoxedReader,
    capacity: usize,
    cancel: &CancellationToken,
    mut handler: F,
) -> ReadHandle
where
    F: FnMut(Message) -> Fut + Send + 'static,
    Fut: Future<Output = ControlFlow<()>> + Send,
{
    let name = name.into();
    let stop = cancel.child_token();
    let closed = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<Message>(capacity.max(1));

    let reader = {
        let stop = stop.clone();
        let closed = closed.clone();
        let name = name.clone();
        tokio::spawn(async move {
            let mut frames = FramedRead::new(pipe, TopicCodec::new());
            let outcome = loop {
                tokio::select! {
                    _ = stop.cancelled() => break ReadOutcome::Cancelled,
                    frame = frames.next() => match frame {
                        Some(Ok(message)) => {
                            if tx.send(message).await.is_err() {
                                break ReadOutcome::Stopped;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!("Malformed frame on {}: {}", name, e);
                            break ReadOutcome::Malformed;
                        }
                        None => break ReadOutcome::Eof,
                    },
                }
            };
            tracing::debug!("Reader for {} ended: {:?}", name, outcome);
            closed.cancel();
            outcome
        })
    };

    let dispatcher = {
        let stop = stop.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = stop.cancelled() => break,
                    message = rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                let flow = tokio::select! {
                    _ = stop.cancelled() => break,
                    flow = handler(message) => flow,
                };
                if flow.is_break() {
                    tracing::debug!("Handler for {} asked to stop", name);
                    stop.cancel();
                    break;
                }
            }
        })
    };

    ReadHandle {
        closed,
        stop,
        reader,
        dispatcher,
    }
}
