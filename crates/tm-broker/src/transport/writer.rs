//! Serialized frame writer

use futures::SinkExt;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;

use tm_core::TransportError;
use tm_protocol::topic::ALL_TOPICS;
use tm_protocol::{Message, TopicCodec};

use super::BoxedWriter;

/// Exclusive writer for one pipe
///
/// Every send holds the lock for the whole frame, so frames from
/// concurrent senders are never interleaved. A failed write closes the
/// pipe: a partially written frame is never followed by another one.
pub struct PipeWriter {
    /// Label used in logs
    name: String,
    /// Framed sink, `None` once closed
    sink: Mutex<Option<FramedWrite<BoxedWriter, TopicCodec>>>,
}

impl PipeWriter {
    /// Wrap the write end of a pipe
    pub fn new(name: impl Into<String>, pipe: BoxedWriter) -> Self {
        Self {
            name: name.into(),
            sink: Mutex::new(Some(FramedWrite::new(pipe, TopicCodec::new()))),
        }
    }

    /// Write one frame and flush it
    pub async fn send(&self, message: Message) -> Result<(), TransportError> {
        if message.topic.id == ALL_TOPICS {
            return Err(TransportError::WildcardTopic);
        }

        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::PipeClosed)?;

        let topic = message.topic;
        let len = message.payload.len();
        if let Err(e) = sink.send(message).await {
            tracing::warn!("Write to {} failed, closing pipe: {}", self.name, e);
            *guard = None;
            return Err(TransportError::Write(e));
        }

        tracing::trace!("Sent {} byte payload on {} to {}", len, topic, self.name);
        Ok(())
    }

    /// Close the pipe; later sends fail with [`TransportError::PipeClosed`]
    ///
    /// Safe to call more than once.
    pub async fn close(&self) {
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.close().await {
                tracing::debug!("Error closing {}: {}", self.name, e);
            }
        }
    }

    /// Whether the pipe has been closed
    pub async fn is_closed(&self) -> bool {
        self.sink.lock().await.is_none()
    }
}
