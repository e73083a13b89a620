//! Framed pipe transport
//!
//! Each host process is connected through three unidirectional pipes.
//! Frames written to a pipe go through a single [`PipeWriter`] so that
//! concurrent senders never interleave. Frames read from a pipe are
//! decoded by a dedicated reader task and handed to a separate consumer
//! task, so a slow handler never stalls the pipe.

mod reader;
mod writer;

pub use reader::{start_read, ReadHandle, ReadOutcome};
pub use writer::PipeWriter;

use tokio::io::{AsyncRead, AsyncWrite};

/// Boxed read end of a pipe
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write end of a pipe
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
