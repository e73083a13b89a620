//! Host diagnostic stream forwarding
//!
//! Hosts write one log line per record to stderr, each starting with a
//! bracketed level tag such as `[INF] `. Tagged lines are re-emitted
//! through `tracing` under the `host` target; anything else is dropped.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::transport::BoxedReader;

/// Length of a level tag such as `[INF]`
const TAG_LEN: usize = 5;

/// Log level announced by a host line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl HostLevel {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "[TRC]" => Some(Self::Trace),
            "[DBG]" => Some(Self::Debug),
            "[INF]" => Some(Self::Info),
            "[WRN]" => Some(Self::Warn),
            "[ERR]" => Some(Self::Error),
            "[CRT]" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Split a host line into its level and text
///
/// Returns None for lines without a recognized tag.
pub fn parse_line(line: &str) -> Option<(HostLevel, &str)> {
    let line = line.trim_end_matches(&['\r', '\n'][..]);
    let tag = line.get(..TAG_LEN)?;
    let level = HostLevel::from_tag(tag)?;
    let rest = line.get(TAG_LEN..).unwrap_or("");
    Some((level, rest.strip_prefix(' ').unwrap_or(rest)))
}

/// Forward tagged stderr lines until end of stream or cancellation
pub async fn forward(pipe: BoxedReader, pid: u32, group: String, cancel: CancellationToken) {
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => break,
            Ok(_) => emit(&String::from_utf8_lossy(&buf), pid, &group),
            Err(e) => {
                tracing::debug!("Stderr of {} ({}) failed: {}", group, pid, e);
                break;
            }
        }
    }

    tracing::trace!("Stderr forwarding for {} ({}) ended", group, pid);
}

fn emit(line: &str, pid: u32, group: &str) {
    let Some((level, text)) = parse_line(line) else {
        tracing::trace!(target: "host", "[{} {}] untagged line dropped", group, pid);
        return;
    };

    match level {
        HostLevel::Trace => tracing::trace!(target: "host", "[{} {}] {}", group, pid, text),
        HostLevel::Debug => tracing::debug!(target: "host", "[{} {}] {}", group, pid, text),
        HostLevel::Info => tracing::info!(target: "host", "[{} {}] {}", group, pid, text),
        HostLevel::Warn => tracing::warn!(target: "host", "[{} {}] {}", group, pid, text),
        HostLevel::Error | HostLevel::Critical => {
            tracing::error!(target: "host", "[{} {}] {}", group, pid, text)
        }
    }
}
