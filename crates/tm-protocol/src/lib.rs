//! tm-protocol: Topic-addressed pipe protocol for the module broker
//!
//! This crate defines the framed wire format used between the broker and
//! each host process it launches, the well-known topics, and the JSON
//! payloads of the host command protocol.

pub mod codec;
pub mod error;
pub mod message;
pub mod payload;
pub mod topic;

pub use codec::{TopicCodec, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};
pub use error::ProtocolError;
pub use message::Message;
pub use payload::{ConfStoreRequest, HostCommand, HostInit, ModuleAction, ModuleControl, ModuleMeta};
pub use topic::{format_guid, parse_guid, SessionSelector, Topic, TOPIC_SIZE};
