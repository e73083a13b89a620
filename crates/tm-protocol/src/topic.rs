//! Topic addressing
//!
//! A topic is a 128-bit identifier paired with a session selector. On the
//! wire it occupies 20 bytes:
//! - id: 16 bytes, Windows GUID layout (first three groups little-endian)
//! - session: 4 bytes (u32, little-endian)

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use uuid::Uuid;

use crate::error::ProtocolError;

/// Size of an encoded topic in bytes
pub const TOPIC_SIZE: usize = 20;

/// Wildcard subscription matching every topic id
pub const ALL_TOPICS: Uuid = Uuid::nil();

/// Topic reserved for commands addressed to the broker itself
pub const BROKER_TOPIC: Uuid = Uuid::from_u128(0x92D627A3_6C62_4C5B_8477_484A34ED3B82);

/// Topic the configuration store module listens on
pub const CONF_STORE_TOPIC: Uuid = Uuid::from_u128(0x8583CDC9_DB92_45BE_90CE_4D3AA4CD14F5);

/// Topic carrying "configuration changed" documents
pub const CONF_TOPIC: Uuid = Uuid::from_u128(0x8ED3A4D7_7C78_4B88_A547_A4D87A9DDC35);

/// Topic hosts use to announce the topics their modules subscribe to
pub const MODULE_META_TOPIC: Uuid = Uuid::from_u128(0x6E6A094C_839F_4EAF_BD22_08CB9E1A318F);

/// Topic of the one-time initialization message sent to a fresh host
pub const HOST_INIT_TOPIC: Uuid = Uuid::from_u128(0xAA810FBD_B33C_4895_8E82_8814EE849E02);

/// Audience restriction carried alongside a topic id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionSelector {
    /// Every session
    Any,
    /// Whichever session currently owns the physical console
    Active,
    /// Reserved for the host initialization handshake
    HostInit,
    /// One concrete session
    Id(u32),
}

impl SessionSelector {
    /// Raw value of [`SessionSelector::Any`]
    pub const ANY_RAW: u32 = 0xFFFF_FFFF;
    /// Raw value of [`SessionSelector::Active`]
    pub const ACTIVE_RAW: u32 = 0xFFFF_FFFE;
    /// Raw value of [`SessionSelector::HostInit`]
    pub const HOST_INIT_RAW: u32 = 0xFFFF_FFFD;

    /// Decode a raw wire value
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            Self::ANY_RAW => Self::Any,
            Self::ACTIVE_RAW => Self::Active,
            Self::HOST_INIT_RAW => Self::HostInit,
            id => Self::Id(id),
        }
    }

    /// Encode to the raw wire value
    pub fn as_raw(&self) -> u32 {
        match self {
            Self::Any => Self::ANY_RAW,
            Self::Active => Self::ACTIVE_RAW,
            Self::HostInit => Self::HOST_INIT_RAW,
            Self::Id(id) => *id,
        }
    }
}

impl fmt::Display for SessionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::Active => write!(f, "active"),
            Self::HostInit => write!(f, "host-init"),
            Self::Id(id) => write!(f, "{}", id),
        }
    }
}

/// Addressable channel: a topic id plus an optional session restriction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Topic {
    /// Logical channel identifier
    pub id: Uuid,
    /// Audience restriction
    pub session: SessionSelector,
}

impl Topic {
    /// Create a new topic
    pub fn new(id: Uuid, session: SessionSelector) -> Self {
        Self { id, session }
    }

    /// Topic delivered regardless of session
    pub fn any(id: Uuid) -> Self {
        Self::new(id, SessionSelector::Any)
    }

    /// Encode the topic into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(TOPIC_SIZE);
        dst.put_slice(&self.id.to_bytes_le());
        dst.put_u32_le(self.session.as_raw());
    }

    /// Decode a topic from the front of a byte buffer
    ///
    /// Returns None if there aren't enough bytes in the buffer.
    pub fn decode(src: &mut BytesMut) -> Option<Self> {
        if src.len() < TOPIC_SIZE {
            return None;
        }

        let mut id = [0u8; 16];
        src.copy_to_slice(&mut id);
        let session = SessionSelector::from_raw(src.get_u32_le());

        Some(Self {
            id: Uuid::from_bytes_le(id),
            session,
        })
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", format_guid(&self.id), self.session)
    }
}

/// Format an id in braced uppercase form, e.g. `{8583CDC9-DB92-45BE-90CE-4D3AA4CD14F5}`
pub fn format_guid(id: &Uuid) -> String {
    format!("{{{}}}", id.hyphenated()).to_uppercase()
}

/// Parse an id in braced (38 chars) or bare hyphenated (36 chars) form
pub fn parse_guid(text: &str) -> Result<Uuid, ProtocolError> {
    let text = text.trim();
    let bare = match text.len() {
        38 if text.starts_with('{') && text.ends_with('}') => &text[1..37],
        36 => text,
        _ => return Err(ProtocolError::InvalidTopicId(text.to_string())),
    };

    Uuid::try_parse(bare).map_err(|_| ProtocolError::InvalidTopicId(text.to_string()))
}
