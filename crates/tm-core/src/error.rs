//! Core error types for the module broker

use std::path::PathBuf;
use thiserror::Error;
use tm_protocol::ProtocolError;

/// Top-level error type for the broker
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Launch error
    #[error("Launch error: {0}")]
    Launch(#[from] LaunchError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Platform error
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    /// The orchestrator task has exited and accepts no more events
    #[error("Orchestrator stopped")]
    Stopped,
}

/// Pipe transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Pipe was closed or never opened
    #[error("Pipe closed")]
    PipeClosed,

    /// The all-topics wildcard is only valid as a subscription
    #[error("Cannot publish to the all-topics wildcard")]
    WildcardTopic,

    /// Frame could not be encoded or written in full
    #[error("Write failed: {0}")]
    Write(#[from] ProtocolError),
}

/// Host process launch errors
#[derive(Error, Debug)]
pub enum LaunchError {
    /// Host executable does not exist
    #[error("Host image not found: {0}")]
    ImageNotFound(PathBuf),

    /// Host image could not be resolved from the settings
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Process creation failed
    #[error("Failed to spawn host process: {0}")]
    Spawn(#[from] std::io::Error),

    /// OS facility used during launch failed
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    /// Initialization handshake could not be delivered
    #[error("Handshake failed: {0}")]
    Handshake(#[from] TransportError),

    /// Launch was requested after the instance was terminated
    #[error("Instance already terminated")]
    Terminated,
}

/// Errors from OS session, token and containment facilities
#[derive(Error, Debug)]
pub enum PlatformError {
    /// An OS call failed
    #[error("{call} failed: {source}")]
    Os {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Session has no user that a process could run as
    #[error("Session {0} has no user")]
    NoSessionUser(u32),
}

impl PlatformError {
    /// Capture the calling thread's last OS error for `call`
    pub fn last_os_error(call: &'static str) -> Self {
        Self::Os {
            call,
            source: std::io::Error::last_os_error(),
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Broker configuration document is not valid JSON
    #[error("Document parse error: {0}")]
    Document(#[from] serde_json::Error),
}
