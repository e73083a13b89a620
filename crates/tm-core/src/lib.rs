//! tm-core: Configuration model and error types for the module broker
//!
//! This crate provides the broker's own settings file, the declarative
//! child process configuration parsed from the broker configuration
//! document, and the error taxonomy shared by the broker crates.

pub mod config;
pub mod error;

pub use config::{BackoffConfig, BootstrapConfig, BrokerSettings, ChildProcessConfig};
pub use error::{BrokerError, ConfigError, LaunchError, PlatformError, TransportError};
