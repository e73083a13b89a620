//! Broker settings
//!
//! These are the broker's own knobs, read from a TOML file at startup.
//! They are distinct from the broker configuration document, which
//! arrives at runtime from the configuration store.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use crate::error::ConfigError;

/// Settings for the broker process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// Directory holding the host executables (defaults to the broker's own directory)
    pub host_dir: Option<PathBuf>,

    /// Host executable name, without platform suffix
    pub host_image: String,

    /// 32-bit host executable name, without platform suffix
    pub host_image_wow64: String,

    /// Force service mode on or off instead of detecting it
    pub run_as_service: Option<bool>,

    /// Configuration launched before the configuration store has answered
    pub bootstrap: BootstrapConfig,

    /// Capacity of the orchestrator's event queue
    pub event_queue_capacity: usize,

    /// Capacity of each pipe's decoded-message queue
    pub message_queue_capacity: usize,

    /// Upper bound on joining a host's tasks after the terminate handshake
    #[serde(with = "duration_secs")]
    pub terminate_timeout: Duration,

    /// Delay before relaunching a host that exited unexpectedly
    pub restart_backoff: BackoffConfig,

    /// Delay before re-running bootstrap after a reconciliation fault
    pub fault_backoff: BackoffConfig,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host_dir: None,
            host_image: "UniversalModuleHost64".to_string(),
            host_image_wow64: "UniversalModuleHost32".to_string(),
            run_as_service: None,
            bootstrap: BootstrapConfig::default(),
            event_queue_capacity: 256,
            message_queue_capacity: 256,
            terminate_timeout: Duration::from_secs(5),
            restart_backoff: BackoffConfig::default(),
            fault_backoff: BackoffConfig {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(30),
                multiplier: 2.0,
                jitter: 0.25,
            },
        }
    }
}

impl BrokerSettings {
    /// Resolve the host directory, falling back to the running executable's directory
    pub fn resolved_host_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.host_dir {
            return Ok(dir.clone());
        }

        let exe = std::env::current_exe()
            .map_err(|e| ConfigError::Invalid(format!("Cannot locate broker executable: {}", e)))?;
        exe.parent()
            .map(|p| p.to_path_buf())
            .ok_or_else(|| ConfigError::Invalid(format!("No parent directory for {:?}", exe)))
    }

    /// Full path of the host executable to launch
    pub fn host_image_path(&self, wow64: bool) -> Result<PathBuf, ConfigError> {
        let stem = if wow64 {
            &self.host_image_wow64
        } else {
            &self.host_image
        };
        let file = format!("{}{}", stem, std::env::consts::EXE_SUFFIX);
        Ok(self.resolved_host_dir()?.join(file))
    }
}

/// The configuration launched before the configuration store has answered
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Group name of the bootstrap host
    pub group_name: String,
    /// Module loaded into the bootstrap host
    pub module: String,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            group_name: "ConfStore".to_string(),
            module: "ConfStore".to_string(),
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_millis")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_millis")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}
