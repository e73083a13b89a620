//! Declarative description of a desired host process
//!
//! Parsed from the `Broker.ChildProcesses` array of the broker
//! configuration document:
//!
//! ```json
//! { "Broker": { "ChildProcesses": [
//!     { "GroupName": "ConfStore", "Session": 0, "Modules": ["ConfStore"] }
//! ] } }
//! ```

use serde::Deserialize;
use serde_json::Value;

use crate::error::ConfigError;

/// Session value requesting one host per interactive user session
const ALL_USERS_SESSION: i64 = -1;

/// Integrity level value requesting a slightly raised token
const HIGHER_INTEGRITY: &str = "Higher";

/// One desired host process configuration
///
/// Equality is structural over every field, including module order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChildProcessConfig {
    /// Launch one host in every active user session
    pub all_users: bool,
    /// Launch the 32-bit host (only honoured by a 64-bit broker)
    pub wow64: bool,
    /// Raise the host token's integrity label above the user's default
    pub higher_integrity: bool,
    /// Host shows UI, which rules out protected-process launch
    pub ui: bool,
    /// Group name handed to the host on its command line and in the handshake
    pub group_name: String,
    /// Modules to load, in order
    pub modules: Vec<String>,
}

impl ChildProcessConfig {
    /// Configuration that launches a single module in the broker's own session
    pub fn bootstrap(group_name: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            all_users: false,
            wow64: false,
            higher_integrity: false,
            ui: false,
            group_name: group_name.into(),
            modules: vec![module.into()],
        }
    }

    /// Parse a configuration document from JSON text
    pub fn parse_document(text: &str) -> Result<Vec<Self>, ConfigError> {
        let document: Value = serde_json::from_str(text)?;
        Ok(Self::from_document(&document))
    }

    /// Extract every child process entry of a configuration document
    ///
    /// A document without the expected structure yields no entries.
    /// Individual malformed entries are skipped.
    pub fn from_document(document: &Value) -> Vec<Self> {
        Self::from_document_for(document, cfg!(target_pointer_width = "64"))
    }

    /// Same as [`Self::from_document`] for a broker of the given bitness
    pub fn from_document_for(document: &Value, broker_is_64bit: bool) -> Vec<Self> {
        let Some(entries) = document
            .get("Broker")
            .and_then(|b| b.get("ChildProcesses"))
            .and_then(Value::as_array)
        else {
            tracing::warn!("Configuration document has no Broker.ChildProcesses array");
            return Vec::new();
        };

        entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match Self::from_entry(entry, broker_is_64bit) {
                Ok(config) => Some(config),
                Err(e) => {
                    tracing::warn!("Skipping child process entry {}: {}", index, e);
                    None
                }
            })
            .collect()
    }

    fn from_entry(entry: &Value, broker_is_64bit: bool) -> Result<Self, ConfigError> {
        let entry = ChildProcessEntry::deserialize(entry)?;
        let group_name = entry
            .group_name
            .ok_or_else(|| ConfigError::Invalid("missing GroupName".to_string()))?;

        Ok(Self {
            all_users: entry.session == Some(ALL_USERS_SESSION),
            wow64: broker_is_64bit && entry.wow64,
            higher_integrity: entry.integrity_level.as_deref() == Some(HIGHER_INTEGRITY),
            ui: entry.ui,
            group_name,
            modules: entry.modules,
        })
    }
}

/// One raw `Broker.ChildProcesses` entry as it appears in the document
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ChildProcessEntry {
    /// `-1` for every user session, anything else for the broker's own
    session: Option<i64>,
    wow64: bool,
    integrity_level: Option<String>,
    ui: bool,
    group_name: Option<String>,
    modules: Vec<String>,
}

/// Whether a configuration document carries a broker section
pub fn has_broker_section(document: &Value) -> bool {
    document.get("Broker").is_some()
}
