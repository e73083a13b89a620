//! JSON payloads of the host command protocol
//!
//! Field names are PascalCase on the wire.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::topic::{format_guid, parse_guid, SessionSelector, Topic, HOST_INIT_TOPIC};

/// Command name understood by hosts to shut down
pub const CMD_TERMINATE: &str = "Terminate";

/// Command name understood by hosts to load or unload a module
pub const CMD_CTRL_MODULE: &str = "CtrlModule";

/// Command name understood by the configuration store
pub const CMD_QUERY: &str = "Query";

/// Initialization handshake, sent once before any other traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostInit {
    /// Braced GUID the host should treat as its own topic
    pub topic_id: String,
    /// Group name of the host's configuration
    pub group_name: String,
}

impl HostInit {
    /// Build the handshake for a host whose own topic is `topic_id`
    pub fn new(topic_id: &Uuid, group_name: impl Into<String>) -> Self {
        Self {
            topic_id: format_guid(topic_id),
            group_name: group_name.into(),
        }
    }

    /// Topic the handshake travels on
    pub fn topic() -> Topic {
        Topic::new(HOST_INIT_TOPIC, SessionSelector::HostInit)
    }
}

/// Command sent to a host on its own topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostCommand {
    /// Command name
    pub cmd: String,
    /// Command arguments, itself a JSON document for `CtrlModule`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub args: String,
}

impl HostCommand {
    /// Ask the host to shut down
    pub fn terminate() -> Self {
        Self {
            cmd: CMD_TERMINATE.to_string(),
            args: String::new(),
        }
    }

    /// Ask the host to load or unload a module
    pub fn ctrl_module(control: &ModuleControl) -> Result<Self, ProtocolError> {
        Ok(Self {
            cmd: CMD_CTRL_MODULE.to_string(),
            args: serde_json::to_string(control)?,
        })
    }

    /// Decode the nested module control document of a `CtrlModule` command
    pub fn module_control(&self) -> Result<Option<ModuleControl>, ProtocolError> {
        if self.cmd != CMD_CTRL_MODULE {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&self.args)?))
    }
}

/// Module control verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleAction {
    Load,
    Unload,
}

/// Arguments of a `CtrlModule` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModuleControl {
    pub cmd: ModuleAction,
    pub module: String,
}

impl ModuleControl {
    /// Load `module` into the host
    pub fn load(module: impl Into<String>) -> Self {
        Self {
            cmd: ModuleAction::Load,
            module: module.into(),
        }
    }
}

/// Announcement of the topics a host's modules subscribe to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModuleMeta {
    /// Process id of the announcing host
    #[serde(default)]
    pub pid: u32,
    /// Module name
    #[serde(default)]
    pub name: String,
    /// Braced GUIDs the module subscribes to
    #[serde(default, alias = "Services")]
    pub topic_ids: Vec<String>,
}

impl ModuleMeta {
    /// Parsed topic ids; unparseable entries are logged and skipped
    pub fn topic_set(&self) -> HashSet<Uuid> {
        self.topic_ids
            .iter()
            .filter_map(|text| match parse_guid(text) {
                Ok(id) => Some(id),
                Err(e) => {
                    tracing::warn!("Module {} announced bad topic id: {}", self.name, e);
                    None
                }
            })
            .collect()
    }
}

/// Request addressed to the configuration store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfStoreRequest {
    pub cmd: String,
    pub args: String,
}

impl ConfStoreRequest {
    /// Ask for the configuration section named `section`
    pub fn query(section: impl Into<String>) -> Self {
        Self {
            cmd: CMD_QUERY.to_string(),
            args: section.into(),
        }
    }
}
