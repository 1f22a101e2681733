use serde::{Deserialize, Serialize};

use crate::{Command, CommandId, Params};

/// A message the hub sends to a device over its live connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Command(CommandEnvelope),
}

impl Outbound {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command_id: CommandId,
    /// Empty when the command targets the device as a whole.
    #[serde(default)]
    pub device_module_id: String,
    pub command: String,
    #[serde(default)]
    pub params: Params,
    pub timestamp: jiff::Timestamp,
}

impl CommandEnvelope {
    pub fn for_command(command: &Command, sent_at: jiff::Timestamp) -> Self {
        Self {
            command_id: command.id,
            device_module_id: command
                .module_id
                .as_ref()
                .map(|m| m.as_str().to_owned())
                .unwrap_or_default(),
            command: command.name.to_string(),
            params: command.params.clone(),
            timestamp: sent_at,
        }
    }
}
