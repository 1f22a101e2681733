use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_core::{Command, CommandStatus, DeliveryStatus, Params};

use crate::buffer::{BufferStats, FlushReport};
use crate::commands::Submission;
use crate::registry::SessionInfo;

/// A command as the API presents it.
#[derive(Debug, Serialize)]
pub struct CommandView {
    pub id: String,
    pub device_id: String,
    pub device_module_id: String,
    pub command: String,
    pub params: Params,
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    pub created_at: jiff::Timestamp,
    pub updated_at: jiff::Timestamp,
}

impl From<Command> for CommandView {
    fn from(command: Command) -> Self {
        Self {
            id: command.id.to_string(),
            device_id: command.device_id.to_string(),
            device_module_id: module_text(&command),
            command: command.name.to_string(),
            params: command.params,
            status: command.status,
            response: command.response,
            created_at: command.created_at,
            updated_at: command.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubmissionResponse {
    pub status: DeliveryStatus,
    pub command: CommandView,
}

impl From<Submission> for SubmissionResponse {
    fn from(submission: Submission) -> Self {
        Self {
            status: submission.status,
            command: submission.command.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    #[serde(default)]
    pub device_id: Option<String>,
    /// Kept as text so a malformed limit falls back to the default.
    #[serde(default)]
    pub limit: Option<String>,
}

impl PollQuery {
    pub fn limit(&self) -> Option<usize> {
        self.limit.as_deref().and_then(|limit| limit.trim().parse().ok())
    }
}

/// One polled command, shaped like the envelope pushed over a live connection.
#[derive(Debug, Serialize)]
pub struct PolledCommand {
    pub id: String,
    pub command_id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub device_module_id: String,
    pub command: String,
    pub params: Params,
    pub status: CommandStatus,
    pub timestamp: jiff::Timestamp,
}

impl From<Command> for PolledCommand {
    fn from(command: Command) -> Self {
        let id = command.id.to_string();
        Self {
            command_id: id.clone(),
            id,
            kind: "command",
            device_module_id: module_text(&command),
            command: command.name.to_string(),
            params: command.params,
            status: command.status,
            timestamp: command.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PollResponse {
    pub commands: Vec<PolledCommand>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub status: &'static str,
    pub command: CommandView,
}

#[derive(Debug, Deserialize)]
pub struct ChangeWifiRequest {
    pub ssid: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct ConnectedDevicesResponse {
    pub devices: Vec<String>,
    pub count: usize,
    pub sessions: Vec<SessionInfo>,
}

#[derive(Debug, Serialize)]
pub struct FlushResponse {
    pub success: bool,
    #[serde(flatten)]
    pub report: FlushReport,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub stats: BufferStats,
    pub connected_devices: usize,
    pub uptime_secs: u64,
}

fn module_text(command: &Command) -> String {
    command
        .module_id
        .as_ref()
        .map(|m| m.as_str().to_owned())
        .unwrap_or_default()
}
