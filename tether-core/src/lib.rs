pub mod protocol;

use std::fmt;
use std::str::FromStr;

use ordered_float::NotNan;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

// We use `Box<str>` for identifiers that never grow after construction. This
// keeps them compact and makes accidental mutation impossible.
type BoxStr = Box<str>;

/// Free-form command parameters. The shape is owned by the command type, so
/// the hub only ever passes it through.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Stable, externally assigned identifier of a physical device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub BoxStr);

impl DeviceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value.into_boxed_str())
    }
}

/// Identifier of a module (capability or sensor group) on a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleId(pub BoxStr);

impl ModuleId {
    /// Wire payloads use an empty string for "no module".
    pub fn from_wire(value: &str) -> Option<Self> {
        let value = value.trim();
        (!value.is_empty()).then(|| Self(value.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier of a queued command, generated when the command is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub Ulid);

impl CommandId {
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for CommandId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s.trim()).map(CommandId)
    }
}

/// Lifecycle of a command: `pending -> sent -> {executed, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    /// Persisted, not yet handed to any transport.
    Pending,
    /// Handed to the device by push or by poll.
    Sent,
    /// Device reported successful execution.
    Executed,
    /// Device reported a failure.
    Failed,
}

impl CommandStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Sent => "sent",
            CommandStatus::Executed => "executed",
            CommandStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CommandStatus::Executed | CommandStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            CommandStatus::Pending => 0,
            CommandStatus::Sent => 1,
            CommandStatus::Executed | CommandStatus::Failed => 2,
        }
    }

    /// Whether a command may move from `self` to `next`.
    ///
    /// Transitions only ever move forward. A command may be completed
    /// straight from `pending` because a device can acknowledge a pushed
    /// command before the push has been recorded as `sent`.
    pub fn can_transition_to(self, next: CommandStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for CommandStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(CommandStatus::Pending),
            "sent" => Ok(CommandStatus::Sent),
            "executed" => Ok(CommandStatus::Executed),
            "failed" => Ok(CommandStatus::Failed),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// One instruction queued for a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub device_id: DeviceId,
    /// Target module, when the command is addressed to one.
    pub module_id: Option<ModuleId>,
    /// Command name, e.g. `LED_ON`.
    pub name: BoxStr,
    pub params: Params,
    pub status: CommandStatus,
    /// Structured execution result reported by the device.
    pub response: Option<serde_json::Value>,
    pub created_at: jiff::Timestamp,
    pub updated_at: jiff::Timestamp,
}

impl Command {
    /// Build a new `pending` command stamped with the current time.
    pub fn new(
        device_id: DeviceId,
        module_id: Option<ModuleId>,
        name: impl Into<BoxStr>,
        params: Params,
    ) -> Self {
        let now = jiff::Timestamp::now();
        Self {
            id: CommandId::generate(),
            device_id,
            module_id,
            name: name.into(),
            params,
            status: CommandStatus::Pending,
            response: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// How a command reached (or failed to reach) its device at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Persisted only; the device will receive it by polling.
    Queued,
    /// Pushed over the device's live connection.
    Sent,
}

/// A temperature/humidity sample reported by a device module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: DeviceId,
    pub module_id: Option<ModuleId>,
    /// Device-reported sample time.
    pub timestamp: jiff::Timestamp,
    /// Degrees as reported by the device.
    pub temperature: NotNan<f64>,
    /// Relative humidity in percent.
    pub humidity: NotNan<f64>,
}
