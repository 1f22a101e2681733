use ordered_float::NotNan;
use serde::{Deserialize, Serialize};

use crate::{DeviceId, ModuleId, Reading};

/// A message a device sends over its live connection.
///
/// Decoding goes through [`super::decode_inbound`] so that unknown types can
/// be told apart from malformed payloads; the serde tag here is used by
/// device-side encoders.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    SensorData(SensorData),
    Heartbeat(Heartbeat),
    CommandResponse(CommandResponse),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorData {
    /// Devices may omit their own id; the session's id is used then.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_module_id: Option<String>,
    pub timestamp: jiff::Timestamp,
    pub temperature: NotNan<f64>,
    pub humidity: NotNan<f64>,
}

impl SensorData {
    pub fn into_reading(self, device_id: DeviceId) -> Reading {
        Reading {
            device_id,
            module_id: self.device_module_id.as_deref().and_then(ModuleId::from_wire),
            timestamp: self.timestamp,
            temperature: self.temperature,
            humidity: self.humidity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Execution outcome of a pushed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub command_id: String,
    #[serde(default)]
    pub status: String,
    /// Free text or an already structured value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl CommandResponse {
    /// The message as text: strings verbatim, structured values as JSON.
    pub fn message_text(&self) -> String {
        match &self.message {
            None | Some(serde_json::Value::Null) => String::new(),
            Some(serde_json::Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
        }
    }
}
