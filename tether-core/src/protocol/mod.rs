mod error;
mod inbound;
mod outbound;

pub use error::ProtocolError;
pub use inbound::{CommandResponse, Heartbeat, Inbound, SensorData};
pub use outbound::{CommandEnvelope, Outbound};

pub const TYPE_SENSOR_DATA: &str = "sensor_data";
pub const TYPE_HEARTBEAT: &str = "heartbeat";
pub const TYPE_COMMAND_RESPONSE: &str = "command_response";

pub type ParseResult<T> = core::result::Result<T, ProtocolError>;

/// Decode one text frame received from a device.
///
/// The `type` field is inspected first so that a well-formed message of an
/// unknown type yields [`ProtocolError::UnknownType`] instead of a payload
/// error.
pub fn decode_inbound(text: &str) -> ParseResult<Inbound> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;

    let kind = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or(ProtocolError::MissingType)?;

    match kind {
        TYPE_SENSOR_DATA => payload(TYPE_SENSOR_DATA, value).map(Inbound::SensorData),
        TYPE_HEARTBEAT => payload(TYPE_HEARTBEAT, value).map(Inbound::Heartbeat),
        TYPE_COMMAND_RESPONSE => {
            payload(TYPE_COMMAND_RESPONSE, value).map(Inbound::CommandResponse)
        }
        other => Err(ProtocolError::UnknownType(other.to_string())),
    }
}

fn payload<T: serde::de::DeserializeOwned>(
    kind: &'static str,
    value: serde_json::Value,
) -> ParseResult<T> {
    serde_json::from_value(value).map_err(|source| ProtocolError::InvalidPayload { kind, source })
}
