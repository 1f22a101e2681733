use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tether_core::protocol::{CommandResponse, Heartbeat, Inbound, Outbound};
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::HarnessConfig;
use crate::device::{Sensor, execute};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Disconnect {
    Stopped,
    Lost,
}

/// A device that keeps a WebSocket open to the hub, reconnecting with
/// exponential backoff whenever it drops.
pub async fn run(device_id: String, config: HarnessConfig, cancel: CancellationToken) {
    let url = format!("{}?id={device_id}", config.hub_ws_url);
    let mut sensor = Sensor::new(format!("{device_id}-env"));
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                info!(%device_id, "connected");
                backoff = INITIAL_BACKOFF;
                match session(&device_id, socket, &mut sensor, &config, &cancel).await {
                    Disconnect::Stopped => return,
                    Disconnect::Lost => warn!(%device_id, "connection lost"),
                }
            }
            Err(e) => warn!(%device_id, error = %e, retry_in = ?backoff, "connect failed"),
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn session(
    device_id: &str,
    socket: Socket,
    sensor: &mut Sensor,
    config: &HarnessConfig,
    cancel: &CancellationToken,
) -> Disconnect {
    let (mut sink, mut stream) = socket.split();

    let mut readings = tokio::time::interval(Duration::from_secs(config.reading_interval_secs));
    readings.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut heartbeats = tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs));
    heartbeats.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let outgoing = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return Disconnect::Stopped;
            }
            _ = readings.tick() => sensor.sample(device_id).map(Inbound::SensorData),
            _ = heartbeats.tick() => Some(Inbound::Heartbeat(Heartbeat {
                device_id: Some(device_id.to_owned()),
                timestamp: Some(jiff::Timestamp::now().to_string()),
            })),
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => respond(device_id, text.as_str()),
                Some(Ok(Message::Close(_))) | None => return Disconnect::Lost,
                Some(Ok(_)) => None,
                Some(Err(e)) => {
                    warn!(%device_id, error = %e, "read failed");
                    return Disconnect::Lost;
                }
            },
        };

        let Some(message) = outgoing else {
            continue;
        };
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                warn!(%device_id, error = %e, "failed to encode message");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::text(text)).await {
            warn!(%device_id, error = %e, "write failed");
            return Disconnect::Lost;
        }
    }
}

fn respond(device_id: &str, text: &str) -> Option<Inbound> {
    let Outbound::Command(envelope) = match serde_json::from_str::<Outbound>(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(%device_id, error = %e, "ignoring unexpected frame");
            return None;
        }
    };

    let (status, message) = execute(&envelope.command);
    info!(
        %device_id,
        command_id = %envelope.command_id,
        command = %envelope.command,
        status,
        "command received"
    );

    Some(Inbound::CommandResponse(CommandResponse {
        command_id: envelope.command_id.to_string(),
        status: status.to_owned(),
        message: Some(message.into()),
        device_id: Some(device_id.to_owned()),
        timestamp: Some(jiff::Timestamp::now().to_string()),
    }))
}

#[cfg(test)]
mod tests {
    use tether_core::protocol::{CommandEnvelope, TYPE_COMMAND_RESPONSE};
    use tether_core::{Command, Params};

    use super::*;

    #[test]
    fn pushed_commands_are_answered() {
        let command = Command::new("D1".into(), None, "LED_ON", Params::new());
        let envelope = CommandEnvelope::for_command(&command, jiff::Timestamp::now());
        let push = Outbound::Command(envelope);

        let reply = respond("D1", &push.to_json().unwrap()).unwrap();
        let json = serde_json::to_value(&reply).unwrap();

        assert_eq!(json["type"], TYPE_COMMAND_RESPONSE);
        assert_eq!(json["command_id"], command.id.to_string());
        assert_eq!(json["status"], "executed");
        assert_eq!(json["message"], "LED turned ON");
    }

    #[test]
    fn other_frames_are_ignored() {
        assert!(respond("D1", r#"{"type":"welcome"}"#).is_none());
        assert!(respond("D1", "not json").is_none());
    }
}
