use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::HarnessConfig;
use crate::device::execute;

#[derive(Debug, Deserialize)]
struct PollResponse {
    commands: Vec<PolledCommand>,
}

#[derive(Debug, Deserialize)]
struct PolledCommand {
    command_id: String,
    command: String,
}

/// A device without a live connection: it polls for commands and
/// acknowledges each one over HTTP.
pub async fn run(device_id: String, config: HarnessConfig, cancel: CancellationToken) {
    let client = reqwest::Client::new();
    let poll_url = format!(
        "{}/api/v1/commands/poll?device_id={device_id}",
        config.hub_http_url
    );
    let ack_url = format!("{}/api/v1/command-responses", config.hub_http_url);

    let mut ticker = tokio::time::interval(Duration::from_secs(config.poll_interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let commands = match poll(&client, &poll_url).await {
            Ok(commands) => commands,
            Err(e) => {
                warn!(%device_id, error = %e, "poll failed");
                continue;
            }
        };

        for command in commands {
            let (status, message) = execute(&command.command);
            info!(
                %device_id,
                command_id = %command.command_id,
                command = %command.command,
                status,
                "command polled"
            );

            let body = json!({
                "command_id": command.command_id,
                "status": status,
                "message": message,
                "device_id": device_id,
            });
            let result = client
                .post(&ack_url)
                .json(&body)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status);
            if let Err(e) = result {
                warn!(
                    %device_id,
                    command_id = %command.command_id,
                    error = %e,
                    "acknowledgement failed"
                );
            }
        }
    }
}

async fn poll(client: &reqwest::Client, url: &str) -> reqwest::Result<Vec<PolledCommand>> {
    let response: PollResponse = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(response.commands)
}
