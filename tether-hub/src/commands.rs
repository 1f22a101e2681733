use std::error::Error as StdError;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_core::protocol::{CommandEnvelope, Outbound};
use tether_core::{Command, CommandId, CommandStatus, DeliveryStatus, DeviceId, ModuleId, Params};
use tracing::instrument;

use crate::config::CommandsConfig;
use crate::registry::ConnectionRegistry;
use crate::storage::{CommandStore, Completion};

pub const CHANGE_WIFI: &str = "CHANGE_WIFI";

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("command {command_id} does not target device {device_id}")]
    DeviceMismatch {
        command_id: CommandId,
        device_id: DeviceId,
    },
    #[error("command {command_id} is already {status}")]
    AlreadyFinal {
        command_id: CommandId,
        status: CommandStatus,
    },
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn StdError + Send + Sync>),
}

impl CommandError {
    fn storage<E: StdError + Send + Sync + 'static>(err: E) -> Self {
        CommandError::Storage(Box::new(err))
    }
}

/// Operator request to queue a command.
#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueRequest {
    pub device_id: String,
    #[serde(default)]
    pub device_module_id: Option<String>,
    pub command: String,
    #[serde(default)]
    pub params: Option<Params>,
}

/// Device-reported execution outcome.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AckRequest {
    pub command_id: String,
    #[serde(default)]
    pub status: Option<String>,
    /// Free text or an already structured value.
    #[serde(default)]
    pub message: Option<Value>,
    /// Reporting device; when set it must be the command's target.
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub status: DeliveryStatus,
    pub command: Command,
}

/// Queues commands durably and delivers them by push or poll.
pub struct CommandDispatcher<S> {
    store: S,
    registry: ConnectionRegistry,
    limits: CommandsConfig,
}

impl<S: CommandStore> CommandDispatcher<S> {
    pub fn new(store: S, registry: ConnectionRegistry, limits: CommandsConfig) -> Self {
        Self {
            store,
            registry,
            limits,
        }
    }

    /// Persist a new `pending` command.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<Command, CommandError> {
        let device_id = required_device(&request.device_id)?;
        let name = request.command.trim();
        if name.is_empty() {
            return Err(CommandError::InvalidRequest("command is required".into()));
        }

        let module_id = request.device_module_id.as_deref().and_then(ModuleId::from_wire);
        let command = Command::new(device_id, module_id, name, request.params.unwrap_or_default());

        self.store
            .insert_command(command.clone())
            .await
            .map_err(CommandError::storage)?;

        tracing::info!(
            command_id = %command.id,
            device_id = %command.device_id,
            command = %command.name,
            "command queued"
        );

        Ok(command)
    }

    /// Push a stored command over the device's live connection if it has one.
    ///
    /// Failures are absorbed; the command then stays `pending` for polling.
    pub async fn try_push(&self, command: &Command) -> DeliveryStatus {
        if !self.registry.is_connected(&command.device_id).await {
            return DeliveryStatus::Queued;
        }

        let envelope =
            Outbound::Command(CommandEnvelope::for_command(command, jiff::Timestamp::now()));
        let payload = match envelope.to_json() {
            Ok(payload) => payload,
            Err(error) => {
                tracing::error!(command_id = %command.id, %error, "failed to encode command");
                return DeliveryStatus::Queued;
            }
        };

        if let Err(error) = self.registry.send_to_device(&command.device_id, &payload).await {
            tracing::debug!(
                command_id = %command.id,
                %error,
                "push failed, command left for polling"
            );
            return DeliveryStatus::Queued;
        }

        if let Err(error) = self.store.mark_sent(&[command.id]).await {
            // The device has the command; a later poll may hand it out again.
            tracing::warn!(
                command_id = %command.id,
                %error,
                "failed to mark pushed command as sent"
            );
        }

        DeliveryStatus::Sent
    }

    /// Enqueue, then attempt immediate delivery.
    #[instrument(skip(self, request), fields(device_id = %request.device_id))]
    pub async fn submit(&self, request: EnqueueRequest) -> Result<Submission, CommandError> {
        let mut command = self.enqueue(request).await?;

        let status = self.try_push(&command).await;
        if status == DeliveryStatus::Sent {
            command.status = CommandStatus::Sent;
        }

        Ok(Submission { status, command })
    }

    /// Pending commands for a device, oldest first. Nothing is marked.
    pub async fn poll(
        &self,
        device_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Command>, CommandError> {
        let device_id = required_device(device_id)?;
        let limit = self.limits.poll_limit(limit);

        self.store
            .pending_commands(&device_id, limit)
            .await
            .map_err(CommandError::storage)
    }

    pub async fn mark_sent(&self, ids: &[CommandId]) -> Result<usize, CommandError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.store.mark_sent(ids).await.map_err(CommandError::storage)
    }

    /// Poll and mark the returned commands as `sent` in one step.
    pub async fn take_pending(
        &self,
        device_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Command>, CommandError> {
        let mut commands = self.poll(device_id, limit).await?;

        let ids: Vec<CommandId> = commands.iter().map(|c| c.id).collect();
        self.mark_sent(&ids).await?;

        for command in &mut commands {
            command.status = CommandStatus::Sent;
        }

        if !commands.is_empty() {
            tracing::debug!(device_id, count = commands.len(), "commands handed out by poll");
        }

        Ok(commands)
    }

    /// Record a device-reported outcome.
    pub async fn ack(&self, request: AckRequest) -> Result<Command, CommandError> {
        let raw_id = request.command_id.trim();
        if raw_id.is_empty() {
            return Err(CommandError::InvalidRequest("command_id is required".into()));
        }
        let command_id: CommandId = raw_id
            .parse()
            .map_err(|_| CommandError::UnknownCommand(raw_id.to_string()))?;

        let reported = request.status.as_deref().map(str::trim).unwrap_or_default();
        let (status, device_status) = ack_status(reported)?;

        let mut response = response_payload(request.message.as_ref());
        if let Some(device_status) = device_status {
            response = Some(with_device_status(response, device_status));
        }

        let reporter = request
            .device_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(DeviceId::from);

        let completion = self
            .store
            .complete_command(command_id, reporter.as_ref(), status, response)
            .await
            .map_err(CommandError::storage)?;

        match completion {
            Completion::Completed(command) => {
                tracing::info!(%command_id, status = %command.status, "command acknowledged");
                Ok(command)
            }
            Completion::NotFound => Err(CommandError::UnknownCommand(command_id.to_string())),
            Completion::DeviceMismatch => Err(CommandError::DeviceMismatch {
                command_id,
                device_id: reporter.unwrap_or_else(|| DeviceId::from("")),
            }),
            Completion::AlreadyFinal(status) => {
                Err(CommandError::AlreadyFinal { command_id, status })
            }
        }
    }

    /// Ask a device to join a different wireless network.
    pub async fn change_wifi(
        &self,
        device_id: &str,
        ssid: &str,
        password: &str,
    ) -> Result<Submission, CommandError> {
        if ssid.trim().is_empty() {
            return Err(CommandError::InvalidRequest("ssid is required".into()));
        }

        let mut params = Params::new();
        params.insert("ssid".into(), Value::from(ssid));
        params.insert("password".into(), Value::from(password));

        self.submit(EnqueueRequest {
            device_id: device_id.to_string(),
            device_module_id: None,
            command: CHANGE_WIFI.to_string(),
            params: Some(params),
        })
        .await
    }
}

fn required_device(device_id: &str) -> Result<DeviceId, CommandError> {
    let device_id = device_id.trim();
    if device_id.is_empty() {
        return Err(CommandError::InvalidRequest("device_id is required".into()));
    }
    Ok(DeviceId::from(device_id))
}

/// Map a device-reported status to a terminal one.
///
/// Statuses outside the command lifecycle (`unknown_command`, `timeout`, ...)
/// count as failures and are handed back so they can be kept.
fn ack_status(reported: &str) -> Result<(CommandStatus, Option<&str>), CommandError> {
    if reported.is_empty() {
        return Ok((CommandStatus::Executed, None));
    }

    match reported.parse::<CommandStatus>() {
        Ok(status) if status.is_terminal() => Ok((status, None)),
        Ok(status) => Err(CommandError::InvalidRequest(format!(
            "{status} is not a completion status"
        ))),
        Err(_) => Ok((CommandStatus::Failed, Some(reported))),
    }
}

/// Turn a reported message into a structured response.
///
/// Objects and arrays, given directly or as JSON text, are kept as they are.
/// Anything else becomes `{"message": text}`.
pub fn response_payload(message: Option<&Value>) -> Option<Value> {
    match message? {
        Value::Null => None,
        Value::Object(_) | Value::Array(_) => message.cloned(),
        Value::String(text) => wrap_text(text),
        other => wrap_text(&other.to_string()),
    }
}

fn wrap_text(text: &str) -> Option<Value> {
    if text.trim().is_empty() {
        return None;
    }

    match serde_json::from_str::<Value>(text) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => Some(value),
        _ => Some(serde_json::json!({ "message": text })),
    }
}

fn with_device_status(response: Option<Value>, device_status: &str) -> Value {
    match response {
        Some(Value::Object(mut map)) => {
            map.insert("device_status".into(), Value::from(device_status));
            Value::Object(map)
        }
        Some(other) => serde_json::json!({ "message": other, "device_status": device_status }),
        None => serde_json::json!({ "device_status": device_status }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::registry::mock::MockLink;
    use crate::storage::memory::MemoryStorage;

    fn dispatcher() -> (CommandDispatcher<MemoryStorage>, MemoryStorage, ConnectionRegistry) {
        let store = MemoryStorage::new();
        let registry = ConnectionRegistry::new();
        let dispatcher =
            CommandDispatcher::new(store.clone(), registry.clone(), CommandsConfig::default());
        (dispatcher, store, registry)
    }

    fn request(device: &str, command: &str) -> EnqueueRequest {
        EnqueueRequest {
            device_id: device.into(),
            device_module_id: None,
            command: command.into(),
            params: None,
        }
    }

    fn ack(command_id: CommandId, status: &str, message: Option<Value>) -> AckRequest {
        AckRequest {
            command_id: command_id.to_string(),
            status: Some(status.into()),
            message,
            device_id: None,
        }
    }

    #[tokio::test]
    async fn enqueue_requires_device_and_command() {
        let (dispatcher, store, _) = dispatcher();

        let err = dispatcher.enqueue(request("", "LED_ON")).await.unwrap_err();
        assert!(matches!(err, CommandError::InvalidRequest(_)));

        let err = dispatcher.enqueue(request("D1", "  ")).await.unwrap_err();
        assert!(matches!(err, CommandError::InvalidRequest(_)));

        assert!(store.pending_commands(&"D1".into(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn offline_device_gets_command_by_poll() {
        let (dispatcher, store, _) = dispatcher();
        let mut req = request("D2", "LED_ON");
        req.params = Some(json!({ "duration_ms": 500 }).as_object().unwrap().clone());

        let submission = dispatcher.submit(req).await.unwrap();
        assert_eq!(submission.status, DeliveryStatus::Queued);
        assert_eq!(submission.command.status, CommandStatus::Pending);

        let polled = dispatcher.take_pending("D2", Some(10)).await.unwrap();
        assert_eq!(polled.len(), 1);
        assert_eq!(&*polled[0].name, "LED_ON");
        assert_eq!(polled[0].status, CommandStatus::Sent);
        assert_eq!(polled[0].params["duration_ms"], 500);

        let stored = store.get_command(polled[0].id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Sent);
        assert!(dispatcher.take_pending("D2", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn connected_device_gets_command_pushed() {
        let (dispatcher, store, registry) = dispatcher();
        let link = MockLink::new();
        registry.register("D1".into(), link.clone()).await;

        let submission = dispatcher.submit(request("D1", "LED_ON")).await.unwrap();

        assert_eq!(submission.status, DeliveryStatus::Sent);
        let sent = link.sent();
        assert_eq!(sent.len(), 1);
        let envelope: Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(envelope["type"], "command");
        assert_eq!(envelope["command_id"], submission.command.id.to_string());

        let stored = store.get_command(submission.command.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Sent);
        assert!(dispatcher.poll("D1", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_push_downgrades_to_queued() {
        let (dispatcher, _, registry) = dispatcher();
        let link = MockLink::new();
        link.fail_writes.store(true, std::sync::atomic::Ordering::SeqCst);
        registry.register("D1".into(), link.clone()).await;

        let submission = dispatcher.submit(request("D1", "LED_ON")).await.unwrap();

        assert_eq!(submission.status, DeliveryStatus::Queued);
        assert!(registry.is_connected(&"D1".into()).await);
        assert_eq!(dispatcher.poll("D1", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn poll_is_fifo_and_respects_limit() {
        let (dispatcher, _, _) = dispatcher();
        let mut ids = Vec::new();
        for name in ["A", "B", "C"] {
            ids.push(dispatcher.enqueue(request("D1", name)).await.unwrap().id);
        }
        dispatcher.enqueue(request("D9", "OTHER")).await.unwrap();

        let first = dispatcher.take_pending("D1", Some(2)).await.unwrap();
        assert_eq!(first.iter().map(|c| c.id).collect::<Vec<_>>(), ids[..2]);

        let rest = dispatcher.take_pending("D1", Some(2)).await.unwrap();
        assert_eq!(rest.iter().map(|c| c.id).collect::<Vec<_>>(), ids[2..]);

        let err = dispatcher.poll(" ", None).await.unwrap_err();
        assert!(matches!(err, CommandError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn mark_sent_tolerates_empty_and_unknown_ids() {
        let (dispatcher, _, _) = dispatcher();

        assert_eq!(dispatcher.mark_sent(&[]).await.unwrap(), 0);
        assert_eq!(dispatcher.mark_sent(&[CommandId::generate()]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ack_walks_status_forward_only() {
        let (dispatcher, _, _) = dispatcher();
        let command = dispatcher.enqueue(request("D1", "LED_ON")).await.unwrap();
        dispatcher.take_pending("D1", None).await.unwrap();

        let done = dispatcher.ack(ack(command.id, "", None)).await.unwrap();
        assert_eq!(done.status, CommandStatus::Executed);

        let err = dispatcher.ack(ack(command.id, "failed", None)).await.unwrap_err();
        assert!(matches!(
            err,
            CommandError::AlreadyFinal { status: CommandStatus::Executed, .. }
        ));
    }

    #[tokio::test]
    async fn ack_wraps_plain_messages() {
        let (dispatcher, _, _) = dispatcher();
        let a = dispatcher.enqueue(request("D1", "A")).await.unwrap();
        let b = dispatcher.enqueue(request("D1", "B")).await.unwrap();

        let a = dispatcher
            .ack(ack(a.id, "executed", Some(json!("LED turned ON"))))
            .await
            .unwrap();
        assert_eq!(a.response, Some(json!({ "message": "LED turned ON" })));

        let b = dispatcher
            .ack(ack(b.id, "executed", Some(json!(r#"{"level": 3}"#))))
            .await
            .unwrap();
        assert_eq!(b.response, Some(json!({ "level": 3 })));
    }

    #[tokio::test]
    async fn unrecognised_device_status_is_a_failure() {
        let (dispatcher, _, _) = dispatcher();
        let command = dispatcher.enqueue(request("D1", "DANCE")).await.unwrap();

        let done = dispatcher
            .ack(ack(command.id, "unknown_command", Some(json!("Unknown command: DANCE"))))
            .await
            .unwrap();

        assert_eq!(done.status, CommandStatus::Failed);
        assert_eq!(
            done.response,
            Some(json!({ "message": "Unknown command: DANCE", "device_status": "unknown_command" }))
        );
    }

    #[tokio::test]
    async fn ack_rejects_bad_requests() {
        let (dispatcher, _, _) = dispatcher();
        let command = dispatcher.enqueue(request("D1", "LED_ON")).await.unwrap();

        let err = dispatcher.ack(AckRequest::default()).await.unwrap_err();
        assert!(matches!(err, CommandError::InvalidRequest(_)));

        let err = dispatcher.ack(ack(command.id, "sent", None)).await.unwrap_err();
        assert!(matches!(err, CommandError::InvalidRequest(_)));

        let err = dispatcher.ack(ack(CommandId::generate(), "executed", None)).await.unwrap_err();
        assert!(matches!(err, CommandError::UnknownCommand(_)));

        let mut wrong_device = ack(command.id, "executed", None);
        wrong_device.device_id = Some("D2".into());
        let err = dispatcher.ack(wrong_device).await.unwrap_err();
        assert!(matches!(err, CommandError::DeviceMismatch { .. }));
    }

    #[tokio::test]
    async fn change_wifi_submits_credentials() {
        let (dispatcher, _, _) = dispatcher();

        let submission = dispatcher.change_wifi("D1", "home", "secret").await.unwrap();
        assert_eq!(&*submission.command.name, CHANGE_WIFI);
        assert_eq!(submission.command.params["ssid"], "home");
        assert_eq!(submission.command.params["password"], "secret");

        let err = dispatcher.change_wifi("D1", "", "secret").await.unwrap_err();
        assert!(matches!(err, CommandError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn concurrent_acks_complete_once() {
        let (dispatcher, _, _) = dispatcher();
        let dispatcher = Arc::new(dispatcher);
        let id = dispatcher.enqueue(request("D1", "LED_ON")).await.unwrap().id;

        let tasks: Vec<_> = ["executed", "failed", "executed", "failed"]
            .into_iter()
            .map(|status| {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move { dispatcher.ack(ack(id, status, None)).await })
            })
            .collect();

        let mut completed = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                completed += 1;
            }
        }
        assert_eq!(completed, 1);
    }

    #[test]
    fn response_payload_shapes() {
        assert_eq!(response_payload(None), None);
        assert_eq!(response_payload(Some(&json!(""))), None);
        assert_eq!(response_payload(Some(&json!([1, 2]))), Some(json!([1, 2])));
        assert_eq!(response_payload(Some(&json!(42))), Some(json!({ "message": "42" })));
        assert_eq!(
            response_payload(Some(&json!("not {json"))),
            Some(json!({ "message": "not {json" }))
        );
    }
}
