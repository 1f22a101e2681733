use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::stream::SplitSink;
use futures::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use tether_core::DeviceId;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{Span, field, info, instrument, warn};

use crate::registry::{DeviceLink, LinkError, SessionId};
use crate::state::AppState;
use crate::storage::HubStorage;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Write half of a device WebSocket.
pub struct WsLink<W = SplitSink<WebSocket, Message>> {
    session_id: SessionId,
    sink: Mutex<W>,
    cancel: CancellationToken,
}

impl<W> WsLink<W>
where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Display,
{
    fn new(sink: W, cancel: CancellationToken) -> Self {
        Self {
            session_id: SessionId::generate(),
            sink: Mutex::new(sink),
            cancel,
        }
    }

    async fn send_close(&self, reason: &'static str) {
        let frame = Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: reason.into(),
        }));

        // a push stuck on the sink counts against the same deadline
        let send = async {
            let mut sink = self.sink.lock().await;
            sink.send(frame).await
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, send).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "close frame not delivered"),
            Err(_) => tracing::debug!("close frame timed out"),
        }
    }
}

#[async_trait]
impl<W> DeviceLink for WsLink<W>
where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: fmt::Display,
{
    fn session_id(&self) -> SessionId {
        self.session_id
    }

    async fn send(&self, payload: &str) -> Result<(), LinkError> {
        if self.cancel.is_cancelled() {
            return Err(LinkError::Closed);
        }

        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(payload.into()))
            .await
            .map_err(|e| LinkError::Transport(e.to_string()))
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub id: Option<String>,
}

/// `GET /ws?id=<device_id>`
pub async fn ws_handler<S: HubStorage>(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState<S>>,
) -> Response {
    let device_id = params
        .id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(DeviceId::from);

    let Some(device_id) = device_id else {
        return (StatusCode::BAD_REQUEST, "device id is required").into_response();
    };

    ws.on_upgrade(move |socket| run_session(state, device_id, socket))
}

#[instrument(skip_all, fields(device_id = %device_id, session_id = field::Empty))]
async fn run_session<S: HubStorage>(state: AppState<S>, device_id: DeviceId, socket: WebSocket) {
    let (sink, mut stream) = socket.split();

    let cancel = state.cancel.child_token();
    let link = Arc::new(WsLink::new(sink, cancel.clone()));
    let session_id = link.session_id();
    Span::current().record("session_id", field::display(session_id));

    state.registry.register(device_id.clone(), link.clone()).await;
    info!("device connected");

    let ended_by_hub = loop {
        tokio::select! {
            _ = cancel.cancelled() => break true,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    super::handle_message(&state, &device_id, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break false,
                // binary frames carry nothing we understand; ping/pong is the transport's
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "read failed");
                    break false;
                }
            }
        }
    };

    state.registry.release(&device_id, session_id).await;
    // replaced or shutting down: tell the device before dropping the socket
    if ended_by_hub {
        link.send_close("session closed").await;
    }

    info!(ended_by_hub, "device disconnected");
}
