use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tether_core::DeviceId;
use tokio::sync::RwLock;
use ulid::Ulid;

/// Identifies one connection of a device. A reconnect gets a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Ulid);

impl SessionId {
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
}

/// Write side of a live device connection.
#[async_trait]
pub trait DeviceLink: Send + Sync + 'static {
    fn session_id(&self) -> SessionId;

    /// Write one text message.
    async fn send(&self, payload: &str) -> Result<(), LinkError>;

    /// Ask the session to terminate. Must not block.
    fn close(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("device {0} is not connected")]
    NotConnected(DeviceId),
    #[error("write to device {device_id} failed: {source}")]
    WriteFailed {
        device_id: DeviceId,
        #[source]
        source: LinkError,
    },
}

struct Session {
    link: Arc<dyn DeviceLink>,
    connected_at: jiff::Timestamp,
    last_seen_us: AtomicI64,
}

/// Point-in-time view of one bound session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub device_id: DeviceId,
    pub connected_at: jiff::Timestamp,
    pub last_seen: jiff::Timestamp,
}

/// Maps each connected device to its single live session.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    sessions: Arc<RwLock<HashMap<DeviceId, Arc<Session>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `link` to `device_id`, closing any session it replaces.
    pub async fn register(&self, device_id: DeviceId, link: Arc<dyn DeviceLink>) {
        let now = jiff::Timestamp::now();
        let session = Arc::new(Session {
            link,
            connected_at: now,
            last_seen_us: AtomicI64::new(now.as_microsecond()),
        });

        let mut sessions = self.sessions.write().await;
        if let Some(previous) = sessions.insert(device_id.clone(), session) {
            tracing::info!(
                %device_id,
                replaced_session = %previous.link.session_id(),
                "replacing existing device session"
            );
            previous.link.close();
        }
    }

    /// Close and remove whatever session is bound to `device_id`.
    pub async fn unregister(&self, device_id: &DeviceId) {
        let removed = self.sessions.write().await.remove(device_id);
        if let Some(session) = removed {
            session.link.close();
            tracing::info!(%device_id, "device unregistered");
        }
    }

    /// Remove the binding only if it still belongs to `session_id`.
    ///
    /// Returns whether a binding was removed.
    pub async fn release(&self, device_id: &DeviceId, session_id: SessionId) -> bool {
        let mut sessions = self.sessions.write().await;

        let owned = sessions
            .get(device_id)
            .is_some_and(|s| s.link.session_id() == session_id);
        if owned && let Some(session) = sessions.remove(device_id) {
            session.link.close();
        }

        owned
    }

    pub async fn send_to_device(
        &self,
        device_id: &DeviceId,
        payload: &str,
    ) -> Result<(), SendError> {
        let link = {
            let sessions = self.sessions.read().await;
            match sessions.get(device_id) {
                Some(session) => Arc::clone(&session.link),
                None => return Err(SendError::NotConnected(device_id.clone())),
            }
        };

        link.send(payload)
            .await
            .map_err(|source| SendError::WriteFailed {
                device_id: device_id.clone(),
                source,
            })
    }

    pub async fn is_connected(&self, device_id: &DeviceId) -> bool {
        self.sessions.read().await.contains_key(device_id)
    }

    pub async fn list(&self) -> Vec<DeviceId> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Record activity for the device's current session.
    pub async fn touch(&self, device_id: &DeviceId) {
        let sessions = self.sessions.read().await;
        if let Some(session) = sessions.get(device_id) {
            session
                .last_seen_us
                .store(jiff::Timestamp::now().as_microsecond(), Ordering::Relaxed);
        }
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;

        let mut infos: Vec<SessionInfo> = sessions
            .iter()
            .map(|(device_id, session)| {
                let last_seen_us = session.last_seen_us.load(Ordering::Relaxed);
                SessionInfo {
                    device_id: device_id.clone(),
                    connected_at: session.connected_at,
                    last_seen: jiff::Timestamp::from_microsecond(last_seen_us)
                        .unwrap_or(session.connected_at),
                }
            })
            .collect();
        infos.sort_by(|a, b| a.device_id.cmp(&b.device_id));

        infos
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicBool;

    use super::*;

    /// In-process link recording everything written to it.
    pub struct MockLink {
        id: SessionId,
        pub sent: Mutex<Vec<String>>,
        pub closed: AtomicBool,
        pub fail_writes: AtomicBool,
    }

    impl MockLink {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                id: SessionId::generate(),
                sent: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                fail_writes: AtomicBool::new(false),
            })
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        pub fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeviceLink for MockLink {
        fn session_id(&self) -> SessionId {
            self.id
        }

        async fn send(&self, payload: &str) -> Result<(), LinkError> {
            if self.is_closed() {
                return Err(LinkError::Closed);
            }
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(LinkError::Transport("broken pipe".into()));
            }
            self.sent.lock().unwrap().push(payload.to_string());
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}
