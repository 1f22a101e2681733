use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::buffer::TelemetryBuffer;
use crate::commands::CommandDispatcher;
use crate::config::Config;
use crate::registry::ConnectionRegistry;
use crate::storage::HubStorage;

/// Shared state handed to every request handler and connection task.
pub struct AppState<S> {
    pub registry: ConnectionRegistry,
    pub commands: Arc<CommandDispatcher<S>>,
    pub buffer: Arc<TelemetryBuffer<S>>,
    /// Fires when the hub shuts down; connection tasks watch it.
    pub cancel: CancellationToken,
    started: Instant,
}

impl<S: HubStorage> AppState<S> {
    pub fn new(storage: S, config: &Config, cancel: CancellationToken) -> Self {
        let registry = ConnectionRegistry::new();
        let commands = CommandDispatcher::new(storage.clone(), registry.clone(), config.commands);
        let buffer = TelemetryBuffer::from_config(storage, &config.buffer);

        Self {
            registry,
            commands: Arc::new(commands),
            buffer: Arc::new(buffer),
            cancel,
            started: Instant::now(),
        }
    }
}

impl<S> AppState<S> {
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            commands: Arc::clone(&self.commands),
            buffer: Arc::clone(&self.buffer),
            cancel: self.cancel.clone(),
            started: self.started,
        }
    }
}
