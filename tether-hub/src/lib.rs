pub mod api;
pub mod buffer;
pub mod commands;
pub mod config;
pub mod edge;
pub mod registry;
pub mod state;
pub mod storage;

use axum::{Router, routing::get};

pub use buffer::{FlushReport, TelemetryBuffer, Thresholds, run_flush_loop};
pub use commands::{AckRequest, CommandDispatcher, CommandError, EnqueueRequest, Submission};
pub use config::{BufferConfig, CommandsConfig, Config, OnFlushFailure, ServerConfig, StorageConfig};
pub use registry::{ConnectionRegistry, DeviceLink, SendError};
pub use state::AppState;
pub use storage::memory::MemoryStorage;
pub use storage::sqlite::SqliteStorage;
pub use storage::{CommandStore, HubStorage, ReadingStore};

/// The complete HTTP surface: device WebSockets and the JSON API.
pub fn app<S: HubStorage>(state: AppState<S>) -> Router {
    Router::new()
        .route("/ws", get(edge::ws::ws_handler::<S>))
        .route("/health", get(api::health))
        .nest("/api/v1", api::router::<S>())
        .with_state(state)
}
