pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use tether_core::{Command, CommandId, CommandStatus, DeviceId, Reading};

/// Durable command queue.
///
/// Implementations own consistency: every method is a single atomic
/// operation from the caller's point of view.
#[async_trait]
pub trait CommandStore: Send + Sync + 'static {
    /// Error type specific to this storage implementation
    type Error: std::error::Error + Send + Sync + 'static;

    /// Persist a newly created command.
    async fn insert_command(&self, command: Command) -> Result<(), Self::Error>;

    /// Fetch a command by id.
    async fn get_command(&self, id: CommandId) -> Result<Option<Command>, Self::Error>;

    /// Up to `limit` `pending` commands for a device, oldest first.
    async fn pending_commands(
        &self,
        device_id: &DeviceId,
        limit: usize,
    ) -> Result<Vec<Command>, Self::Error>;

    /// Move `pending` commands to `sent`, returning how many changed.
    ///
    /// Ids that are unknown or already past `pending` are ignored.
    async fn mark_sent(&self, ids: &[CommandId]) -> Result<usize, Self::Error>;

    /// Record a terminal outcome.
    ///
    /// When `reporter` is given it must match the command's target device.
    /// `response` replaces the stored response only when present.
    async fn complete_command(
        &self,
        id: CommandId,
        reporter: Option<&DeviceId>,
        status: CommandStatus,
        response: Option<serde_json::Value>,
    ) -> Result<Completion, Self::Error>;
}

/// Result of [`CommandStore::complete_command`].
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The command now carries the reported outcome.
    Completed(Command),
    NotFound,
    /// The reporting device is not the command's target.
    DeviceMismatch,
    /// The command already reached a terminal status.
    AlreadyFinal(CommandStatus),
}

/// Durable sink for telemetry readings.
#[async_trait]
pub trait ReadingStore: Send + Sync + 'static {
    /// Error type specific to this storage implementation
    type Error: std::error::Error + Send + Sync + 'static;

    /// Insert a batch of readings; either all of them are stored or none.
    async fn insert_readings(&self, readings: Vec<Reading>) -> Result<(), Self::Error>;

    /// Stored readings of a device in sample order.
    async fn readings_for_device(&self, device_id: &DeviceId) -> Result<Vec<Reading>, Self::Error>;

    /// Total number of stored readings.
    async fn reading_count(&self) -> Result<usize, Self::Error>;
}

/// Everything the hub needs from a storage backend.
pub trait HubStorage: CommandStore + ReadingStore + Clone {}

impl<T> HubStorage for T where T: CommandStore + ReadingStore + Clone {}
