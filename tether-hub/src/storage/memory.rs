use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tether_core::{Command, CommandId, CommandStatus, DeviceId, Reading};

use crate::storage::{CommandStore, Completion, ReadingStore};

/// In-memory storage implementation.
/// This is primarily intended for testing and as a reference
/// implementation of the storage traits.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    // Insertion order doubles as creation order.
    commands: Arc<Mutex<Vec<Command>>>,
    readings: Arc<Mutex<Vec<Reading>>>,
}

/// Error type for MemoryStorage
#[derive(Debug, thiserror::Error)]
pub enum MemoryStorageError {
    #[error("Mutex poisoned: {0}")]
    MutexPoisoned(String),
}

impl<T> From<PoisonError<T>> for MemoryStorageError {
    fn from(err: PoisonError<T>) -> Self {
        MemoryStorageError::MutexPoisoned(err.to_string())
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommandStore for MemoryStorage {
    type Error = MemoryStorageError;

    async fn insert_command(&self, command: Command) -> Result<(), Self::Error> {
        let mut commands = self.commands.lock()?;
        commands.push(command);
        Ok(())
    }

    async fn get_command(&self, id: CommandId) -> Result<Option<Command>, Self::Error> {
        let commands = self.commands.lock()?;
        Ok(commands.iter().find(|c| c.id == id).cloned())
    }

    async fn pending_commands(
        &self,
        device_id: &DeviceId,
        limit: usize,
    ) -> Result<Vec<Command>, Self::Error> {
        let commands = self.commands.lock()?;

        let mut pending: Vec<Command> = commands
            .iter()
            .filter(|c| c.device_id == *device_id && c.status == CommandStatus::Pending)
            .cloned()
            .collect();
        // stable: equal timestamps keep insertion order
        pending.sort_by_key(|c| c.created_at);
        pending.truncate(limit);

        Ok(pending)
    }

    async fn mark_sent(&self, ids: &[CommandId]) -> Result<usize, Self::Error> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut commands = self.commands.lock()?;
        let now = jiff::Timestamp::now();
        let mut changed = 0;

        for command in commands.iter_mut() {
            if command.status == CommandStatus::Pending && ids.contains(&command.id) {
                command.status = CommandStatus::Sent;
                command.updated_at = now;
                changed += 1;
            }
        }

        Ok(changed)
    }

    async fn complete_command(
        &self,
        id: CommandId,
        reporter: Option<&DeviceId>,
        status: CommandStatus,
        response: Option<serde_json::Value>,
    ) -> Result<Completion, Self::Error> {
        let mut commands = self.commands.lock()?;

        let Some(command) = commands.iter_mut().find(|c| c.id == id) else {
            return Ok(Completion::NotFound);
        };

        if let Some(reporter) = reporter
            && *reporter != command.device_id
        {
            return Ok(Completion::DeviceMismatch);
        }

        if !command.status.can_transition_to(status) {
            return Ok(Completion::AlreadyFinal(command.status));
        }

        command.status = status;
        if response.is_some() {
            command.response = response;
        }
        command.updated_at = jiff::Timestamp::now();

        Ok(Completion::Completed(command.clone()))
    }
}

#[async_trait]
impl ReadingStore for MemoryStorage {
    type Error = MemoryStorageError;

    async fn insert_readings(&self, readings: Vec<Reading>) -> Result<(), Self::Error> {
        let mut stored = self.readings.lock()?;
        stored.extend(readings);
        Ok(())
    }

    async fn readings_for_device(&self, device_id: &DeviceId) -> Result<Vec<Reading>, Self::Error> {
        let stored = self.readings.lock()?;

        let mut readings: Vec<Reading> = stored
            .iter()
            .filter(|r| r.device_id == *device_id)
            .cloned()
            .collect();
        readings.sort_by_key(|r| r.timestamp);

        Ok(readings)
    }

    async fn reading_count(&self) -> Result<usize, Self::Error> {
        Ok(self.readings.lock()?.len())
    }
}
