use std::error::Error;

use ordered_float::NotNan;
use serde_json::json;
use tempfile::NamedTempFile;
use tether_core::{Command, CommandId, CommandStatus, DeviceId, ModuleId, Params, Reading};
use tether_hub::storage::memory::MemoryStorage;
use tether_hub::storage::sqlite::SqliteStorage;
use tether_hub::storage::{CommandStore, Completion, ReadingStore};

type TestResult = Result<(), Box<dyn Error>>;

fn command(device: &str, name: &str) -> Command {
    let mut params = Params::new();
    params.insert("duration_ms".into(), json!(500));
    Command::new(DeviceId::from(device), ModuleId::from_wire("led-1"), name, params)
}

fn reading(device: &str, second: i64, temperature: f64) -> Reading {
    let start: jiff::Timestamp = "2025-03-01T10:00:00Z".parse().unwrap();
    Reading {
        device_id: DeviceId::from(device),
        module_id: None,
        timestamp: start + jiff::SignedDuration::from_secs(second),
        temperature: NotNan::new(temperature).unwrap(),
        humidity: NotNan::new(40.0).unwrap(),
    }
}

async fn command_lifecycle<S: CommandStore>(storage: &S) -> TestResult {
    let device = DeviceId::from("D1");
    let cmd = command("D1", "LED_ON");
    let id = cmd.id;

    storage.insert_command(cmd.clone()).await?;

    let stored = storage.get_command(id).await?.expect("stored command");
    assert_eq!(stored.name, cmd.name);
    assert_eq!(stored.params["duration_ms"], 500);
    assert_eq!(stored.module_id.as_ref().map(ModuleId::as_str), Some("led-1"));
    assert_eq!(stored.status, CommandStatus::Pending);

    assert_eq!(storage.pending_commands(&device, 10).await?.len(), 1);
    assert_eq!(storage.mark_sent(&[id]).await?, 1);
    assert_eq!(storage.mark_sent(&[id, CommandId::generate()]).await?, 0);
    assert!(storage.pending_commands(&device, 10).await?.is_empty());

    let completion = storage
        .complete_command(
            id,
            Some(&device),
            CommandStatus::Executed,
            Some(json!({ "message": "ok" })),
        )
        .await?;
    let Completion::Completed(done) = completion else {
        panic!("expected completion, got {completion:?}");
    };
    assert_eq!(done.status, CommandStatus::Executed);
    assert_eq!(done.response, Some(json!({ "message": "ok" })));

    let again = storage
        .complete_command(id, None, CommandStatus::Failed, None)
        .await?;
    assert_eq!(again, Completion::AlreadyFinal(CommandStatus::Executed));

    // a rejected completion leaves the stored response alone
    let stored = storage.get_command(id).await?.expect("stored command");
    assert_eq!(stored.response, Some(json!({ "message": "ok" })));

    Ok(())
}

async fn completion_checks_reporter<S: CommandStore>(storage: &S) -> TestResult {
    let cmd = command("D1", "LED_OFF");
    let id = cmd.id;
    storage.insert_command(cmd).await?;

    let other = DeviceId::from("D2");
    let completion = storage
        .complete_command(id, Some(&other), CommandStatus::Executed, None)
        .await?;
    assert_eq!(completion, Completion::DeviceMismatch);

    let missing = storage
        .complete_command(CommandId::generate(), None, CommandStatus::Executed, None)
        .await?;
    assert_eq!(missing, Completion::NotFound);

    let stored = storage.get_command(id).await?.expect("stored command");
    assert_eq!(stored.status, CommandStatus::Pending);

    Ok(())
}

async fn pending_is_fifo_and_limited<S: CommandStore>(storage: &S) -> TestResult {
    let device = DeviceId::from("D1");
    let base: jiff::Timestamp = "2025-03-01T10:00:00Z".parse()?;

    let mut first = command("D1", "FIRST");
    let mut second = command("D1", "SECOND");
    let mut third = command("D1", "THIRD");
    first.created_at = base;
    second.created_at = base + jiff::SignedDuration::from_secs(1);
    third.created_at = base + jiff::SignedDuration::from_secs(1);

    // inserted out of creation order
    storage.insert_command(second.clone()).await?;
    storage.insert_command(first.clone()).await?;
    storage.insert_command(third.clone()).await?;
    storage.insert_command(command("D2", "ELSEWHERE")).await?;

    let pending = storage.pending_commands(&device, 10).await?;
    let ids: Vec<CommandId> = pending.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![first.id, second.id, third.id]);

    let limited = storage.pending_commands(&device, 2).await?;
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].id, first.id);

    Ok(())
}

async fn readings_round_trip<S: ReadingStore>(storage: &S) -> TestResult {
    storage
        .insert_readings(vec![
            reading("D1", 1, 21.0),
            reading("D1", 0, 20.0),
            reading("D2", 0, 10.0),
        ])
        .await?;
    storage.insert_readings(Vec::new()).await?;

    assert_eq!(storage.reading_count().await?, 3);

    let d1 = storage.readings_for_device(&DeviceId::from("D1")).await?;
    assert_eq!(d1, vec![reading("D1", 0, 20.0), reading("D1", 1, 21.0)]);

    Ok(())
}

async fn concurrent_completion_is_single<S: CommandStore + Clone>(storage: &S) -> TestResult {
    let cmd = command("D1", "LED_ON");
    let id = cmd.id;
    storage.insert_command(cmd).await?;

    let acks: Vec<_> = (0..8)
        .map(|i| {
            let storage = storage.clone();
            let status = if i % 2 == 0 {
                CommandStatus::Executed
            } else {
                CommandStatus::Failed
            };
            tokio::spawn(async move {
                let device = DeviceId::from("D1");
                storage.complete_command(id, Some(&device), status, None).await
            })
        })
        .collect();

    let mut completed = 0;
    for ack in acks {
        match ack.await?? {
            Completion::Completed(_) => completed += 1,
            Completion::AlreadyFinal(status) => assert!(status.is_terminal()),
            other => panic!("unexpected completion {other:?}"),
        }
    }
    assert_eq!(completed, 1);

    Ok(())
}

/// memory storage tests
#[tokio::test]
async fn memory_command_lifecycle() -> TestResult {
    command_lifecycle(&MemoryStorage::new()).await
}

#[tokio::test]
async fn memory_completion_checks_reporter() -> TestResult {
    completion_checks_reporter(&MemoryStorage::new()).await
}

#[tokio::test]
async fn memory_pending_is_fifo() -> TestResult {
    pending_is_fifo_and_limited(&MemoryStorage::new()).await
}

#[tokio::test]
async fn memory_readings() -> TestResult {
    readings_round_trip(&MemoryStorage::new()).await
}

/// sqlite storage tests
#[tokio::test]
async fn sqlite_command_lifecycle() -> TestResult {
    command_lifecycle(&SqliteStorage::new_in_memory().await?).await
}

#[tokio::test]
async fn sqlite_completion_checks_reporter() -> TestResult {
    completion_checks_reporter(&SqliteStorage::new_in_memory().await?).await
}

#[tokio::test]
async fn sqlite_pending_is_fifo() -> TestResult {
    pending_is_fifo_and_limited(&SqliteStorage::new_in_memory().await?).await
}

#[tokio::test]
async fn sqlite_readings() -> TestResult {
    readings_round_trip(&SqliteStorage::new_in_memory().await?).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_concurrent_completion() -> TestResult {
    concurrent_completion_is_single(&MemoryStorage::new()).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_file_concurrent_completion() -> TestResult {
    let file = NamedTempFile::new()?;
    let storage = SqliteStorage::new(file.path().to_string_lossy()).await?;
    concurrent_completion_is_single(&storage).await
}

#[tokio::test]
async fn sqlite_file_survives_reopen() -> TestResult {
    let file = NamedTempFile::new()?;
    let path = file.path().to_string_lossy().into_owned();

    let cmd = command("D1", "LED_ON");
    {
        let storage = SqliteStorage::new(&path).await?;
        storage.insert_command(cmd.clone()).await?;
        storage.insert_readings(vec![reading("D1", 0, 20.0)]).await?;
    }

    let storage = SqliteStorage::new(&path).await?;
    let stored = storage.get_command(cmd.id).await?.expect("stored command");
    assert_eq!(stored.id, cmd.id);
    // stored at microsecond precision
    assert_eq!(
        stored.created_at.as_microsecond(),
        cmd.created_at.as_microsecond()
    );
    assert_eq!(storage.reading_count().await?, 1);

    Ok(())
}
