use std::str::FromStr;

use async_trait::async_trait;
use ordered_float::NotNan;
use sqlx::{
    QueryBuilder, Row, Sqlite, SqlitePool,
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
};
use tether_core::{Command, CommandId, CommandStatus, DeviceId, ModuleId, Reading};

use crate::storage::{CommandStore, Completion, ReadingStore};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, thiserror::Error)]
pub enum SqliteStorageError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("invalid JSON column: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),
    #[error("invalid status: {0}")]
    InvalidStatus(String),
    #[error("non-finite value in column {0}")]
    NotANumber(&'static str),
}

/// SQLite-backed storage for commands and readings.
///
/// Timestamps are stored as microseconds since the Unix epoch.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Opens (creating if missing) the database at `path` and applies migrations.
    pub async fn new(path: impl AsRef<str>) -> Result<Self, SqliteStorageError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.as_ref()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn new_in_memory() -> Result<Self, SqliteStorageError> {
        // every connection to `:memory:` is its own database, and closing
        // the only one drops it
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }
}

const COMMAND_COLUMNS: &str =
    "id, device_id, module_id, name, params, status, response, created_at, updated_at";

#[async_trait]
impl CommandStore for SqliteStorage {
    type Error = SqliteStorageError;

    async fn insert_command(&self, command: Command) -> Result<(), Self::Error> {
        let response = command
            .response
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO commands (id, device_id, module_id, name, params, status, response, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(command.id.to_string())
        .bind(command.device_id.as_str())
        .bind(command.module_id.as_ref().map(ModuleId::as_str))
        .bind(&*command.name)
        .bind(serde_json::to_string(&command.params)?)
        .bind(command.status.as_str())
        .bind(response)
        .bind(command.created_at.as_microsecond())
        .bind(command.updated_at.as_microsecond())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_command(&self, id: CommandId) -> Result<Option<Command>, Self::Error> {
        let row = sqlx::query(&format!("SELECT {COMMAND_COLUMNS} FROM commands WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(map_row_to_command).transpose()
    }

    async fn pending_commands(
        &self,
        device_id: &DeviceId,
        limit: usize,
    ) -> Result<Vec<Command>, Self::Error> {
        let rows = sqlx::query(&format!(
            "SELECT {COMMAND_COLUMNS} FROM commands \
             WHERE device_id = ? AND status = 'pending' \
             ORDER BY created_at ASC, seq ASC LIMIT ?"
        ))
        .bind(device_id.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_row_to_command).collect()
    }

    async fn mark_sent(&self, ids: &[CommandId]) -> Result<usize, Self::Error> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut query_builder =
            QueryBuilder::<Sqlite>::new("UPDATE commands SET status = 'sent', updated_at = ");
        query_builder.push_bind(jiff::Timestamp::now().as_microsecond());
        query_builder.push(" WHERE status = 'pending' AND id IN (");

        let mut separated = query_builder.separated(", ");
        for id in ids {
            separated.push_bind(id.to_string());
        }
        separated.push_unseparated(")");

        let result = query_builder.build().execute(&self.pool).await?;

        Ok(result.rows_affected() as usize)
    }

    async fn complete_command(
        &self,
        id: CommandId,
        reporter: Option<&DeviceId>,
        status: CommandStatus,
        response: Option<serde_json::Value>,
    ) -> Result<Completion, Self::Error> {
        let response = response.as_ref().map(serde_json::to_string).transpose()?;

        // Guarded update: a single statement decides the race between two acks.
        let mut query_builder = QueryBuilder::<Sqlite>::new("UPDATE commands SET status = ");
        query_builder.push_bind(status.as_str());
        query_builder.push(", response = COALESCE(");
        query_builder.push_bind(response);
        query_builder.push(", response), updated_at = ");
        query_builder.push_bind(jiff::Timestamp::now().as_microsecond());
        query_builder.push(" WHERE id = ");
        query_builder.push_bind(id.to_string());
        if let Some(reporter) = reporter {
            query_builder.push(" AND device_id = ");
            query_builder.push_bind(reporter.as_str());
        }
        query_builder.push(" AND status IN ('pending', 'sent')");

        let updated = query_builder.build().execute(&self.pool).await?.rows_affected();

        let Some(command) = self.get_command(id).await? else {
            return Ok(Completion::NotFound);
        };

        if updated > 0 {
            return Ok(Completion::Completed(command));
        }

        if let Some(reporter) = reporter
            && *reporter != command.device_id
        {
            return Ok(Completion::DeviceMismatch);
        }

        Ok(Completion::AlreadyFinal(command.status))
    }
}

#[async_trait]
impl ReadingStore for SqliteStorage {
    type Error = SqliteStorageError;

    async fn insert_readings(&self, readings: Vec<Reading>) -> Result<(), Self::Error> {
        if readings.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for reading in readings {
            sqlx::query(
                r#"
                INSERT INTO readings (device_id, module_id, temperature, humidity, timestamp)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(reading.device_id.as_str())
            .bind(reading.module_id.as_ref().map(ModuleId::as_str))
            .bind(reading.temperature.into_inner())
            .bind(reading.humidity.into_inner())
            .bind(reading.timestamp.as_microsecond())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn readings_for_device(&self, device_id: &DeviceId) -> Result<Vec<Reading>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT device_id, module_id, temperature, humidity, timestamp
            FROM readings WHERE device_id = ?
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(device_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_row_to_reading).collect()
    }

    async fn reading_count(&self) -> Result<usize, Self::Error> {
        let count: i64 = sqlx::query("SELECT COUNT(*) FROM readings")
            .fetch_one(&self.pool)
            .await?
            .try_get(0)?;

        Ok(count as usize)
    }
}

fn timestamp(micros: i64) -> Result<jiff::Timestamp, SqliteStorageError> {
    jiff::Timestamp::from_microsecond(micros)
        .map_err(|_| SqliteStorageError::InvalidTimestamp(micros))
}

fn map_row_to_command(r: &SqliteRow) -> Result<Command, SqliteStorageError> {
    let id_str: String = r.try_get("id")?;
    let id = CommandId::from_str(&id_str).map_err(|_| SqliteStorageError::InvalidUlid(id_str))?;

    let device_id: String = r.try_get("device_id")?;
    let module_id: Option<String> = r.try_get("module_id")?;
    let name: String = r.try_get("name")?;

    let params: String = r.try_get("params")?;
    let params = serde_json::from_str(&params)?;

    let status_str: String = r.try_get("status")?;
    let status = CommandStatus::from_str(&status_str)
        .map_err(|_| SqliteStorageError::InvalidStatus(status_str))?;

    let response: Option<String> = r.try_get("response")?;
    let response = response.as_deref().map(serde_json::from_str).transpose()?;

    Ok(Command {
        id,
        device_id: DeviceId::from(device_id),
        module_id: module_id.as_deref().and_then(ModuleId::from_wire),
        name: name.into_boxed_str(),
        params,
        status,
        response,
        created_at: timestamp(r.try_get("created_at")?)?,
        updated_at: timestamp(r.try_get("updated_at")?)?,
    })
}

fn map_row_to_reading(r: &SqliteRow) -> Result<Reading, SqliteStorageError> {
    let device_id: String = r.try_get("device_id")?;
    let module_id: Option<String> = r.try_get("module_id")?;

    let temperature: f64 = r.try_get("temperature")?;
    let humidity: f64 = r.try_get("humidity")?;

    Ok(Reading {
        device_id: DeviceId::from(device_id),
        module_id: module_id.as_deref().and_then(ModuleId::from_wire),
        timestamp: timestamp(r.try_get("timestamp")?)?,
        temperature: NotNan::new(temperature)
            .map_err(|_| SqliteStorageError::NotANumber("temperature"))?,
        humidity: NotNan::new(humidity).map_err(|_| SqliteStorageError::NotANumber("humidity"))?,
    })
}
