pub mod reduction;

use std::collections::{BTreeMap, HashMap};
use std::error::Error as StdError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tether_core::{DeviceId, Reading};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use reduction::{Thresholds, significant_changes};

use crate::config::{BufferConfig, OnFlushFailure};
use crate::storage::ReadingStore;

/// A reading held in memory, stamped with when it arrived.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferedReading {
    #[serde(flatten)]
    pub reading: Reading,
    pub buffered_at: jiff::Timestamp,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Devices that had buffered readings.
    pub devices: usize,
    /// Readings taken out of the buffer.
    pub buffered: usize,
    /// Readings written to storage after reduction.
    pub persisted: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum FlushError {
    #[error("failed to persist {readings} buffered readings (requeued: {requeued}): {source}")]
    Storage {
        readings: usize,
        requeued: bool,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferStats {
    pub device_count: usize,
    pub total_readings: usize,
    pub thresholds: Thresholds,
    pub on_flush_failure: &'static str,
}

type Batch = HashMap<DeviceId, Vec<BufferedReading>>;

/// Holds readings in memory and writes them to storage in batches.
pub struct TelemetryBuffer<S> {
    store: S,
    readings: Mutex<Batch>,
    // serialises flushes so a requeued batch is never overtaken
    flushing: tokio::sync::Mutex<()>,
    thresholds: Thresholds,
    on_failure: OnFlushFailure,
}

impl<S: ReadingStore> TelemetryBuffer<S> {
    pub fn new(store: S, thresholds: Thresholds, on_failure: OnFlushFailure) -> Self {
        Self {
            store,
            readings: Mutex::new(HashMap::new()),
            flushing: tokio::sync::Mutex::new(()),
            thresholds,
            on_failure,
        }
    }

    pub fn from_config(store: S, config: &BufferConfig) -> Self {
        Self::new(
            store,
            Thresholds::new(config.temperature_threshold, config.humidity_threshold),
            config.on_flush_failure,
        )
    }

    fn lock(&self) -> MutexGuard<'_, Batch> {
        // the map holds plain data, a panicking holder cannot leave it half-updated
        self.readings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_data_point(&self, reading: Reading) {
        let buffered = BufferedReading {
            buffered_at: jiff::Timestamp::now(),
            reading,
        };
        self.lock()
            .entry(buffered.reading.device_id.clone())
            .or_default()
            .push(buffered);
    }

    /// Reduce and persist everything buffered so far.
    ///
    /// The buffer is swapped out before storage is touched, so readings
    /// arriving meanwhile wait for the next flush.
    pub async fn flush(&self) -> Result<FlushReport, FlushError> {
        let _flushing = self.flushing.lock().await;

        let batch = std::mem::take(&mut *self.lock());
        if batch.is_empty() {
            return Ok(FlushReport::default());
        }

        let devices = batch.len();
        let buffered: usize = batch.values().map(Vec::len).sum();
        let persisted: Vec<Reading> = batch
            .values()
            .flat_map(|readings| significant_changes(readings, self.thresholds))
            .collect();
        let persisted_count = persisted.len();

        if let Err(err) = self.store.insert_readings(persisted).await {
            let requeued = self.on_failure == OnFlushFailure::Requeue;
            if requeued {
                self.requeue(batch);
                error!(error = %err, readings = buffered, "flush failed, readings requeued");
            } else {
                error!(error = %err, readings = buffered, "flush failed, readings dropped");
            }
            return Err(FlushError::Storage {
                readings: buffered,
                requeued,
                source: Box::new(err),
            });
        }

        info!(
            devices,
            buffered,
            persisted = persisted_count,
            "buffer flushed"
        );

        Ok(FlushReport {
            devices,
            buffered,
            persisted: persisted_count,
        })
    }

    // Older readings go back in front of anything that arrived meanwhile.
    fn requeue(&self, batch: Batch) {
        let mut current = self.lock();
        for (device_id, mut older) in batch {
            if let Some(newer) = current.remove(&device_id) {
                older.extend(newer);
            }
            current.insert(device_id, older);
        }
    }

    pub fn stats(&self) -> BufferStats {
        let readings = self.lock();
        BufferStats {
            device_count: readings.len(),
            total_readings: readings.values().map(Vec::len).sum(),
            thresholds: self.thresholds,
            on_flush_failure: match self.on_failure {
                OnFlushFailure::Discard => "discard",
                OnFlushFailure::Requeue => "requeue",
            },
        }
    }

    /// Deep copy of the buffer, keyed by device.
    pub fn snapshot(&self) -> BTreeMap<DeviceId, Vec<BufferedReading>> {
        self.lock()
            .iter()
            .map(|(device_id, readings)| (device_id.clone(), readings.clone()))
            .collect()
    }

    /// Drop every buffered reading without persisting, returning how many.
    pub fn clear(&self) -> usize {
        let dropped = std::mem::take(&mut *self.lock());
        dropped.values().map(Vec::len).sum()
    }
}

/// Flush `buffer` every `period` until `cancel` fires.
///
/// A flush in progress always completes. With `final_flush` set the buffer
/// is flushed once more after cancellation.
pub async fn run_flush_loop<S: ReadingStore>(
    buffer: Arc<TelemetryBuffer<S>>,
    period: Duration,
    final_flush: bool,
    cancel: CancellationToken,
) {
    info!(interval_secs = period.as_secs(), "flush loop started");

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("flush loop shutting down");
                break;
            }
            _ = interval.tick() => {
                // failures are already logged by flush
                let _ = buffer.flush().await;
            }
        }
    }

    if final_flush {
        match buffer.flush().await {
            Ok(report) if report.buffered > 0 => {
                info!(persisted = report.persisted, "final flush complete");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "final flush failed"),
        }
    }
}
