use serde::Serialize;
use tether_core::Reading;

use super::BufferedReading;

/// Minimum change against the last kept reading for a new one to be kept.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    pub temperature: f64,
    pub humidity: f64,
}

impl Thresholds {
    pub fn new(temperature: f64, humidity: f64) -> Self {
        Self {
            temperature: temperature.abs(),
            humidity: humidity.abs(),
        }
    }

    /// Both thresholds at zero turn reduction off.
    pub fn is_disabled(&self) -> bool {
        self.temperature == 0.0 && self.humidity == 0.0
    }

    fn is_significant(&self, previous: &Reading, next: &Reading) -> bool {
        let d_temp = (next.temperature.into_inner() - previous.temperature.into_inner()).abs();
        let d_humid = (next.humidity.into_inner() - previous.humidity.into_inner()).abs();
        d_temp >= self.temperature || d_humid >= self.humidity
    }
}

/// Readings of one device worth persisting, in arrival order.
///
/// The first reading is always kept, then every reading that moved far
/// enough from the last kept one, then the final reading unless it equals
/// the last kept one.
pub fn significant_changes(batch: &[BufferedReading], thresholds: Thresholds) -> Vec<Reading> {
    if thresholds.is_disabled() {
        return batch.iter().map(|b| b.reading.clone()).collect();
    }

    let Some((first, rest)) = batch.split_first() else {
        return Vec::new();
    };

    let mut kept = vec![first.reading.clone()];
    for buffered in rest {
        let last = &kept[kept.len() - 1];
        if thresholds.is_significant(last, &buffered.reading) {
            kept.push(buffered.reading.clone());
        }
    }

    if let Some(final_reading) = rest.last()
        && kept.last() != Some(&final_reading.reading)
    {
        kept.push(final_reading.reading.clone());
    }

    kept
}
