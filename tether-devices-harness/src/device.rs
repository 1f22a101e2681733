use ordered_float::NotNan;
use rand::Rng;
use tether_core::protocol::SensorData;

/// Temperature/humidity values that drift a little on every sample.
pub struct Sensor {
    module_id: String,
    temperature: f64,
    humidity: f64,
}

impl Sensor {
    pub fn new(module_id: impl Into<String>) -> Self {
        let mut rng = rand::rng();
        Self {
            module_id: module_id.into(),
            temperature: rng.random_range(18.0..28.0),
            humidity: rng.random_range(35.0..65.0),
        }
    }

    pub fn sample(&mut self, device_id: &str) -> Option<SensorData> {
        let mut rng = rand::rng();
        self.temperature = (self.temperature + rng.random_range(-0.8..0.8)).clamp(-10.0, 50.0);
        self.humidity = (self.humidity + rng.random_range(-2.0..2.0)).clamp(0.0, 100.0);

        Some(SensorData {
            device_id: Some(device_id.to_owned()),
            device_module_id: Some(self.module_id.clone()),
            timestamp: jiff::Timestamp::now(),
            temperature: NotNan::new(round(self.temperature)).ok()?,
            humidity: NotNan::new(round(self.humidity)).ok()?,
        })
    }
}

fn round(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Simulated execution of a command: the status to report and a message.
pub fn execute(command: &str) -> (&'static str, String) {
    match command {
        "LED_ON" => ("executed", "LED turned ON".to_owned()),
        "LED_OFF" => ("executed", "LED turned OFF".to_owned()),
        "PING" => ("executed", "pong".to_owned()),
        "CHANGE_WIFI" => ("executed", "WiFi credentials updated".to_owned()),
        other => ("unknown_command", format!("unsupported command {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_stay_in_range() {
        let mut sensor = Sensor::new("m-1");
        for _ in 0..1000 {
            let data = sensor.sample("D1").unwrap();
            assert!((-10.0..=50.0).contains(&data.temperature.into_inner()));
            assert!((0.0..=100.0).contains(&data.humidity.into_inner()));
            assert_eq!(data.device_module_id.as_deref(), Some("m-1"));
        }
    }

    #[test]
    fn unknown_commands_are_reported() {
        assert_eq!(execute("LED_ON").0, "executed");
        assert_eq!(execute("SELF_DESTRUCT").0, "unknown_command");
    }
}
