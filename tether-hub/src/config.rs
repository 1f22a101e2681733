use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub buffer: BufferConfig,
    pub commands: CommandsConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address for the HTTP and WebSocket server to listen on
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 3536)),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    #[default]
    Memory,
    Sqlite {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFlushFailure {
    /// Drop the failed batch.
    #[default]
    Discard,
    /// Keep the failed batch for the next cycle.
    Requeue,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Interval in seconds between scheduled flushes
    pub flush_interval_secs: u64,
    /// Minimum temperature change for a reading to be kept
    pub temperature_threshold: f64,
    /// Minimum humidity change for a reading to be kept
    pub humidity_threshold: f64,
    pub on_flush_failure: OnFlushFailure,
    /// Flush once more when the hub shuts down
    pub flush_on_shutdown: bool,
}

impl BufferConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    /// Apply thresholds given on the command line over the file values.
    pub fn with_overrides(mut self, temperature: Option<f64>, humidity: Option<f64>) -> Self {
        if let Some(threshold) = temperature {
            self.temperature_threshold = threshold;
        }
        if let Some(threshold) = humidity {
            self.humidity_threshold = threshold;
        }
        self
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 300,
            temperature_threshold: 0.5,
            humidity_threshold: 2.0,
            on_flush_failure: OnFlushFailure::Discard,
            flush_on_shutdown: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// Poll limit used when a device does not ask for one
    pub default_poll_limit: usize,
    /// Upper bound for a requested poll limit
    pub max_poll_limit: usize,
}

impl CommandsConfig {
    /// Resolve a requested poll limit against the configured bounds.
    pub fn poll_limit(&self, requested: Option<usize>) -> usize {
        let max = self.max_poll_limit.max(1);
        match requested {
            None | Some(0) => self.default_poll_limit.clamp(1, max),
            Some(limit) => limit.min(max),
        }
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            default_poll_limit: 10,
            max_poll_limit: 100,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> color_eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.http_addr.port(), 3536);
        assert!(matches!(config.storage, StorageConfig::Memory));
        assert_eq!(config.buffer.flush_interval(), Duration::from_secs(300));
        assert_eq!(config.buffer.temperature_threshold, 0.5);
        assert_eq!(config.buffer.humidity_threshold, 2.0);
        assert_eq!(config.buffer.on_flush_failure, OnFlushFailure::Discard);
        assert!(config.buffer.flush_on_shutdown);
        assert_eq!(config.commands.default_poll_limit, 10);
    }

    #[test]
    fn parses_full_file() {
        let config: Config = toml::from_str(
            r#"
            [server]
            http_addr = "127.0.0.1:9000"

            [storage]
            type = "sqlite"
            path = "/var/lib/tether/hub.db"

            [buffer]
            flush_interval_secs = 60
            temperature_threshold = 0.0
            humidity_threshold = 0.0
            on_flush_failure = "requeue"
            flush_on_shutdown = false

            [commands]
            default_poll_limit = 5
            max_poll_limit = 20
            "#,
        )
        .unwrap();

        assert_eq!(config.server.http_addr.port(), 9000);
        assert!(
            matches!(config.storage, StorageConfig::Sqlite { ref path } if path == Path::new("/var/lib/tether/hub.db"))
        );
        assert_eq!(config.buffer.flush_interval_secs, 60);
        assert_eq!(config.buffer.on_flush_failure, OnFlushFailure::Requeue);
        assert!(!config.buffer.flush_on_shutdown);
        assert_eq!(config.commands.max_poll_limit, 20);
    }

    #[test]
    fn command_line_thresholds_override_the_file() {
        let config: Config = toml::from_str(
            r#"
            [buffer]
            temperature_threshold = 1.5
            humidity_threshold = 4.0
            "#,
        )
        .unwrap();

        let buffer = config.buffer.with_overrides(Some(0.25), None);

        assert_eq!(buffer.temperature_threshold, 0.25);
        assert_eq!(buffer.humidity_threshold, 4.0);

        let untouched = buffer.with_overrides(None, None);
        assert_eq!(untouched.temperature_threshold, 0.25);
        assert_eq!(untouched.humidity_threshold, 4.0);
    }

    #[test]
    fn poll_limit_falls_back_and_clamps() {
        let commands = CommandsConfig::default();

        assert_eq!(commands.poll_limit(None), 10);
        assert_eq!(commands.poll_limit(Some(0)), 10);
        assert_eq!(commands.poll_limit(Some(3)), 3);
        assert_eq!(commands.poll_limit(Some(5000)), 100);
    }
}
