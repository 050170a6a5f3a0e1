//! Client-side connection settings with JSON persistence.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::session::{DEFAULT_PORT, DEFAULT_TIMEOUT};

/// Default status poll period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Where to find the server and how to talk to it.
///
/// Durations are stored as seconds in the JSON file:
///
/// ```json
/// {
///   "host": "192.168.1.20",
///   "port": 2606,
///   "poll_interval": 2.0,
///   "response_timeout": 5.0
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub host: String,
    pub port: u16,
    /// Period of background status polls
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    /// Wait for each read while a reply is pending
    #[serde(with = "duration_secs")]
    pub response_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            response_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ClientSettings {
    /// `host:port`, suitable for [`AtmdClient::connect`](crate::AtmdClient::connect).
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Save to JSON file
    pub fn save_to_file(&self, path: &Path) -> Result<(), std::io::Error> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    /// Load from JSON file. Missing fields take their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self, std::io::Error> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let s = ClientSettings::default();
        assert_eq!(s.address(), "127.0.0.1:2606");
        assert_eq!(s.poll_interval, Duration::from_secs(2));
        assert_eq!(s.response_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("atmd.json");

        let settings = ClientSettings {
            host: "10.0.0.7".into(),
            port: 3000,
            poll_interval: Duration::from_millis(500),
            response_timeout: Duration::from_secs(1),
        };
        settings.save_to_file(&path).unwrap();

        let loaded = ClientSettings::load_from_file(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("atmd.json");
        std::fs::write(&path, r#"{ "host": "atmd.local", "poll_interval": 0.25 }"#).unwrap();

        let loaded = ClientSettings::load_from_file(&path).unwrap();
        assert_eq!(loaded.host, "atmd.local");
        assert_eq!(loaded.port, DEFAULT_PORT);
        assert_eq!(loaded.poll_interval, Duration::from_millis(250));
        assert_eq!(loaded.response_timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("atmd.json");

        std::fs::write(&path, "not json").unwrap();
        let err = ClientSettings::load_from_file(&path).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

        std::fs::write(&path, r#"{ "poll_interval": -1.0 }"#).unwrap();
        assert!(ClientSettings::load_from_file(&path).is_err());

        let missing = dir.path().join("missing.json");
        let err = ClientSettings::load_from_file(&missing).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
