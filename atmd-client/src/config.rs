//! Acquisition configuration transferred to and from the board.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::client::AtmdClient;
use crate::error::{AtmdError, AtmdResult};
use crate::protocol::{MonitorConfig, TimeString, TimingKey};
use crate::session::Transport;

/// Output format written with every configuration.
pub const DEFAULT_FORMAT: u32 = 12;

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._\-/]+$").expect("valid token regex"));

/// Reject values the server could not parse back as a single token.
pub(crate) fn validate_token(what: &str, value: &str) -> AtmdResult<()> {
    if TOKEN_RE.is_match(value) {
        Ok(())
    } else {
        Err(AtmdError::InvalidCommand(format!(
            "invalid {what} {value:?}: only letters, digits and ._-/ are allowed"
        )))
    }
}

/// Settings of one acquisition.
///
/// A timing value equal to `0u` means "leave the board's value alone" and is
/// not transmitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Total measurement time (`TT`)
    pub total_time: TimeString,
    /// Start window time (`ST`)
    pub window_time: TimeString,
    /// Deadtime between windows (`TD`)
    pub deadtime: TimeString,
    /// Autosave file prefix; required when `autosave > 0`
    pub prefix: String,
    /// Autosave every n starts, 0 to disable
    pub autosave: u32,
    pub monitor: Option<MonitorConfig>,
    #[serde(default = "default_format")]
    pub format: u32,
}

fn default_format() -> u32 {
    DEFAULT_FORMAT
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            total_time: TimeString::noop(),
            window_time: TimeString::noop(),
            deadtime: TimeString::noop(),
            prefix: String::new(),
            autosave: 0,
            monitor: None,
            format: DEFAULT_FORMAT,
        }
    }
}

/// A monitor is only switched on when every field is set.
fn monitor_enabled(monitor: &MonitorConfig) -> bool {
    monitor.save > 0 && monitor.count > 0 && !monitor.filename.is_empty()
}

impl DeviceConfig {
    /// Transmit the configuration.
    ///
    /// Stops at the first command that fails and returns its error; commands
    /// already acknowledged stay in effect on the board.
    ///
    /// # Errors
    ///
    /// [`AtmdError::InvalidCommand`] before anything is sent if autosave is
    /// on without a prefix or a token is malformed. Otherwise any error of the
    /// failing command.
    pub fn write_to<T: Transport>(&self, client: &mut AtmdClient<T>) -> AtmdResult<()> {
        self.validate()?;

        let timings = [
            (TimingKey::TotalTime, &self.total_time),
            (TimingKey::WindowTime, &self.window_time),
            (TimingKey::Deadtime, &self.deadtime),
        ];
        for (key, value) in timings {
            if value.is_noop() {
                debug!("Leaving {} unchanged", key.as_str());
                continue;
            }
            client.set_timing(key, value)?;
        }

        if self.autosave > 0 {
            client.set_prefix(&self.prefix)?;
        }
        client.set_autosave(self.autosave)?;
        client.set_format(self.format)?;

        client.set_monitor(self.monitor.as_ref().filter(|m| monitor_enabled(m)))?;

        info!("Configuration written");
        Ok(())
    }

    /// Read the configuration back from the board.
    ///
    /// The format is not readable and is reported as [`DEFAULT_FORMAT`].
    pub fn read_from<T: Transport>(client: &mut AtmdClient<T>) -> AtmdResult<Self> {
        let total_time = client.total_time()?;
        let window_time = client.window_time()?;
        let deadtime = client.deadtime()?;
        let prefix = client.prefix()?;
        let autosave = client.autosave()?;
        let monitor = Some(client.monitor()?).filter(monitor_enabled);

        Ok(Self {
            total_time,
            window_time,
            deadtime,
            prefix,
            autosave,
            monitor,
            format: DEFAULT_FORMAT,
        })
    }

    fn validate(&self) -> AtmdResult<()> {
        if self.autosave > 0 {
            if self.prefix.is_empty() {
                return Err(AtmdError::InvalidCommand(
                    "autosave requires a file prefix".to_string(),
                ));
            }
            validate_token("prefix", &self.prefix)?;
        }
        if let Some(monitor) = self.monitor.as_ref().filter(|m| monitor_enabled(m)) {
            validate_token("monitor filename", &monitor.filename)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedTransport;
    use crate::session::Session;

    fn client(replies: &[&[u8]]) -> AtmdClient<ScriptedTransport> {
        AtmdClient::from_session(Session::new(ScriptedTransport::with_replies(replies)).unwrap())
    }

    fn acks(n: usize) -> Vec<&'static [u8]> {
        vec![b"ACK\r\n".as_slice(); n]
    }

    #[test]
    fn test_validate_token() {
        assert!(validate_token("prefix", "runs/day_1.mat").is_ok());
        assert!(validate_token("prefix", "").is_err());
        assert!(validate_token("prefix", "two words").is_err());
        assert!(validate_token("prefix", "semi;colon").is_err());
    }

    #[test]
    fn test_write_skips_noop_timings() {
        let mut atmd = client(&acks(5));
        let config = DeviceConfig {
            total_time: "10s".parse().unwrap(),
            deadtime: "5u".parse().unwrap(),
            ..DeviceConfig::default()
        };
        config.write_to(&mut atmd).unwrap();
        assert_eq!(
            atmd.close().written_lines(),
            vec![
                "SET TT 10s",
                "SET TD 5u",
                "SET AUTOSAVE 0",
                "SET FORMAT 12",
                "SET NOMONITOR"
            ]
        );
    }

    #[test]
    fn test_write_autosave_and_monitor() {
        let mut atmd = client(&acks(7));
        let config = DeviceConfig {
            total_time: "1h".parse().unwrap(),
            window_time: "20u".parse().unwrap(),
            deadtime: "10u".parse().unwrap(),
            prefix: "data/run".into(),
            autosave: 1000,
            monitor: Some(MonitorConfig {
                save: 10,
                count: 50,
                filename: "mon.mat".into(),
            }),
            format: DEFAULT_FORMAT,
        };
        config.write_to(&mut atmd).unwrap();
        assert_eq!(
            atmd.close().written_lines(),
            vec![
                "SET TT 1h",
                "SET ST 20u",
                "SET TD 10u",
                "SET PREFIX data/run",
                "SET AUTOSAVE 1000",
                "SET FORMAT 12",
                "SET MONITOR 10 50 mon.mat"
            ]
        );
    }

    #[test]
    fn test_incomplete_monitor_disables() {
        let mut atmd = client(&acks(3));
        let config = DeviceConfig {
            monitor: Some(MonitorConfig {
                save: 10,
                count: 0,
                filename: "mon.mat".into(),
            }),
            ..DeviceConfig::default()
        };
        config.write_to(&mut atmd).unwrap();
        assert_eq!(
            atmd.close().written_lines().last().map(String::as_str),
            Some("SET NOMONITOR")
        );
    }

    #[test]
    fn test_autosave_without_prefix_sends_nothing() {
        let mut atmd = client(&acks(5));
        let config = DeviceConfig {
            autosave: 10,
            ..DeviceConfig::default()
        };
        let err = config.write_to(&mut atmd).unwrap_err();
        assert!(matches!(err, AtmdError::InvalidCommand(_)));
        assert!(atmd.close().written_lines().is_empty());
    }

    #[test]
    fn test_write_aborts_on_first_rejection() {
        let mut atmd = client(&[b"ACK\r\n", b"ERR 2:BAD_TIMESTRING\r\n", b"ACK\r\n"]);
        let config = DeviceConfig {
            total_time: "10s".parse().unwrap(),
            window_time: "20u".parse().unwrap(),
            deadtime: "10u".parse().unwrap(),
            ..DeviceConfig::default()
        };
        let err = config.write_to(&mut atmd).unwrap_err();
        assert!(matches!(err, AtmdError::DeviceRejected { .. }));
        assert_eq!(
            atmd.close().written_lines(),
            vec!["SET TT 10s", "SET ST 20u"]
        );
    }

    #[test]
    fn test_read_from() {
        let mut atmd = client(&[
            b"VAL TT 2M\r\n",
            b"VAL ST 20u\r\n",
            b"VAL TD 10u\r\n",
            b"VAL PREFIX NONE\r\n",
            b"VAL AUTOSAVE 0\r\n",
            b"VAL MONITOR 0 0\r\n",
        ]);
        let config = DeviceConfig::read_from(&mut atmd).unwrap();
        assert_eq!(config.total_time.to_string(), "2M");
        assert_eq!(config.window_time.to_string(), "20u");
        assert_eq!(config.deadtime.to_string(), "10u");
        assert_eq!(config.prefix, "");
        assert_eq!(config.autosave, 0);
        assert_eq!(config.monitor, None);
        assert_eq!(config.format, DEFAULT_FORMAT);
    }

    #[test]
    fn test_serde_json() {
        let config = DeviceConfig {
            total_time: "10s".parse().unwrap(),
            ..DeviceConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"total_time\":\"10s\""));
        let back: DeviceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
