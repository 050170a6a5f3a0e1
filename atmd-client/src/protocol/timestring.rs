//! Time strings used by the ATMD protocol.
//!
//! Timing settings travel as a decimal magnitude followed by a one-letter
//! unit: `u` (µs), `m` (ms), `s`, `M` (minutes) or `h`. For example `10s`,
//! `2.5M`, `150u`.
//!
//! The value `0u` is the "leave unchanged" sentinel of the configuration
//! form: settings holding it are not transmitted (see [`crate::DeviceConfig`]).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::AtmdError;

static TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+\.?\d*)([umsMh]?)$").expect("valid time string regex"));

/// Unit suffix of a [`TimeString`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::EnumIter)]
pub enum TimeUnit {
    /// `u`: microseconds
    Micros,
    /// `m`: milliseconds
    Millis,
    /// `s`: seconds
    Seconds,
    /// `M`: minutes
    Minutes,
    /// `h`: hours
    Hours,
}

impl TimeUnit {
    pub fn from_suffix(c: char) -> Option<Self> {
        match c {
            'u' => Some(TimeUnit::Micros),
            'm' => Some(TimeUnit::Millis),
            's' => Some(TimeUnit::Seconds),
            'M' => Some(TimeUnit::Minutes),
            'h' => Some(TimeUnit::Hours),
            _ => None,
        }
    }

    pub fn suffix(self) -> char {
        match self {
            TimeUnit::Micros => 'u',
            TimeUnit::Millis => 'm',
            TimeUnit::Seconds => 's',
            TimeUnit::Minutes => 'M',
            TimeUnit::Hours => 'h',
        }
    }

    /// Length of one unit in seconds.
    pub fn seconds(self) -> f64 {
        match self {
            TimeUnit::Micros => 1e-6,
            TimeUnit::Millis => 1e-3,
            TimeUnit::Seconds => 1.0,
            TimeUnit::Minutes => 60.0,
            TimeUnit::Hours => 3600.0,
        }
    }
}

/// A magnitude plus optional unit, kept in its original spelling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeString {
    magnitude: String,
    unit: Option<TimeUnit>,
}

impl TimeString {
    /// Build from a numeric value and unit (`TimeString::new(10.0, TimeUnit::Seconds)` is `10s`).
    pub fn new(value: f64, unit: TimeUnit) -> Self {
        Self {
            magnitude: format!("{value}"),
            unit: Some(unit),
        }
    }

    /// The `0u` "leave unchanged" sentinel.
    pub fn noop() -> Self {
        Self {
            magnitude: "0".to_string(),
            unit: Some(TimeUnit::Micros),
        }
    }

    /// Whether this is exactly the `0u` sentinel (compared textually).
    pub fn is_noop(&self) -> bool {
        self.to_string() == "0u"
    }

    pub fn value(&self) -> f64 {
        self.magnitude.parse().unwrap_or(0.0)
    }

    pub fn unit(&self) -> Option<TimeUnit> {
        self.unit
    }

    /// Physical duration. A missing unit is read as microseconds, the
    /// server's base unit. Saturates at `Duration::MAX`.
    pub fn as_duration(&self) -> Duration {
        let unit = self.unit.unwrap_or(TimeUnit::Micros);
        Duration::try_from_secs_f64((self.value() * unit.seconds()).max(0.0))
            .unwrap_or(Duration::MAX)
    }

    /// Seconds used for the measurement countdown.
    ///
    /// Only `s`, `M` and `h` count; any other unit (or none) yields 0,
    /// meaning the run has no countdown.
    pub fn countdown_seconds(&self) -> f64 {
        match self.unit {
            Some(unit @ (TimeUnit::Seconds | TimeUnit::Minutes | TimeUnit::Hours)) => {
                self.value() * unit.seconds()
            }
            _ => 0.0,
        }
    }
}

impl Default for TimeString {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Display for TimeString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit {
            Some(unit) => write!(f, "{}{}", self.magnitude, unit.suffix()),
            None => f.write_str(&self.magnitude),
        }
    }
}

impl FromStr for TimeString {
    type Err = AtmdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = TIME_RE
            .captures(s.trim())
            .ok_or_else(|| AtmdError::InvalidCommand(format!("invalid time string '{s}'")))?;
        let finite = caps[1].parse::<f64>().is_ok_and(f64::is_finite);
        if !finite {
            return Err(AtmdError::InvalidCommand(format!(
                "time string '{s}' is out of range"
            )));
        }
        Ok(Self {
            magnitude: caps[1].to_string(),
            unit: caps[2].chars().next().and_then(TimeUnit::from_suffix),
        })
    }
}

impl TryFrom<String> for TimeString {
    type Error = AtmdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeString> for String {
    fn from(t: TimeString) -> Self {
        t.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use strum::IntoEnumIterator;

    #[test]
    fn test_parse_preserves_spelling() {
        for text in ["10s", "2.50M", "1h", "150u", "12m", "42"] {
            let t: TimeString = text.parse().unwrap();
            assert_eq!(t.to_string(), text);
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for text in ["", "s", "10x", "-5s", "1.2.3s", "10 s"] {
            assert!(text.parse::<TimeString>().is_err(), "{text}");
        }
    }

    #[test]
    fn test_suffix_roundtrip() {
        for unit in TimeUnit::iter() {
            assert_eq!(TimeUnit::from_suffix(unit.suffix()), Some(unit));
        }
    }

    #[test]
    fn test_countdown_seconds() {
        let cases = [
            ("120s", 120.0),
            ("5M", 300.0),
            ("2h", 7200.0),
            ("1.5M", 90.0),
            ("500u", 0.0),
            ("250m", 0.0),
            ("30", 0.0),
        ];
        for (text, expected) in cases {
            let t: TimeString = text.parse().unwrap();
            assert_relative_eq!(t.countdown_seconds(), expected);
        }
    }

    #[test]
    fn test_as_duration() {
        let t: TimeString = "250m".parse().unwrap();
        assert_eq!(t.as_duration(), Duration::from_millis(250));
        let t: TimeString = "2M".parse().unwrap();
        assert_eq!(t.as_duration(), Duration::from_secs(120));
    }

    #[test]
    fn test_huge_magnitudes() {
        let t: TimeString = "99999999999999999999h".parse().unwrap();
        assert_eq!(t.as_duration(), Duration::MAX);
        assert!(t.countdown_seconds().is_finite());

        let digits = "9".repeat(400);
        assert!(format!("{digits}s").parse::<TimeString>().is_err());
    }

    #[test]
    fn test_noop_sentinel() {
        assert!(TimeString::noop().is_noop());
        assert!("0u".parse::<TimeString>().unwrap().is_noop());
        assert!(!"0s".parse::<TimeString>().unwrap().is_noop());
        assert!(!"0.0u".parse::<TimeString>().unwrap().is_noop());
        assert_eq!(TimeString::new(10.0, TimeUnit::Seconds).to_string(), "10s");
    }

    #[test]
    fn test_serde_as_plain_string() {
        let t: TimeString = "10s".parse().unwrap();
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, "\"10s\"");
        let back: TimeString = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }
}
