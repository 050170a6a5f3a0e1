//! Client-side measurement tracking.
//!
//! The server only reports whether the board is `IDLE` or `RUNNING`. The
//! remaining time of a run is derived locally from the moment `MSR START`
//! succeeded and the configured total time:
//!
//! ```text
//! remaining = duration - (now - started_at)
//! ```
//!
//! A negative remaining time is an overrun and is shown as `- HH:MM:SS`.
//!
//! State transitions:
//!
//! | From | Trigger | To |
//! |---|---|---|
//! | `Idle` | `MSR START` acknowledged | `Running` (timestamp + duration captured) |
//! | `Running` | poll reports `IDLE` | `Idle` (timestamp + duration cleared) |
//!
//! Any other status text leaves the phase unchanged.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::protocol::TimeString;

/// Status text reported by an idle board.
pub const STATUS_IDLE: &str = "IDLE";
/// Status text reported while a measurement runs.
pub const STATUS_RUNNING: &str = "RUNNING";

/// Local view of the measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum MeasurementPhase {
    #[default]
    Idle,
    Running,
}

/// Remaining time of a run, for display.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Countdown {
    /// No run is being timed; displays as `00:00:00`.
    Inactive,
    /// Time left before the configured duration elapses.
    Remaining(Duration),
    /// Time elapsed past the configured duration.
    Overrun(Duration),
}

impl Countdown {
    /// Magnitudes beyond what a `Duration` holds saturate to `Duration::MAX`.
    fn from_seconds(remaining: f64) -> Self {
        let saturating = |secs: f64| Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        if remaining >= 0.0 {
            Countdown::Remaining(saturating(remaining))
        } else {
            Countdown::Overrun(saturating(-remaining))
        }
    }

    /// Signed remaining seconds (negative while overrunning, zero when inactive).
    pub fn seconds(&self) -> f64 {
        match self {
            Countdown::Inactive => 0.0,
            Countdown::Remaining(d) => d.as_secs_f64(),
            Countdown::Overrun(d) => -d.as_secs_f64(),
        }
    }

    pub fn is_overrun(&self) -> bool {
        matches!(self, Countdown::Overrun(_))
    }
}

impl fmt::Display for Countdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (sign, d) = match self {
            Countdown::Inactive => ("", Duration::ZERO),
            Countdown::Remaining(d) => ("", *d),
            Countdown::Overrun(d) => ("- ", *d),
        };
        let total = d.as_secs();
        write!(
            f,
            "{sign}{:02}:{:02}:{:02}",
            total / 3600,
            (total % 3600) / 60,
            total % 60
        )
    }
}

/// Result of feeding one status poll into the tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    /// Raw status text from the server
    pub status: String,
    /// Phase after the update
    pub phase: MeasurementPhase,
    pub countdown: Countdown,
    /// This poll moved the phase from `Running` to `Idle`
    pub finished: bool,
}

/// IDLE/RUNNING state machine with a locally timed countdown.
#[derive(Debug, Clone, Default)]
pub struct MeasurementTracker {
    phase: MeasurementPhase,
    duration_secs: f64,
    started_at: Option<Instant>,
}

impl MeasurementTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> MeasurementPhase {
        self.phase
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    /// Configured run length in seconds; 0 means no countdown.
    pub fn duration_secs(&self) -> f64 {
        self.duration_secs
    }

    /// Record a successful `MSR START` at `now`.
    ///
    /// Only `s`, `M` and `h` durations produce a countdown; anything else
    /// stores 0 (see [`TimeString::countdown_seconds`]).
    pub fn start(&mut self, duration: &TimeString, now: Instant) {
        self.phase = MeasurementPhase::Running;
        self.duration_secs = duration.countdown_seconds();
        self.started_at = Some(now);
        info!("Measurement running, duration {}s", self.duration_secs);
    }

    /// Like [`start`](Self::start) with the duration given as text.
    /// Text that does not parse as a time string yields no countdown.
    pub fn start_with_text(&mut self, duration: &str, now: Instant) {
        let duration = duration.parse().unwrap_or_else(|_| TimeString::noop());
        self.start(&duration, now);
    }

    /// Feed a status reported by the server at `now`.
    pub fn observe(&mut self, status: &str, now: Instant) -> StatusUpdate {
        let finished = status == STATUS_IDLE && self.phase == MeasurementPhase::Running;
        if finished {
            self.reset();
            info!("Measurement finished");
        }

        StatusUpdate {
            status: status.to_string(),
            phase: self.phase,
            countdown: self.countdown(now),
            finished,
        }
    }

    /// Display value at `now`.
    pub fn countdown(&self, now: Instant) -> Countdown {
        match self.started_at {
            Some(start) => {
                let elapsed = now.saturating_duration_since(start).as_secs_f64();
                Countdown::from_seconds(self.duration_secs - elapsed)
            }
            None => Countdown::Inactive,
        }
    }

    /// Return to `Idle`, clearing timestamp and duration.
    pub fn reset(&mut self) {
        self.phase = MeasurementPhase::Idle;
        self.duration_secs = 0.0;
        self.started_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn started(duration: &str) -> (MeasurementTracker, Instant) {
        let mut tracker = MeasurementTracker::new();
        let t0 = Instant::now();
        tracker.start_with_text(duration, t0);
        (tracker, t0)
    }

    #[test]
    fn test_initially_idle() {
        let tracker = MeasurementTracker::new();
        assert_eq!(tracker.phase(), MeasurementPhase::Idle);
        assert_eq!(tracker.countdown(Instant::now()), Countdown::Inactive);
        assert_eq!(tracker.countdown(Instant::now()).to_string(), "00:00:00");
    }

    #[test]
    fn test_running_countdown_positive() {
        let (mut tracker, t0) = started("120s");
        let update = tracker.observe(STATUS_RUNNING, t0 + Duration::from_secs(50));
        assert_eq!(update.phase, MeasurementPhase::Running);
        assert!(!update.finished);
        assert_relative_eq!(update.countdown.seconds(), 70.0, epsilon = 1e-6);
        assert_eq!(update.countdown.to_string(), "00:01:10");
    }

    #[test]
    fn test_running_overrun_negative() {
        let (mut tracker, t0) = started("120s");
        let update = tracker.observe(STATUS_RUNNING, t0 + Duration::from_secs(130));
        assert!(update.countdown.is_overrun());
        assert_relative_eq!(update.countdown.seconds(), -10.0, epsilon = 1e-6);
        assert_eq!(update.countdown.to_string(), "- 00:00:10");
    }

    #[test]
    fn test_idle_poll_finishes_run() {
        let (mut tracker, t0) = started("120s");
        let update = tracker.observe(STATUS_IDLE, t0 + Duration::from_secs(130));
        assert!(update.finished);
        assert_eq!(update.phase, MeasurementPhase::Idle);
        assert_eq!(update.countdown, Countdown::Inactive);
        assert_eq!(tracker.started_at(), None);
        assert_eq!(tracker.duration_secs(), 0.0);
    }

    #[test]
    fn test_idle_while_idle_is_noop() {
        let mut tracker = MeasurementTracker::new();
        let now = Instant::now();
        for i in 0..5 {
            let update = tracker.observe(STATUS_IDLE, now + Duration::from_secs(i));
            assert!(!update.finished);
            assert_eq!(update.phase, MeasurementPhase::Idle);
            assert_eq!(update.countdown.to_string(), "00:00:00");
        }
    }

    #[test]
    fn test_running_while_idle_does_not_start() {
        let mut tracker = MeasurementTracker::new();
        let update = tracker.observe(STATUS_RUNNING, Instant::now());
        assert_eq!(update.phase, MeasurementPhase::Idle);
        assert_eq!(update.countdown, Countdown::Inactive);
    }

    #[test]
    fn test_other_status_passes_through() {
        let (mut tracker, t0) = started("5M");
        let update = tracker.observe("ERR", t0 + Duration::from_secs(60));
        assert_eq!(update.status, "ERR");
        assert_eq!(update.phase, MeasurementPhase::Running);
        assert_eq!(update.countdown.to_string(), "00:04:00");
    }

    #[test]
    fn test_duration_units() {
        let (tracker, _) = started("2h");
        assert_relative_eq!(tracker.duration_secs(), 7200.0);
        let (tracker, _) = started("5M");
        assert_relative_eq!(tracker.duration_secs(), 300.0);
        let (tracker, _) = started("100u");
        assert_relative_eq!(tracker.duration_secs(), 0.0);
        let (tracker, _) = started("nonsense");
        assert_relative_eq!(tracker.duration_secs(), 0.0);
        assert_eq!(tracker.phase(), MeasurementPhase::Running);
    }

    #[test]
    fn test_display_large_values() {
        let c = Countdown::Remaining(Duration::from_secs(2 * 3600 + 3 * 60 + 4));
        assert_eq!(c.to_string(), "02:03:04");
        let c = Countdown::Overrun(Duration::from_secs_f64(3725.9));
        assert_eq!(c.to_string(), "- 01:02:05");
    }

    #[test]
    fn test_huge_duration_saturates() {
        let (mut tracker, t0) = started("99999999999999999999h");
        let update = tracker.observe(STATUS_RUNNING, t0 + Duration::from_secs(1));
        assert_eq!(update.phase, MeasurementPhase::Running);
        assert_eq!(update.countdown, Countdown::Remaining(Duration::MAX));
        assert!(!update.countdown.to_string().is_empty());

        let update = tracker.observe(STATUS_IDLE, t0 + Duration::from_secs(2));
        assert!(update.finished);
    }

    #[test]
    fn test_no_countdown_shows_elapsed_as_overrun() {
        let (tracker, t0) = started("30");
        let c = tracker.countdown(t0 + Duration::from_secs(15));
        assert_eq!(c.to_string(), "- 00:00:15");
    }
}
