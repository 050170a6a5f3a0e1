//! High-level ATMD client.
//!
//! [`AtmdClient`] wraps a [`Session`] with typed accessors for the board
//! settings and the measurement store, and keeps the local
//! [`MeasurementTracker`] in step with the commands it sends.
//!
//! # Overview
//!
//! - **Timing**: [`total_time`](AtmdClient::total_time),
//!   [`window_time`](AtmdClient::window_time), [`deadtime`](AtmdClient::deadtime)
//!   and their setters
//! - **Storage settings**: [`prefix`](AtmdClient::prefix),
//!   [`autosave`](AtmdClient::autosave), [`monitor`](AtmdClient::monitor)
//! - **Measurement control**: [`start_measurement`](AtmdClient::start_measurement),
//!   [`stop_measurement`](AtmdClient::stop_measurement),
//!   [`poll_status`](AtmdClient::poll_status)
//! - **Stored measurements**: [`list_measurements`](AtmdClient::list_measurements),
//!   [`measurement_stats`](AtmdClient::measurement_stats),
//!   [`save_measurement`](AtmdClient::save_measurement),
//!   [`delete_measurement`](AtmdClient::delete_measurement),
//!   [`clear_measurements`](AtmdClient::clear_measurements)
//!
//! # Example
//!
//! ```no_run
//! use atmd_client::{AtmdClient, TimeString};
//!
//! let mut atmd = AtmdClient::connect_host("192.168.1.20")?;
//!
//! let duration: TimeString = "2M".parse()?;
//! atmd.set_total_time(&duration)?;
//! atmd.start_measurement(&duration)?;
//!
//! let update = atmd.poll_status()?;
//! println!("{} {}", update.status, update.countdown);
//! # Ok::<(), atmd_client::AtmdError>(())
//! ```

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Instant;

use tracing::{debug, info};

use crate::config::validate_token;
use crate::error::{AtmdError, AtmdResult};
use crate::measurement::{MeasurementTracker, StatusUpdate};
use crate::protocol::{
    Agent, Command, MeasurementEntry, MeasurementStats, MonitorConfig, Response, TimeString,
    TimingKey,
};
use crate::session::{Session, Transport, DEFAULT_PORT};

/// Typed driver for an ATMD server.
pub struct AtmdClient<T: Transport = TcpStream> {
    session: Session<T>,
    tracker: MeasurementTracker,
}

impl AtmdClient<TcpStream> {
    /// Connect to an ATMD server at `addr` (IP:port).
    ///
    /// # Errors
    ///
    /// Returns [`AtmdError::ConnectionFailed`] if the TCP connection cannot be
    /// established.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> AtmdResult<Self> {
        Ok(Self::from_session(Session::connect(addr)?))
    }

    /// Connect to an ATMD server on the default port (2606).
    pub fn connect_host(host: &str) -> AtmdResult<Self> {
        Self::connect(format!("{host}:{DEFAULT_PORT}"))
    }
}

impl<T: Transport> AtmdClient<T> {
    /// Wrap an existing session. The tracker starts `Idle`.
    pub fn from_session(session: Session<T>) -> Self {
        Self {
            session,
            tracker: MeasurementTracker::new(),
        }
    }

    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session<T> {
        &mut self.session
    }

    pub fn tracker(&self) -> &MeasurementTracker {
        &self.tracker
    }

    /// Send a command line as typed and return the decoded reply.
    pub fn raw(&mut self, command: &str) -> AtmdResult<Response> {
        self.session.send_command(command)
    }

    /// Close the connection and return the transport.
    pub fn close(self) -> T {
        self.session.close()
    }

    fn run(&mut self, command: Command) -> AtmdResult<Response> {
        self.session.execute(&command, false)
    }

    fn run_ack(&mut self, command: Command) -> AtmdResult<()> {
        match self.run(command.clone())? {
            Response::Ack => Ok(()),
            other => Err(mismatch(&command, &other)),
        }
    }

    // ==================== Timing ====================

    /// Read one of the timing settings.
    pub fn timing(&mut self, key: TimingKey) -> AtmdResult<TimeString> {
        let command = Command::get(key.as_str())?;
        match self.run(command.clone())? {
            Response::Timing { key: got, value } if got == key => Ok(value),
            other => Err(mismatch(&command, &other)),
        }
    }

    /// Write one of the timing settings.
    pub fn set_timing(&mut self, key: TimingKey, value: &TimeString) -> AtmdResult<()> {
        self.run_ack(Command::set(&format!("{} {}", key.as_str(), value))?)
    }

    /// Total measurement time (`TT`).
    pub fn total_time(&mut self) -> AtmdResult<TimeString> {
        self.timing(TimingKey::TotalTime)
    }

    pub fn set_total_time(&mut self, value: &TimeString) -> AtmdResult<()> {
        self.set_timing(TimingKey::TotalTime, value)
    }

    /// Start window time (`ST`).
    pub fn window_time(&mut self) -> AtmdResult<TimeString> {
        self.timing(TimingKey::WindowTime)
    }

    pub fn set_window_time(&mut self, value: &TimeString) -> AtmdResult<()> {
        self.set_timing(TimingKey::WindowTime, value)
    }

    /// Deadtime between windows (`TD`).
    pub fn deadtime(&mut self) -> AtmdResult<TimeString> {
        self.timing(TimingKey::Deadtime)
    }

    pub fn set_deadtime(&mut self, value: &TimeString) -> AtmdResult<()> {
        self.set_timing(TimingKey::Deadtime, value)
    }

    // ==================== Storage settings ====================

    /// File name prefix for autosaved measurements; empty when unset.
    pub fn prefix(&mut self) -> AtmdResult<String> {
        let command = Command::get("PREFIX")?;
        match self.run(command.clone())? {
            Response::Prefix(prefix) => Ok(prefix),
            other => Err(mismatch(&command, &other)),
        }
    }

    /// Set the autosave prefix.
    ///
    /// # Errors
    ///
    /// [`AtmdError::InvalidCommand`] if `prefix` is not a plain path token.
    pub fn set_prefix(&mut self, prefix: &str) -> AtmdResult<()> {
        validate_token("prefix", prefix)?;
        self.run_ack(Command::set(&format!("PREFIX {prefix}"))?)
    }

    /// Autosave interval in starts; 0 when autosave is off.
    pub fn autosave(&mut self) -> AtmdResult<u32> {
        let command = Command::get("AUTOSAVE")?;
        match self.run(command.clone())? {
            Response::Autosave(count) => Ok(count),
            other => Err(mismatch(&command, &other)),
        }
    }

    pub fn set_autosave(&mut self, count: u32) -> AtmdResult<()> {
        self.run_ack(Command::set(&format!("AUTOSAVE {count}"))?)
    }

    /// Live monitor settings; all zero when the monitor is off.
    pub fn monitor(&mut self) -> AtmdResult<MonitorConfig> {
        let command = Command::get("MONITOR")?;
        match self.run(command.clone())? {
            Response::Monitor(monitor) => Ok(monitor),
            other => Err(mismatch(&command, &other)),
        }
    }

    /// Enable the live monitor, or disable it with `None`.
    pub fn set_monitor(&mut self, monitor: Option<&MonitorConfig>) -> AtmdResult<()> {
        let command = match monitor {
            Some(m) => {
                validate_token("monitor filename", &m.filename)?;
                Command::set(&format!("MONITOR {} {} {}", m.save, m.count, m.filename))?
            }
            None => Command::set("NOMONITOR")?,
        };
        self.run_ack(command)
    }

    /// Set the output file format.
    pub fn set_format(&mut self, format: u32) -> AtmdResult<()> {
        self.run_ack(Command::set(&format!("FORMAT {format}"))?)
    }

    /// Network agents known to the server.
    pub fn agents(&mut self) -> AtmdResult<Vec<Agent>> {
        let command = Command::get("AGENTS")?;
        match self.run(command.clone())? {
            Response::Agents(agents) => Ok(agents),
            other => Err(mismatch(&command, &other)),
        }
    }

    // ==================== Measurement control ====================

    /// Start a measurement and begin timing it locally.
    ///
    /// `duration` only drives the countdown; set the board's total time with
    /// [`set_total_time`](Self::set_total_time). The tracker moves to
    /// `Running` only if the server acknowledges the start.
    pub fn start_measurement(&mut self, duration: &TimeString) -> AtmdResult<()> {
        self.run_ack(Command::msr("START")?)?;
        self.tracker.start(duration, Instant::now());
        Ok(())
    }

    /// Stop the running measurement.
    ///
    /// The tracker returns to `Idle` on the next poll that reports `IDLE`.
    pub fn stop_measurement(&mut self) -> AtmdResult<()> {
        self.run_ack(Command::msr("STOP")?)
    }

    /// Query the board status (logged).
    pub fn status(&mut self) -> AtmdResult<String> {
        let command = Command::msr("STATUS")?;
        match self.run(command.clone())? {
            Response::Status(status) => Ok(status),
            other => Err(mismatch(&command, &other)),
        }
    }

    /// Query the board status without logging and update the tracker.
    pub fn poll_status(&mut self) -> AtmdResult<StatusUpdate> {
        let command = Command::msr("STATUS")?;
        match self.session.execute(&command, true)? {
            Response::Status(status) => {
                let update = self.tracker.observe(&status, Instant::now());
                if update.finished {
                    info!("ATMD reports measurement finished");
                }
                Ok(update)
            }
            other => Err(mismatch(&command, &other)),
        }
    }

    // ==================== Stored measurements ====================

    /// Measurements held by the server.
    pub fn list_measurements(&mut self) -> AtmdResult<Vec<MeasurementEntry>> {
        let command = Command::msr("LST")?;
        match self.run(command.clone())? {
            Response::Measurements(list) => Ok(list),
            other => Err(mismatch(&command, &other)),
        }
    }

    /// Statistics of measurement `id`.
    ///
    /// Cumulative statistics (`MSR STAT -<id>`) come back as one line.
    /// Otherwise the server sends one line per start.
    pub fn measurement_stats(
        &mut self,
        id: u32,
        cumulative: bool,
    ) -> AtmdResult<Vec<MeasurementStats>> {
        let argument = if cumulative {
            format!("STAT -{id}")
        } else {
            format!("STAT {id}")
        };
        let command = Command::msr(&argument)?;
        match self.run(command.clone())? {
            Response::Statistics(stats) => Ok(vec![stats]),
            Response::StatisticsList(list) => Ok(list),
            other => Err(mismatch(&command, &other)),
        }
    }

    /// List all measurements with their cumulative statistics.
    pub fn measurement_table(&mut self) -> AtmdResult<Vec<(MeasurementEntry, MeasurementStats)>> {
        let entries = self.list_measurements()?;
        let mut rows = Vec::with_capacity(entries.len());
        for entry in entries {
            let stats = self
                .measurement_stats(entry.id, true)?
                .into_iter()
                .next()
                .unwrap_or_default();
            rows.push((entry, stats));
        }
        debug!("Fetched statistics for {} measurements", rows.len());
        Ok(rows)
    }

    /// Save measurement `id` to `filename` on the server.
    pub fn save_measurement(&mut self, id: u32, filename: &str) -> AtmdResult<()> {
        validate_token("filename", filename)?;
        self.run_ack(Command::msr(&format!("SAV {id} {filename}"))?)
    }

    pub fn delete_measurement(&mut self, id: u32) -> AtmdResult<()> {
        self.run_ack(Command::msr(&format!("DEL {id}"))?)
    }

    /// Delete every stored measurement.
    pub fn clear_measurements(&mut self) -> AtmdResult<()> {
        self.run_ack(Command::msr("CLR")?)
    }
}

fn mismatch(command: &Command, response: &Response) -> AtmdError {
    AtmdError::UnexpectedResponse {
        command: command.to_string(),
        response: format!("{response:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::MeasurementPhase;
    use crate::mock::ScriptedTransport;

    fn client(replies: &[&[u8]]) -> AtmdClient<ScriptedTransport> {
        AtmdClient::from_session(Session::new(ScriptedTransport::with_replies(replies)).unwrap())
    }

    fn written(client: AtmdClient<ScriptedTransport>) -> Vec<String> {
        client.close().written_lines()
    }

    #[test]
    fn test_timing_roundtrip() {
        let mut atmd = client(&[b"ACK\r\n", b"VAL TT 2M\r\n"]);
        let t: TimeString = "2M".parse().unwrap();
        atmd.set_total_time(&t).unwrap();
        assert_eq!(atmd.total_time().unwrap(), t);
        assert_eq!(written(atmd), vec!["SET TT 2M", "GET TT"]);
    }

    #[test]
    fn test_timing_key_mismatch() {
        let mut atmd = client(&[b"VAL ST 20u\r\n"]);
        let err = atmd.total_time().unwrap_err();
        assert!(matches!(err, AtmdError::UnexpectedResponse { .. }));
    }

    #[test]
    fn test_set_prefix_validates_locally() {
        let mut atmd = client(&[]);
        let err = atmd.set_prefix("bad name").unwrap_err();
        assert!(matches!(err, AtmdError::InvalidCommand(_)));
        assert!(written(atmd).is_empty());
    }

    #[test]
    fn test_monitor_on_off() {
        let mut atmd = client(&[b"ACK\r\n", b"ACK\r\n"]);
        let monitor = MonitorConfig {
            save: 10,
            count: 100,
            filename: "live.mat".into(),
        };
        atmd.set_monitor(Some(&monitor)).unwrap();
        atmd.set_monitor(None).unwrap();
        assert_eq!(
            written(atmd),
            vec!["SET MONITOR 10 100 live.mat", "SET NOMONITOR"]
        );
    }

    #[test]
    fn test_start_moves_tracker_only_on_ack() {
        let duration: TimeString = "10s".parse().unwrap();

        let mut atmd = client(&[b"ERR 6:MEAS_RUNNING\r\n"]);
        let err = atmd.start_measurement(&duration).unwrap_err();
        assert!(matches!(err, AtmdError::DeviceRejected { .. }));
        assert_eq!(atmd.tracker().phase(), MeasurementPhase::Idle);

        let mut atmd = client(&[b"ACK\r\n"]);
        atmd.start_measurement(&duration).unwrap();
        assert_eq!(atmd.tracker().phase(), MeasurementPhase::Running);
        assert!(atmd.tracker().started_at().is_some());
    }

    #[test]
    fn test_start_with_unknown_msr_reply_stays_idle() {
        let mut atmd = client(&[b"MSR BOGUS 1\r\n"]);
        let err = atmd.start_measurement(&"10s".parse().unwrap()).unwrap_err();
        assert!(matches!(err, AtmdError::UnexpectedResponse { .. }));
        assert_eq!(atmd.tracker().phase(), MeasurementPhase::Idle);
        assert_eq!(atmd.tracker().started_at(), None);
    }

    #[test]
    fn test_poll_with_huge_duration() {
        let mut atmd = client(&[b"ACK\r\n", b"MSR STATUS RUNNING\r\n"]);
        atmd.start_measurement(&"99999999999999999999h".parse().unwrap())
            .unwrap();
        let update = atmd.poll_status().unwrap();
        assert_eq!(update.phase, MeasurementPhase::Running);
        assert!(!update.countdown.is_overrun());
    }

    #[test]
    fn test_poll_status_finishes_run_silently() {
        let mut atmd = client(&[
            b"ACK\r\n",
            b"MSR STATUS RUNNING\r\n",
            b"MSR STATUS IDLE\r\n",
        ]);
        atmd.start_measurement(&"1M".parse().unwrap()).unwrap();
        let log_len = atmd.session().log().len();

        let update = atmd.poll_status().unwrap();
        assert_eq!(update.phase, MeasurementPhase::Running);
        assert!(!update.finished);
        assert!(update.countdown.seconds() > 59.0);

        let update = atmd.poll_status().unwrap();
        assert!(update.finished);
        assert_eq!(update.phase, MeasurementPhase::Idle);
        assert_eq!(update.countdown.to_string(), "00:00:00");

        assert_eq!(atmd.session().log().len(), log_len);
    }

    #[test]
    fn test_measurement_stats_cumulative_command() {
        let mut atmd = client(&[
            b"MSR STAT 3 20 1 2 3 4 5 6 7 8\r\n",
            b"MSR STAT NUM 2\r\nMSR STAT 1 20 0 0 0 0 0 0 0 1\r\nMSR STAT 1 20 0 0 0 0 0 0 0 2\r\n",
        ]);
        let cumulative = atmd.measurement_stats(4, true).unwrap();
        assert_eq!(cumulative.len(), 1);
        assert_eq!(cumulative[0].fields()[0], 3);

        let per_start = atmd.measurement_stats(4, false).unwrap();
        assert_eq!(per_start.len(), 2);
        assert_eq!(per_start[1].fields()[9], 2);

        assert_eq!(written(atmd), vec!["MSR STAT -4", "MSR STAT 4"]);
    }

    #[test]
    fn test_measurement_table() {
        let mut atmd = client(&[
            b"MSR LST NUM 2\r\nMSR LST 0 5\r\nMSR LST 1 2\r\n",
            b"MSR STAT 5 20 1 1 1 1 1 1 1 1\r\n",
            b"MSR STAT 2 20 0 0 0 0 0 0 0 0\r\n",
        ]);
        let rows = atmd.measurement_table().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, MeasurementEntry { id: 0, starts: 5 });
        assert_eq!(rows[0].1.fields()[0], 5);
        assert_eq!(rows[1].1.fields()[0], 2);
        assert_eq!(
            written(atmd),
            vec!["MSR LST", "MSR STAT -0", "MSR STAT -1"]
        );
    }

    #[test]
    fn test_store_commands() {
        let mut atmd = client(&[b"ACK\r\n", b"ACK\r\n", b"ACK\r\n"]);
        atmd.save_measurement(2, "run_2.mat").unwrap();
        atmd.delete_measurement(2).unwrap();
        atmd.clear_measurements().unwrap();
        assert_eq!(
            written(atmd),
            vec!["MSR SAV 2 run_2.mat", "MSR DEL 2", "MSR CLR"]
        );
    }

    #[test]
    fn test_save_rejected_by_device() {
        let mut atmd = client(&[b"ERR 4:SAVE\r\n"]);
        match atmd.save_measurement(9, "x.mat").unwrap_err() {
            AtmdError::DeviceRejected { command, reason } => {
                assert_eq!(command, "MSR SAV 9 x.mat");
                assert_eq!(reason, "4:SAVE");
            }
            e => panic!("unexpected error {e:?}"),
        }
    }
}
