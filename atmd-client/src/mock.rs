//! Test doubles for ATMD sessions.
//!
//! - [`ScriptedTransport`]: in-memory transport replaying canned byte chunks,
//!   one chunk per read, and recording everything written.
//! - [`MockDevice`]: a small TCP server speaking the ATMD protocol, with
//!   inspectable state. Used by the integration tests and the `mock_atmd`
//!   binary.

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::protocol::{Agent, MonitorConfig, TimeString};
use crate::session::Transport;

/// In-memory transport replaying scripted reads.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    reads: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    close_when_empty: bool,
    fail_writes: bool,
}

impl ScriptedTransport {
    /// Each element is returned by one `read` call, in order.
    pub fn with_replies(replies: &[&[u8]]) -> Self {
        Self {
            reads: replies.iter().map(|r| r.to_vec()).collect(),
            ..Self::default()
        }
    }

    /// Report end-of-stream instead of a timeout once the script runs dry.
    pub fn closing(mut self) -> Self {
        self.close_when_empty = true;
        self
    }

    /// Make every write fail with a broken pipe.
    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    /// Queue another chunk for a later read.
    pub fn push_reply(&mut self, reply: &[u8]) {
        self.reads.push_back(reply.to_vec());
    }

    /// Everything written so far.
    pub fn written(&self) -> &[u8] {
        &self.written
    }

    /// Written bytes split into command lines.
    pub fn written_lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.written)
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Read for ScriptedTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(mut chunk) = self.reads.pop_front() else {
            if self.close_when_empty {
                return Ok(0);
            }
            return Err(io::Error::new(ErrorKind::TimedOut, "script exhausted"));
        };

        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            self.reads.push_front(chunk.split_off(n));
        }
        Ok(n)
    }
}

impl Write for ScriptedTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail_writes {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "scripted write failure"));
        }
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for ScriptedTransport {
    fn set_wait_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }
}

/// Server-side state of a [`MockDevice`].
#[derive(Debug)]
pub struct DeviceState {
    pub total_time: TimeString,
    pub window_time: TimeString,
    pub deadtime: TimeString,
    pub prefix: String,
    pub autosave: u32,
    pub format: u32,
    pub monitor: Option<MonitorConfig>,
    pub agents: Vec<Agent>,
    /// Starts recorded by each stored measurement
    pub measurements: Vec<u32>,
    /// Start of the running measurement, if any
    pub running_since: Option<Instant>,
    /// Never answer (exercises client timeouts)
    pub mute: bool,
    /// Emit an unrecognised line before every reply
    pub noisy: bool,
    /// Every command line received, in order
    pub received: Vec<String>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            total_time: "10s".parse().unwrap_or_default(),
            window_time: "20u".parse().unwrap_or_default(),
            deadtime: "10u".parse().unwrap_or_default(),
            prefix: String::new(),
            autosave: 0,
            format: 12,
            monitor: None,
            agents: Vec::new(),
            measurements: Vec::new(),
            running_since: None,
            mute: false,
            noisy: false,
            received: Vec::new(),
        }
    }
}

impl DeviceState {
    /// Finish the running measurement if its total time has elapsed.
    fn update_run(&mut self) {
        let Some(since) = self.running_since else {
            return;
        };
        let limit = self.total_time.as_duration();
        if !limit.is_zero() && since.elapsed() >= limit {
            self.finish_run();
        }
    }

    fn finish_run(&mut self) {
        if let Some(since) = self.running_since.take() {
            let starts = (since.elapsed().as_millis() / 10).max(1) as u32;
            self.measurements.push(starts);
            info!("Mock measurement finished with {} starts", starts);
        }
    }

    /// Reply lines for one command line.
    fn handle(&mut self, line: &str) -> Vec<String> {
        self.received.push(line.to_string());
        self.update_run();

        let (verb, args) = line.split_once(' ').unwrap_or((line, ""));
        match verb {
            "SET" => vec![self.handle_set(args)],
            "GET" => self.handle_get(args),
            "MSR" => self.handle_msr(args),
            "EXT" => vec!["ACK".to_string()],
            _ => vec![bad_parameter()],
        }
    }

    fn handle_set(&mut self, args: &str) -> String {
        let (key, value) = args.split_once(' ').unwrap_or((args, ""));
        let parse_time = |v: &str| v.parse::<TimeString>().ok().filter(|t| t.unit().is_some());
        match key {
            "TT" | "ST" | "TD" => match parse_time(value) {
                Some(t) => {
                    match key {
                        "TT" => self.total_time = t,
                        "ST" => self.window_time = t,
                        _ => self.deadtime = t,
                    }
                    "ACK".to_string()
                }
                None => "ERR 2:BAD_TIMESTRING".to_string(),
            },
            "PREFIX" if !value.is_empty() => {
                self.prefix = value.to_string();
                "ACK".to_string()
            }
            "FORMAT" | "AUTOSAVE" => match value.parse() {
                Ok(v) => {
                    if key == "FORMAT" {
                        self.format = v;
                    } else {
                        self.autosave = v;
                    }
                    "ACK".to_string()
                }
                Err(_) => bad_parameter(),
            },
            "MONITOR" => {
                let parts: Vec<&str> = value.split_whitespace().collect();
                match parts.as_slice() {
                    [save, count, file] => match (save.parse(), count.parse()) {
                        (Ok(save), Ok(count)) => {
                            self.monitor = Some(MonitorConfig {
                                save,
                                count,
                                filename: file.to_string(),
                            });
                            "ACK".to_string()
                        }
                        _ => bad_parameter(),
                    },
                    _ => bad_parameter(),
                }
            }
            "NOMONITOR" => {
                self.monitor = None;
                "ACK".to_string()
            }
            _ => bad_parameter(),
        }
    }

    fn handle_get(&mut self, args: &str) -> Vec<String> {
        let reply = match args {
            "TT" => format!("VAL TT {}", self.total_time),
            "ST" => format!("VAL ST {}", self.window_time),
            "TD" => format!("VAL TD {}", self.deadtime),
            "PREFIX" if self.prefix.is_empty() => "VAL PREFIX NONE".to_string(),
            "PREFIX" => format!("VAL PREFIX {}", self.prefix),
            "AUTOSAVE" => format!("VAL AUTOSAVE {}", self.autosave),
            "FORMAT" => format!("VAL FORMAT {}", self.format),
            "MONITOR" => match &self.monitor {
                Some(m) => format!("VAL MONITOR {} {} {}", m.save, m.count, m.filename),
                None => "VAL MONITOR 0 0".to_string(),
            },
            "AGENTS" => {
                let mut lines = vec![format!("VAL AGENTS {}", self.agents.len())];
                lines.extend(
                    self.agents
                        .iter()
                        .map(|a| format!("VAL AGENT {} {}", a.id, a.mac)),
                );
                return lines;
            }
            _ => bad_parameter(),
        };
        vec![reply]
    }

    fn handle_msr(&mut self, args: &str) -> Vec<String> {
        let (key, value) = args.split_once(' ').unwrap_or((args, ""));
        let reply = match key {
            "START" if self.running_since.is_some() => "ERR 9:START".to_string(),
            "START" => {
                self.running_since = Some(Instant::now());
                "ACK".to_string()
            }
            "STOP" => {
                self.finish_run();
                "ACK".to_string()
            }
            "STATUS" if self.running_since.is_some() => "MSR STATUS RUNNING".to_string(),
            "STATUS" => "MSR STATUS IDLE".to_string(),
            "LST" | "LIST" => {
                let mut lines = vec![format!("MSR LST NUM {}", self.measurements.len())];
                lines.extend(
                    self.measurements
                        .iter()
                        .enumerate()
                        .map(|(i, starts)| format!("MSR LST {i} {starts}")),
                );
                return lines;
            }
            "STAT" => {
                let index = value.trim_start_matches('-').parse::<usize>().ok();
                match index.and_then(|i| self.measurements.get(i)) {
                    Some(&starts) => {
                        let stops: Vec<String> =
                            (1..=8).map(|ch| (starts / ch).to_string()).collect();
                        format!("MSR STAT {} 20 {}", starts, stops.join(" "))
                    }
                    None => "ERR 8:STAT".to_string(),
                }
            }
            "SAV" | "SAVE" => {
                let (index, file) = value.split_once(' ').unwrap_or((value, ""));
                match index.parse::<usize>() {
                    Ok(i) if i < self.measurements.len() && !file.is_empty() => "ACK".to_string(),
                    _ => "ERR 4:SAVE".to_string(),
                }
            }
            "DEL" => match value.parse::<usize>() {
                Ok(i) if i < self.measurements.len() => {
                    self.measurements.remove(i);
                    "ACK".to_string()
                }
                _ => "ERR 5:DELETE".to_string(),
            },
            "CLR" => {
                self.measurements.clear();
                "ACK".to_string()
            }
            _ => bad_parameter(),
        };
        vec![reply]
    }
}

fn bad_parameter() -> String {
    "ERR 3:BAD_PARAMETER".to_string()
}

/// Fake ATMD server on a local TCP port.
///
/// Serves one client at a time. Stops when dropped.
pub struct MockDevice {
    addr: SocketAddr,
    state: Arc<Mutex<DeviceState>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MockDevice {
    /// Bind to `addr` (use port 0 for an ephemeral port) and start serving.
    pub fn spawn<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Self::spawn_with_state(addr, DeviceState::default())
    }

    pub fn spawn_with_state<A: ToSocketAddrs>(addr: A, state: DeviceState) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let state = Arc::new(Mutex::new(state));
        let shutdown = Arc::new(AtomicBool::new(false));

        let state_clone = state.clone();
        let shutdown_clone = shutdown.clone();
        let handle = thread::spawn(move || {
            Self::accept_loop(listener, state_clone, shutdown_clone);
        });

        info!("Mock ATMD server listening on {}", addr);
        Ok(Self {
            addr,
            state,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Lock the server state for inspection or modification.
    pub fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until a stop is requested (for the stand-alone binary).
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    fn accept_loop(listener: TcpListener, state: Arc<Mutex<DeviceState>>, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!("Mock ATMD client connected from {}", peer);
                    if let Err(e) = Self::serve(stream, &state, &shutdown) {
                        debug!("Mock ATMD client session ended: {}", e);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    warn!("Mock ATMD accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn serve(stream: TcpStream, state: &Mutex<DeviceState>, shutdown: &AtomicBool) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(Duration::from_millis(50)))?;
        let mut writer = stream.try_clone()?;
        let mut reader = BufReader::new(stream);
        let mut line = String::new();

        while !shutdown.load(Ordering::Relaxed) {
            match reader.read_line(&mut line) {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    continue;
                }
                Err(e) => return Err(e),
            }

            let command = line.trim_end().to_string();
            line.clear();
            if command.is_empty() {
                continue;
            }

            let (replies, mute, noisy) = {
                let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                let replies = state.handle(&command);
                (replies, state.mute, state.noisy)
            };
            if mute {
                continue;
            }

            let mut out = String::new();
            if noisy {
                out.push_str("# atmd debug output\r\n\r\n");
            }
            for reply in replies {
                out.push_str(&reply);
                out.push_str("\r\n");
            }
            writer.write_all(out.as_bytes())?;
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
