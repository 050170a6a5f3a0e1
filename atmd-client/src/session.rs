//! ATMD protocol session.
//!
//! A [`Session`] owns one connection to an ATMD server together with its
//! receive buffer, and runs the request/response exchange:
//!
//! 1. validate and encode the command ([`Command`]),
//! 2. write it to the transport,
//! 3. read lines until one classifies as a reply [`Frame`], waiting at most
//!    the response timeout (5 s by default) for each read,
//! 4. decode the reply according to the verb that was sent, pulling extra
//!    frames for list replies.
//!
//! The protocol has no request identifiers, so a session never pipelines:
//! every call blocks until its reply has been fully consumed. Callers that
//! share a session between threads must serialise access themselves, e.g.
//! with `Arc<Mutex<_>>` as [`StatusPoller`](crate::StatusPoller) does.
//!
//! # Transport
//!
//! Any [`Transport`] works; [`TcpStream`] is the production one. The session
//! does not dial on its own behalf except through the [`Session::connect`]
//! convenience constructor.
//!
//! # Example
//!
//! ```no_run
//! use atmd_client::{Response, Session};
//!
//! let mut session = Session::connect("192.168.1.20:2606")?;
//!
//! session.send_command("SET TT 10s")?;
//! if let Response::Status(status) = session.send_command("MSR STATUS")? {
//!     println!("Board is {status}");
//! }
//!
//! let stream = session.close();
//! drop(stream);
//! # Ok::<(), atmd_client::AtmdError>(())
//! ```

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{AtmdError, AtmdResult};
use crate::protocol::{decode_response, Command, Frame, FrameBuffer, FrameSource, Response, READ_CHUNK};

/// Default TCP port of the ATMD server.
pub const DEFAULT_PORT: u16 = 2606;

/// Default wait for each read while a reply is pending.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of entries kept in the [`CommandLog`].
const LOG_CAPACITY: usize = 1000;

/// Byte stream a [`Session`] can run over.
pub trait Transport: Read + Write {
    /// Bound how long a single read may block waiting for data.
    ///
    /// A read that waits longer must fail with [`ErrorKind::TimedOut`] or
    /// [`ErrorKind::WouldBlock`].
    fn set_wait_timeout(&mut self, timeout: Duration) -> std::io::Result<()>;
}

impl Transport for TcpStream {
    fn set_wait_timeout(&mut self, timeout: Duration) -> std::io::Result<()> {
        self.set_read_timeout(Some(timeout))?;
        self.set_write_timeout(Some(timeout))
    }
}

/// Human-readable log of commands and replies.
///
/// Entries look like `S: SET TT 10s` and `R: ACK`. Silent calls (status
/// polls) are never logged.
#[derive(Debug, Default)]
pub struct CommandLog {
    entries: VecDeque<String>,
}

impl CommandLog {
    fn push(&mut self, entry: String) {
        info!("{}", entry);
        if self.entries.len() == LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn sent(&mut self, command: &Command) {
        self.push(format!("S: {command}"));
    }

    pub fn received(&mut self, frame: &Frame) {
        self.push(format!("R: {frame}"));
    }

    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove and return all entries, oldest first.
    pub fn drain(&mut self) -> Vec<String> {
        self.entries.drain(..).collect()
    }
}

/// One connection to an ATMD server.
pub struct Session<T: Transport = TcpStream> {
    transport: T,
    buffer: FrameBuffer,
    timeout: Duration,
    connected: bool,
    log: CommandLog,
}

impl Session<TcpStream> {
    /// Connect to an ATMD server.
    ///
    /// # Errors
    ///
    /// Returns [`AtmdError::ConnectionFailed`] if the TCP connection cannot be
    /// established.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> AtmdResult<Self> {
        let stream = TcpStream::connect(addr)
            .map_err(|e| AtmdError::ConnectionFailed(format!("Failed to connect: {e}")))?;
        stream.set_nodelay(true)?;

        info!("Connected to ATMD server at {:?}", stream.peer_addr().ok());
        Self::new(stream)
    }

    /// Connect to an ATMD server on the default port (2606).
    pub fn connect_default_port(host: &str) -> AtmdResult<Self> {
        Self::connect(format!("{host}:{DEFAULT_PORT}"))
    }
}

impl<T: Transport> Session<T> {
    /// Wrap an already connected transport.
    pub fn new(mut transport: T) -> AtmdResult<Self> {
        transport.set_wait_timeout(DEFAULT_TIMEOUT)?;
        Ok(Self {
            transport,
            buffer: FrameBuffer::new(),
            timeout: DEFAULT_TIMEOUT,
            connected: true,
            log: CommandLog::default(),
        })
    }

    /// Change the per-read wait budget (5 s by default).
    pub fn set_timeout(&mut self, timeout: Duration) -> AtmdResult<()> {
        self.transport.set_wait_timeout(timeout)?;
        self.timeout = timeout;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// False once a transport failure has invalidated the connection.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn log(&self) -> &CommandLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut CommandLog {
        &mut self.log
    }

    /// Bytes received but not yet consumed as frames.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Parse, send and decode a command, recording it in the command log.
    ///
    /// # Errors
    ///
    /// - [`AtmdError::InvalidCommand`] if the verb is unknown (nothing is sent)
    /// - [`AtmdError::Timeout`] if the server does not answer in time
    /// - [`AtmdError::DeviceRejected`] if the server answers `ERR`
    /// - [`AtmdError::UnexpectedResponse`] / [`AtmdError::MalformedResponse`]
    ///   if the reply does not fit the command
    /// - [`AtmdError::Network`] on socket failure
    pub fn send_command(&mut self, command: &str) -> AtmdResult<Response> {
        let command: Command = command.parse()?;
        self.execute(&command, false)
    }

    /// Like [`send_command`](Self::send_command) but without logging, for
    /// background polling.
    pub fn send_command_silent(&mut self, command: &str) -> AtmdResult<Response> {
        let command: Command = command.parse()?;
        self.execute(&command, true)
    }

    /// Send a prepared command and decode its reply.
    pub fn execute(&mut self, command: &Command, silent: bool) -> AtmdResult<Response> {
        self.send(command)?;
        if !silent {
            self.log.sent(command);
        }

        let frame = self.read_frame()?;
        if !silent {
            self.log.received(&frame);
        }

        decode_response(command, frame, self)
    }

    /// Write a command without waiting for the reply.
    pub fn send(&mut self, command: &Command) -> AtmdResult<()> {
        if !self.connected {
            return Err(AtmdError::NotConnected);
        }

        debug!("ATMD send: {}", command);
        let bytes = command.encode();
        if let Err(e) = self
            .transport
            .write_all(&bytes)
            .and_then(|_| self.transport.flush())
        {
            self.connected = false;
            return Err(e.into());
        }
        Ok(())
    }

    /// Read the next classified frame, dropping unrecognised lines.
    ///
    /// Partial data is kept in the receive buffer when this fails with a
    /// timeout, so the session stays usable.
    pub fn read_frame(&mut self) -> AtmdResult<Frame> {
        if !self.connected {
            return Err(AtmdError::NotConnected);
        }

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.buffer.next_frame() {
                return Ok(frame);
            }

            match self.transport.read(&mut chunk) {
                Ok(0) => {
                    self.connected = false;
                    return Err(AtmdError::Network(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "connection closed by server",
                    )));
                }
                Ok(n) => self.buffer.extend(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    return Err(AtmdError::Timeout);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.connected = false;
                    return Err(e.into());
                }
            }
        }
    }

    /// Close the session and hand the transport back to the caller.
    ///
    /// The receive buffer is discarded; closing the transport itself is left
    /// to the caller (dropping a [`TcpStream`] closes it).
    pub fn close(mut self) -> T {
        if !self.buffer.is_empty() {
            debug!("Discarding {} unread bytes", self.buffer.len());
        }
        self.buffer.clear();
        info!("ATMD session closed");
        self.transport
    }
}

impl<T: Transport> FrameSource for Session<T> {
    fn next_frame(&mut self) -> AtmdResult<Frame> {
        self.read_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedTransport;
    use crate::protocol::{Agent, MeasurementEntry};

    fn session(replies: &[&[u8]]) -> Session<ScriptedTransport> {
        Session::new(ScriptedTransport::with_replies(replies)).unwrap()
    }

    #[test]
    fn test_set_ack() {
        let mut s = session(&[b"ACK\r\n"]);
        assert_eq!(s.send_command("SET TT 10s").unwrap(), Response::Ack);

        let transport = s.close();
        assert_eq!(transport.written(), b"SET TT 10s\n");
    }

    #[test]
    fn test_set_err_is_device_rejected() {
        let mut s = session(&[b"ERR BAD_PARAM\r\n"]);
        match s.send_command("SET TT 10s").unwrap_err() {
            AtmdError::DeviceRejected { reason, .. } => assert_eq!(reason, "BAD_PARAM"),
            e => panic!("unexpected error {e:?}"),
        }
        assert!(s.is_connected());
    }

    #[test]
    fn test_invalid_verb_never_writes() {
        let mut s = session(&[b"ACK\r\n"]);
        let err = s.send_command("FOO BAR").unwrap_err();
        assert!(matches!(err, AtmdError::InvalidCommand(_)));
        assert!(s.log().is_empty());
        assert!(s.close().written().is_empty());
    }

    #[test]
    fn test_agents_list_across_chunks() {
        let mut s = session(&[
            b"VAL AGENTS 2\r\nVAL AGENT 1 AA:BB:CC",
            b":DD:EE:FF\r\nVAL AGENT 2 11:22:33:44:55:66\r\n",
        ]);
        let r = s.send_command("GET AGENTS").unwrap();
        assert_eq!(
            r,
            Response::Agents(vec![
                Agent {
                    id: 1,
                    mac: "AA:BB:CC:DD:EE:FF".into()
                },
                Agent {
                    id: 2,
                    mac: "11:22:33:44:55:66".into()
                },
            ])
        );
        assert_eq!(s.buffered(), 0);
    }

    #[test]
    fn test_measurement_list() {
        let mut s = session(&[b"MSR LST NUM 2\r\nMSR LST 5 3\r\nMSR LST 7 1\r\n"]);
        let r = s.send_command("MSR LST").unwrap();
        assert_eq!(
            r,
            Response::Measurements(vec![
                MeasurementEntry { id: 5, starts: 3 },
                MeasurementEntry { id: 7, starts: 1 },
            ])
        );
    }

    #[test]
    fn test_noise_and_empty_lines_skipped() {
        let mut s = session(&[b"\r\nbanner text\r\n\r\nMSR STATUS IDLE\r\n"]);
        let r = s.send_command_silent("MSR STATUS").unwrap();
        assert_eq!(r, Response::Status("IDLE".into()));
    }

    #[test]
    fn test_timeout_keeps_session_usable() {
        let mut s = session(&[b"ACK\r\nVAL TT 1"]);
        assert_eq!(s.send_command("SET TT 1s").unwrap(), Response::Ack);

        // Reply is incomplete and the script runs dry.
        let err = s.send_command("GET TT").unwrap_err();
        assert!(matches!(err, AtmdError::Timeout));
        assert!(s.is_connected());
        assert_eq!(s.buffered(), "VAL TT 1".len());
    }

    #[test]
    fn test_peer_close_invalidates_connection() {
        let mut s = Session::new(ScriptedTransport::with_replies(&[]).closing()).unwrap();
        let err = s.send_command("MSR STATUS").unwrap_err();
        assert!(matches!(err, AtmdError::Network(_)));
        assert!(!s.is_connected());

        let err = s.send_command("MSR STATUS").unwrap_err();
        assert!(matches!(err, AtmdError::NotConnected));
    }

    #[test]
    fn test_write_failure_invalidates_connection() {
        let mut s = Session::new(ScriptedTransport::with_replies(&[]).failing_writes()).unwrap();
        let err = s.send_command("MSR STATUS").unwrap_err();
        assert!(matches!(err, AtmdError::Network(_)));
        assert!(err.invalidates_connection());
        assert!(!s.is_connected());
        assert!(s.log().is_empty());

        let err = s.send_command("MSR STATUS").unwrap_err();
        assert!(matches!(err, AtmdError::NotConnected));
    }

    #[test]
    fn test_late_reply_completes_buffered_frame() {
        let mut s = session(&[b"VAL TT 1"]);
        let err = s.send_command("GET TT").unwrap_err();
        assert!(matches!(err, AtmdError::Timeout));

        // The rest of the reply arrives after the deadline.
        s.transport_mut().push_reply(b"s\r\nACK\r\n");
        let late = s.read_frame().unwrap();
        assert_eq!(late.to_string(), "VAL TT 1s");
        assert_eq!(s.buffered(), "ACK\r\n".len());
        assert_eq!(s.send_command("SET TT 2s").unwrap(), Response::Ack);
        assert_eq!(s.buffered(), 0);
    }

    #[test]
    fn test_command_log_respects_silent() {
        let mut s = session(&[b"MSR STATUS RUNNING\r\n", b"ACK\r\n"]);
        s.send_command_silent("MSR STATUS").unwrap();
        assert!(s.log().is_empty());

        s.send_command("MSR STOP").unwrap();
        let entries: Vec<_> = s.log().entries().collect();
        assert_eq!(entries, vec!["S: MSR STOP", "R: ACK"]);
    }

    #[test]
    fn test_ext_consumes_one_frame() {
        let mut s = session(&[b"ACK\r\nMSR STATUS IDLE\r\n"]);
        assert_eq!(s.send_command("EXT PING").unwrap(), Response::Empty);
        assert_eq!(
            s.send_command("MSR STATUS").unwrap(),
            Response::Status("IDLE".into())
        );
    }
}
