//! Incoming frames.
//!
//! The server terminates every line with CR+LF. A line whose first three
//! characters are one of the reply tags (`ACK`, `VAL`, `MSR`, `ERR`) is a
//! [`Frame`]; anything else is noise and is dropped by the reader.
//!
//! [`FrameBuffer`] holds bytes received so far and hands out complete lines.
//! Partial data stays buffered across reads and across requests.

use std::fmt;
use std::str::FromStr;

use tracing::{trace, warn};

/// Line terminator used by the server.
pub const TERMINATOR: &[u8] = b"\r\n";

/// Maximum number of bytes pulled from the socket per read.
pub const READ_CHUNK: usize = 4096;

/// Reply category sent by the server.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumIter,
    strum::EnumString,
    strum::IntoStaticStr,
)]
pub enum Tag {
    /// Command accepted
    #[strum(serialize = "ACK")]
    Ack,
    /// Configuration value (reply to `GET`)
    #[strum(serialize = "VAL")]
    Val,
    /// Measurement data (reply to `MSR`)
    #[strum(serialize = "MSR")]
    Msr,
    /// Command rejected
    #[strum(serialize = "ERR")]
    Err,
}

/// A classified reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: Tag,
    pub payload: String,
}

impl Frame {
    /// Classify a raw line by its leading tag.
    ///
    /// Returns `None` for lines that do not start with a recognised tag. The
    /// payload is everything after the single separator following the tag.
    pub fn classify(line: &str) -> Option<Self> {
        let tag = Tag::from_str(line.get(..3)?).ok()?;
        let payload = line.get(4..).unwrap_or("").to_string();
        Some(Self { tag, payload })
    }

    /// First whitespace-delimited word of the payload (`TT`, `AGENTS`, `LST`...).
    pub fn key(&self) -> &str {
        self.payload.split(' ').next().unwrap_or("")
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{}", self.tag)
        } else {
            write!(f, "{} {}", self.tag, self.payload)
        }
    }
}

/// Receive buffer splitting a byte stream into CR+LF terminated lines.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    bytes: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet consumed.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    /// Pop the next complete, non-empty line.
    ///
    /// Empty lines (a terminator at offset zero) are skipped. Returns `None`
    /// when no complete line is buffered; the partial tail is kept.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let pos = self
                .bytes
                .windows(TERMINATOR.len())
                .position(|w| w == TERMINATOR)?;

            let line: Vec<u8> = self.bytes.drain(..pos + TERMINATOR.len()).take(pos).collect();
            if line.is_empty() {
                continue;
            }

            // The server speaks ASCII; map bytes as Latin-1 so stray high bytes
            // never fail decoding.
            let line: String = line.iter().map(|&b| b as char).collect();
            trace!("ATMD recv: {:?}", line);
            return Some(line);
        }
    }

    /// Pop the next line that classifies as a [`Frame`], dropping noise.
    pub fn next_frame(&mut self) -> Option<Frame> {
        while let Some(line) = self.next_line() {
            match Frame::classify(&line) {
                Some(frame) => return Some(frame),
                None => warn!("Dropping unrecognized line: {:?}", line),
            }
        }
        None
    }
}
