//! ATMD line protocol (version 2.0).
//!
//! # Protocol Overview
//!
//! The client sends one command line at a time and waits for its reply:
//!
//! ```text
//! client: SET TT 10s\n
//! server: ACK\r\n
//! client: GET AGENTS\n
//! server: VAL AGENTS 2\r\n
//! server: VAL AGENT 1 AA:BB:CC:DD:EE:FF\r\n
//! server: VAL AGENT 2 11:22:33:44:55:66\r\n
//! ```
//!
//! Commands start with a verb (`SET`, `GET`, `MSR`, `EXT`) and end with LF.
//! Replies start with a tag (`ACK`, `VAL`, `MSR`, `ERR`) and end with CR+LF.
//! There are no request identifiers, so replies are matched to requests purely
//! by order and only one request may be outstanding per connection.

pub mod command;
pub mod decode;
pub mod frame;
pub mod timestring;

pub use command::{Command, Verb};
pub use decode::{
    decode_response, Agent, FrameSource, MeasurementEntry, MeasurementStats, MonitorConfig,
    Response, TimingKey, STAT_FIELDS,
};
pub use frame::{Frame, FrameBuffer, Tag, READ_CHUNK, TERMINATOR};
pub use timestring::{TimeString, TimeUnit};
