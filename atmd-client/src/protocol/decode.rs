//! Typed decoding of server replies.
//!
//! A reply is interpreted according to the verb of the command that caused
//! it. Some replies announce a count and are followed by that many extra
//! frames (agent lists, measurement lists, per-start statistics); the
//! decoders pull those frames through a [`FrameSource`].
//!
//! Inside list expansions a malformed entry never fails the whole call:
//! agent lines that do not parse are omitted (and logged), measurement and
//! statistics lines that do not parse are replaced by zero placeholders.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::command::{Command, Verb};
use super::frame::{Frame, Tag};
use super::timestring::TimeString;
use crate::error::{AtmdError, AtmdResult};

/// Number of integers in a `MSR STAT` line.
pub const STAT_FIELDS: usize = 10;

/// Upper bound on pre-allocation for device-reported list lengths.
const MAX_PREALLOC: usize = 1024;

static TIME_VALUE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(TT|ST|TD) (\d+\.?\d*[umsMh])").expect("valid time value regex")
});
static PREFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^PREFIX ([a-zA-Z0-9._\-/]+)").expect("valid prefix regex"));
static AUTOSAVE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^AUTOSAVE (\d+)").expect("valid autosave regex"));
static MONITOR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^MONITOR (\d+) (\d+)\s*([a-zA-Z0-9._\-/]*)").expect("valid monitor regex")
});
static AGENTS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^AGENTS (\d+)").expect("valid agents regex"));
static AGENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^AGENT (\d+) (\w+:\w+:\w+:\w+:\w+:\w+)").expect("valid agent regex")
});
static LST_NUM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^LST NUM (\d+)").expect("valid list count regex"));
static LST_ENTRY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^LST (\d+) (\d+)").expect("valid list entry regex"));
static STAT_NUM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^STAT NUM (\d+)").expect("valid stat count regex"));
static STAT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^STAT (\d+) (\d+) (\d+) (\d+) (\d+) (\d+) (\d+) (\d+) (\d+) (\d+)")
        .expect("valid stat regex")
});

/// Supplier of follow-up frames for list expansion.
pub trait FrameSource {
    /// Block until the next classified frame arrives.
    fn next_frame(&mut self) -> AtmdResult<Frame>;
}

/// Timing settings readable with `GET`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
    strum::EnumString,
    strum::IntoStaticStr,
)]
pub enum TimingKey {
    /// `TT`: total measurement time
    #[strum(serialize = "TT")]
    TotalTime,
    /// `ST`: start window time
    #[strum(serialize = "ST")]
    WindowTime,
    /// `TD`: deadtime between windows
    #[strum(serialize = "TD")]
    Deadtime,
}

impl TimingKey {
    /// Key spelling on the wire.
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// A network agent known to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: u32,
    /// Hardware address, e.g. `AA:BB:CC:DD:EE:FF`
    pub mac: String,
}

/// One stored measurement on the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementEntry {
    pub id: u32,
    /// Number of starts recorded
    pub starts: u32,
}

/// Statistics line of a measurement, passed through verbatim.
///
/// For cumulative queries the server sends the number of starts, the mean
/// window time and the stop counts of channels 1 to 8.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementStats(pub [u64; STAT_FIELDS]);

impl MeasurementStats {
    pub fn fields(&self) -> &[u64; STAT_FIELDS] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&v| v == 0)
    }
}

/// Live monitor configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Save the monitor file every `save` starts
    pub save: u32,
    /// Number of starts kept in the monitor file
    pub count: u32,
    /// Monitor file name (may be empty)
    pub filename: String,
}

/// Decoded reply to a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// `ACK`
    Ack,
    /// `VAL TT|ST|TD <time>`
    Timing { key: TimingKey, value: TimeString },
    /// `VAL PREFIX <prefix>`; `NONE` decodes to an empty string
    Prefix(String),
    /// `VAL AUTOSAVE <count>`
    Autosave(u32),
    /// `VAL MONITOR <save> <count> [file]`
    Monitor(MonitorConfig),
    /// `VAL AGENTS <n>` followed by `n` agent lines
    Agents(Vec<Agent>),
    /// `MSR STATUS <text>`
    Status(String),
    /// `MSR LST NUM <n>` followed by `n` measurement lines
    Measurements(Vec<MeasurementEntry>),
    /// `MSR STAT <10 integers>`
    Statistics(MeasurementStats),
    /// `MSR STAT NUM <n>` followed by `n` statistics lines
    StatisticsList(Vec<MeasurementStats>),
    /// Reply accepted but carries nothing the client interprets
    Empty,
}

/// Interpret `frame`, the first reply to `command`.
pub fn decode_response<S: FrameSource + ?Sized>(
    command: &Command,
    frame: Frame,
    source: &mut S,
) -> AtmdResult<Response> {
    match command.verb() {
        Verb::Set => decode_ack(command, &frame),
        Verb::Get => match frame.tag {
            Tag::Val => decode_value(command, &frame, source),
            Tag::Err => decode_ack(command, &frame),
            _ => Err(unexpected(command, &frame)),
        },
        Verb::Msr => match frame.tag {
            Tag::Msr => decode_measurement(command, &frame, source),
            _ => decode_ack(command, &frame),
        },
        Verb::Ext => Ok(Response::Empty),
    }
}

fn unexpected(command: &Command, frame: &Frame) -> AtmdError {
    AtmdError::UnexpectedResponse {
        command: command.to_string(),
        response: frame.to_string(),
    }
}

fn malformed(command: &Command, frame: &Frame) -> AtmdError {
    AtmdError::MalformedResponse {
        command: command.to_string(),
        response: frame.to_string(),
    }
}

/// `ACK` succeeds, `ERR` is a rejection, anything else is unexpected.
fn decode_ack(command: &Command, frame: &Frame) -> AtmdResult<Response> {
    match frame.tag {
        Tag::Ack => Ok(Response::Ack),
        Tag::Err => Err(AtmdError::DeviceRejected {
            command: command.to_string(),
            reason: frame.payload.clone(),
        }),
        _ => Err(unexpected(command, frame)),
    }
}

fn decode_value<S: FrameSource + ?Sized>(
    command: &Command,
    frame: &Frame,
    source: &mut S,
) -> AtmdResult<Response> {
    let payload = frame.payload.as_str();
    match frame.key() {
        "TT" | "ST" | "TD" => {
            let caps = TIME_VALUE_RE
                .captures(payload)
                .ok_or_else(|| malformed(command, frame))?;
            let key: TimingKey = caps[1].parse().map_err(|_| malformed(command, frame))?;
            let value = caps[2].parse().map_err(|_| malformed(command, frame))?;
            Ok(Response::Timing { key, value })
        }
        "PREFIX" => {
            let caps = PREFIX_RE
                .captures(payload)
                .ok_or_else(|| malformed(command, frame))?;
            let prefix = match &caps[1] {
                "NONE" => String::new(),
                p => p.to_string(),
            };
            Ok(Response::Prefix(prefix))
        }
        "AUTOSAVE" => {
            let caps = AUTOSAVE_RE
                .captures(payload)
                .ok_or_else(|| malformed(command, frame))?;
            let count = caps[1].parse().map_err(|_| malformed(command, frame))?;
            Ok(Response::Autosave(count))
        }
        "MONITOR" => {
            let caps = MONITOR_RE
                .captures(payload)
                .ok_or_else(|| malformed(command, frame))?;
            Ok(Response::Monitor(MonitorConfig {
                save: caps[1].parse().map_err(|_| malformed(command, frame))?,
                count: caps[2].parse().map_err(|_| malformed(command, frame))?,
                filename: caps[3].to_string(),
            }))
        }
        "AGENTS" => {
            let caps = AGENTS_RE
                .captures(payload)
                .ok_or_else(|| malformed(command, frame))?;
            let count: usize = caps[1].parse().map_err(|_| malformed(command, frame))?;
            expand_agents(count, source).map(Response::Agents)
        }
        // Recognised keys the client does not decode.
        "CHS" | "CH" | "RS" | "OF" | "HOST" | "USER" | "PSW" | "FORMAT" => Ok(Response::Empty),
        _ => Ok(Response::Empty),
    }
}

fn expand_agents<S: FrameSource + ?Sized>(count: usize, source: &mut S) -> AtmdResult<Vec<Agent>> {
    let mut agents = Vec::with_capacity(count.min(MAX_PREALLOC));
    for _ in 0..count {
        let frame = source.next_frame()?;
        let parsed = (frame.tag == Tag::Val)
            .then(|| AGENT_RE.captures(&frame.payload))
            .flatten()
            .and_then(|caps| {
                Some(Agent {
                    id: caps[1].parse().ok()?,
                    mac: caps[2].to_string(),
                })
            });
        match parsed {
            Some(agent) => agents.push(agent),
            None => warn!("Got malformed agent information: {}", frame),
        }
    }
    Ok(agents)
}

fn decode_measurement<S: FrameSource + ?Sized>(
    command: &Command,
    frame: &Frame,
    source: &mut S,
) -> AtmdResult<Response> {
    let payload = frame.payload.as_str();
    match frame.key() {
        "STATUS" => {
            let status = payload.get("STATUS ".len()..).unwrap_or("").to_string();
            Ok(Response::Status(status))
        }
        "LST" => {
            let Some(caps) = LST_NUM_RE.captures(payload) else {
                warn!("Measurement list without count: {}", frame);
                return Ok(Response::Measurements(Vec::new()));
            };
            let count: usize = caps[1].parse().map_err(|_| malformed(command, frame))?;
            expand_measurements(count, source).map(Response::Measurements)
        }
        "STAT" => {
            if let Some(caps) = STAT_NUM_RE.captures(payload) {
                let count: usize = caps[1].parse().map_err(|_| malformed(command, frame))?;
                let mut stats = Vec::with_capacity(count.min(MAX_PREALLOC));
                for _ in 0..count {
                    stats.push(parse_stats(&source.next_frame()?));
                }
                return Ok(Response::StatisticsList(stats));
            }
            Ok(Response::Statistics(parse_stats(frame)))
        }
        _ => Ok(Response::Empty),
    }
}

fn expand_measurements<S: FrameSource + ?Sized>(
    count: usize,
    source: &mut S,
) -> AtmdResult<Vec<MeasurementEntry>> {
    let mut entries = Vec::with_capacity(count.min(MAX_PREALLOC));
    for _ in 0..count {
        let frame = source.next_frame()?;
        let entry = LST_ENTRY_RE.captures(&frame.payload).and_then(|caps| {
            Some(MeasurementEntry {
                id: caps[1].parse().ok()?,
                starts: caps[2].parse().ok()?,
            })
        });
        entries.push(entry.unwrap_or_else(|| {
            warn!("Malformed measurement entry, using placeholder: {}", frame);
            MeasurementEntry::default()
        }));
    }
    Ok(entries)
}

/// Parse a `STAT` line; anything that does not match yields all zeros.
fn parse_stats(frame: &Frame) -> MeasurementStats {
    let Some(caps) = STAT_RE.captures(&frame.payload) else {
        warn!("Malformed statistics, using zeros: {}", frame);
        return MeasurementStats::default();
    };
    let mut fields = [0u64; STAT_FIELDS];
    for (i, field) in fields.iter_mut().enumerate() {
        match caps[i + 1].parse() {
            Ok(v) => *field = v,
            Err(_) => return MeasurementStats::default(),
        }
    }
    MeasurementStats(fields)
}
