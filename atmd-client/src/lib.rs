//! Control client for ATMD time-correlated measurement boards.
//!
//! An ATMD server exposes its acquisition board over a line-oriented TCP
//! protocol (port 2606). This crate provides:
//!
//! - [`protocol`] - command encoding, reply framing and typed decoding
//! - [`Session`] - one connection and its strict request/response exchange
//! - [`AtmdClient`] - typed accessors for settings and stored measurements
//! - [`MeasurementTracker`] - IDLE/RUNNING state with a local countdown
//! - [`StatusPoller`] - background status polling
//! - [`DeviceConfig`] / [`ClientSettings`] - acquisition and connection settings
//! - [`mock`] - scripted transport and a fake server for tests
//!
//! # Binaries
//!
//! - `atmd_tool` - command line and interactive front-end
//! - `mock_atmd` - stand-alone fake server

pub mod client;
pub mod config;
pub mod deadtime;
pub mod error;
pub mod measurement;
pub mod mock;
pub mod poller;
pub mod protocol;
pub mod session;
pub mod settings;

pub use client::AtmdClient;
pub use config::DeviceConfig;
pub use error::{AtmdError, AtmdResult};
pub use measurement::{Countdown, MeasurementPhase, MeasurementTracker, StatusUpdate};
pub use poller::{PollEvent, StatusPoller};
pub use protocol::{
    Agent, Command, MeasurementEntry, MeasurementStats, MonitorConfig, Response, TimeString,
    TimingKey,
};
pub use session::{CommandLog, Session, Transport, DEFAULT_PORT, DEFAULT_TIMEOUT};
pub use settings::ClientSettings;
