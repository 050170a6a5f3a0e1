//! Error taxonomy for ATMD sessions.
//!
//! Every failure a [`Session`](crate::Session) can report is an [`AtmdError`].
//! Only transport failures ([`AtmdError::Network`], [`AtmdError::NotConnected`])
//! leave the connection unusable; every other variant fails the single
//! in-flight request and the session can carry on with the next command.

use thiserror::Error;

/// Errors that can occur while talking to an ATMD server.
#[derive(Error, Debug)]
pub enum AtmdError {
    /// Command verb is not one of `SET`, `GET`, `MSR`, `EXT`, or an argument
    /// failed local validation. Nothing was sent.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Socket read/write failure. The connection should be considered dead.
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// Failed to establish the TCP connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The session was already closed, or the peer closed the connection.
    #[error("Not connected")]
    NotConnected,

    /// No complete frame arrived within the wait budget.
    #[error("Timeout waiting for response")]
    Timeout,

    /// The server answered with an `ERR` frame.
    ///
    /// The reason is the server's own text, usually `<code>:<NAME>` such as
    /// `3:BAD_PARAMETER` or `6:MEAS_RUNNING`.
    #[error("Command '{command}' rejected by device: {reason}")]
    DeviceRejected {
        /// Command text that was sent
        command: String,
        /// Reason text supplied by the device
        reason: String,
    },

    /// Reply tag does not fit the verb that was sent.
    #[error("Command '{command}' returned an unexpected response '{response}'")]
    UnexpectedResponse {
        /// Command text that was sent
        command: String,
        /// Raw classified reply (`<TAG> <payload>`)
        response: String,
    },

    /// Reply tag and key were recognised but the payload does not follow
    /// its grammar.
    #[error("Command '{command}' returned a malformed response '{response}'")]
    MalformedResponse {
        /// Command text that was sent
        command: String,
        /// Raw classified reply (`<TAG> <payload>`)
        response: String,
    },
}

impl AtmdError {
    /// Whether the session must be reconnected after this error.
    pub fn invalidates_connection(&self) -> bool {
        matches!(self, AtmdError::Network(_) | AtmdError::NotConnected)
    }
}

/// Result type for ATMD operations.
pub type AtmdResult<T> = Result<T, AtmdError>;
