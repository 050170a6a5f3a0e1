//! Outgoing commands.
//!
//! A command line is `<VERB> <argument...>` terminated by a single LF.
//! The verb selects how the reply is interpreted (see [`crate::Session`]).

use std::fmt;
use std::str::FromStr;

use crate::error::{AtmdError, AtmdResult};

/// Command category sent by the client.
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
pub enum Verb {
    /// Write a configuration value. Answered by `ACK` or `ERR`.
    #[strum(serialize = "SET")]
    Set,
    /// Read a configuration value. Answered by `VAL <key> ...`.
    #[strum(serialize = "GET")]
    Get,
    /// Measurement control and queries.
    #[strum(serialize = "MSR")]
    Msr,
    /// Extension commands. Replies are not interpreted.
    #[strum(serialize = "EXT")]
    Ext,
}

/// A validated outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    verb: Verb,
    argument: String,
}

impl Command {
    /// Build a command from a verb and argument text.
    ///
    /// Fails with [`AtmdError::InvalidCommand`] if the argument contains a
    /// line break, which would split the request into two lines.
    pub fn new(verb: Verb, argument: impl Into<String>) -> AtmdResult<Self> {
        let argument = argument.into().trim().to_string();
        if argument.contains(['\n', '\r']) {
            return Err(AtmdError::InvalidCommand(format!(
                "{verb} {argument:?}: argument contains a line break"
            )));
        }
        Ok(Self { verb, argument })
    }

    pub fn set(argument: impl Into<String>) -> AtmdResult<Self> {
        Self::new(Verb::Set, argument)
    }

    pub fn get(argument: impl Into<String>) -> AtmdResult<Self> {
        Self::new(Verb::Get, argument)
    }

    pub fn msr(argument: impl Into<String>) -> AtmdResult<Self> {
        Self::new(Verb::Msr, argument)
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn argument(&self) -> &str {
        &self.argument
    }

    /// Encode to wire bytes, including the LF terminator.
    pub fn encode(&self) -> Vec<u8> {
        let mut line = self.to_string();
        line.push('\n');
        line.into_bytes()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.argument.is_empty() {
            write!(f, "{}", self.verb)
        } else {
            write!(f, "{} {}", self.verb, self.argument)
        }
    }
}

impl FromStr for Command {
    type Err = AtmdError;

    /// Parse a free-form command line such as `SET TT 10s`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim_end_matches(['\r', '\n']).trim();
        let (verb, argument) = line.split_once(' ').unwrap_or((line, ""));
        let verb = Verb::from_str(verb)
            .map_err(|_| AtmdError::InvalidCommand(format!("unknown command verb in '{line}'")))?;
        Self::new(verb, argument)
    }
}
