//! Owner-facing commands and their dispatch onto a session.
//!
//! Commands are addressed by name, optionally namespaced as
//! `labterm:<name>`, so they can come from a keymap, a REPL, or a script.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::debug;

use crate::session::Session;
use crate::transport::Transport;

/// Namespace accepted in front of command names.
pub const COMMAND_PREFIX: &str = "labterm:";

/// Errors from parsing a command.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("{command} requires an argument: {what}")]
    MissingArgument {
        command: &'static str,
        what: &'static str,
    },

    #[error("{0} takes no arguments")]
    UnexpectedArgument(&'static str),
}

/// A command applied to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Connect and join.
    OpenSession,
    /// Send text to the remote shell as typed.
    SendInput(String),
    /// Join a fresh channel on the same socket.
    ResetSession,
    /// Send empty input, nudging the remote terminal to redraw.
    ClearInput,
    /// Ask the remote shell to open a lab.
    OpenLab(String),
}

impl SessionCommand {
    pub fn name(&self) -> &'static str {
        match self {
            SessionCommand::OpenSession => "open-session",
            SessionCommand::SendInput(_) => "send-input",
            SessionCommand::ResetSession => "reset-session",
            SessionCommand::ClearInput => "clear-input",
            SessionCommand::OpenLab(_) => "open-lab",
        }
    }

    /// Parses `name [argument]`. The argument is the rest of the line,
    /// taken verbatim after one separating space.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim_start();
        let line = line.strip_prefix(COMMAND_PREFIX).unwrap_or(line);
        let (name, arg) = match line.split_once(' ') {
            Some((name, arg)) => (name, Some(arg)),
            None => (line.trim_end(), None),
        };
        let arg = arg.filter(|a| !a.trim().is_empty());

        let no_arg = |command: SessionCommand| match arg {
            Some(_) => Err(CommandError::UnexpectedArgument(command.name())),
            None => Ok(command),
        };

        match name {
            "open-session" | "open" => no_arg(SessionCommand::OpenSession),
            "reset-session" | "reset" => no_arg(SessionCommand::ResetSession),
            "clear-input" | "clear" => no_arg(SessionCommand::ClearInput),
            "send-input" | "send" => arg
                .map(|text| SessionCommand::SendInput(text.to_string()))
                .ok_or(CommandError::MissingArgument {
                    command: "send-input",
                    what: "text",
                }),
            "open-lab" | "lab" => arg
                .map(|slug| SessionCommand::OpenLab(slug.trim().to_string()))
                .ok_or(CommandError::MissingArgument {
                    command: "open-lab",
                    what: "lab slug",
                }),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }

    /// Applies the command to `session`.
    pub fn dispatch<T: Transport + 'static>(&self, session: &Session<T>) {
        debug!(command = self.name(), "Dispatching command");
        match self {
            SessionCommand::OpenSession => session.connect(),
            SessionCommand::SendInput(text) => session.send(text),
            SessionCommand::ResetSession => session.reset(),
            SessionCommand::ClearInput => session.send(""),
            SessionCommand::OpenLab(slug) => session.send(open_lab_input(slug)),
        }
    }
}

impl fmt::Display for SessionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionCommand::SendInput(text) => write!(f, "{} {}", self.name(), text),
            SessionCommand::OpenLab(slug) => write!(f, "{} {}", self.name(), slug),
            _ => f.write_str(self.name()),
        }
    }
}

impl FromStr for SessionCommand {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Shell input that opens a lab in the remote workspace.
pub fn open_lab_input(slug: &str) -> String {
    format!("learn open {}\r", slug)
}
