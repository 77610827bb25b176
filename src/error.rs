//! src/error.rs
//!
//! Defines the library's `Error` enum using `thiserror`. Variants follow the
//! simulator's failure taxonomy: parse and configuration errors abort a run,
//! everything else fails a single instruction.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("fatal: there is no puppet declared as {0}\n# possible fix: add `enter {0}` before other statements")]
    UnknownPuppet(String),

    #[error("no such language implementation passed to simulator on startup ({0})")]
    UnknownImplementation(String),

    #[error("invalid implementation folder {path}: {reason}")]
    InvalidImplementation { path: PathBuf, reason: String },

    #[error("capability key {0} was not a valid base64 sequence")]
    InvalidCaps(String),

    #[error("no fixtures provided, yet tried to load feed from log.offset")]
    MissingFixtures,

    #[error("cannot find id {0} in the fixtures identity map")]
    UnknownFixtureId(String),

    #[error("invalid feed id {0}")]
    InvalidFeedId(String),

    #[error("{0}")]
    Assertion(String),

    #[error("rpc error: {0}")]
    Transport(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("{puppet}: {message}")]
    Process {
        puppet: String,
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("puppet {0} is not running")]
    NotRunning(String),

    #[error("puppet {0} is already running")]
    AlreadyRunning(String),

    #[error("puppet {0} has no known feed id (was it started?)")]
    NoFeedId(String),

    #[error("could not find any connectable ports in the range [{start}, {end}]")]
    PortsExhausted { start: u16, end: u16 },

    #[error("execution cancelled")]
    Cancelled,

    #[error("unknown mode {0:?} (expected run, expectations, generate or follow-graph)")]
    UnknownMode(String),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tokio task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl Error {
    /// Structural errors halt the whole run; the rest fail one instruction.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Parse { .. }
                | Error::UnknownPuppet(_)
                | Error::UnknownImplementation(_)
                | Error::InvalidImplementation { .. }
                | Error::InvalidCaps(_)
                | Error::MissingFixtures
                | Error::UnknownFixtureId(_)
                | Error::PortsExhausted { .. }
                | Error::Config(_)
        )
    }

    pub(crate) fn parse(line: usize, reason: impl Into<String>) -> Self {
        Error::Parse {
            line,
            reason: reason.into(),
        }
    }

    pub(crate) fn transport(e: impl std::fmt::Display) -> Self {
        Error::Transport(e.to_string())
    }
}
