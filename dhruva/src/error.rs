use std::fmt;
use std::str::Utf8Error;

use thiserror::Error;

use crate::session::SessionState;

pub type Result<T> = std::result::Result<T, Error>;

/// Malformed wire data.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ParseError {
    /// What is wrong.
    pub message: String,
    /// Offset of the offending bytes in the caller buffer.
    pub offset: usize,
    /// Length of the offending bytes.
    pub len: usize,
}

impl ParseError {
    pub fn new<T>(message: T, offset: usize, len: usize) -> Self
    where
        T: AsRef<str>,
    {
        Self {
            message: message.as_ref().to_string(),
            offset,
            len,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (offset {}, length {})", self.message, self.offset, self.len)
    }
}

impl std::error::Error for ParseError {}

impl From<util::Error> for ParseError {
    fn from(err: util::Error) -> Self {
        ParseError {
            message: format!(
                "Failed to parse at line:{} column:{} kind:{:?}",
                err.line, err.col, err.kind,
            ),
            offset: err.offset,
            len: 1,
        }
    }
}

/// An error raised by a parser listener callback.
///
/// The original cause is kept as the error source.
#[derive(Debug, Error)]
#[error("parser listener failed: {0}")]
pub struct ListenerError(#[source] pub Box<dyn std::error::Error + Send + Sync>);

impl ListenerError {
    pub fn new<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self(err.into())
    }
}

/// Connection level errors of the stream frame decoder.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("frame exceeds {max} bytes (unread {unread}, consumed {consumed})")]
    Oversize {
        unread: usize,
        consumed: usize,
        max: usize,
        /// The first bytes of the buffer, for postmortem.
        snapshot: String,
    },

    #[error("Content-Length not found")]
    MissingContentLength,

    #[error("invalid Content-Length value '{0}'")]
    InvalidContentLength(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The resolver found no usable hop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("no route to '{name}': {reason}")]
pub struct ResolutionFailure {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SessionStateError {
    #[error("illegal session transition {from:?} -> {to:?}")]
    IllegalTransition { from: SessionState, to: SessionState },

    #[error("SIP session is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    ParserListener(#[from] ListenerError),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Resolution(#[from] ResolutionFailure),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    SessionState(#[from] SessionStateError),

    #[error("no route for '{0}'")]
    Routing(String),

    #[error("controller object for this message is null")]
    ControllerMissing,

    #[error("Missing required '{0}' header")]
    MissingRequiredHeader(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Poisoned lock")]
    PoisonedLock,

    #[error("Fmt Error")]
    FmtError(#[from] fmt::Error),
}

impl From<util::Error> for Error {
    fn from(err: util::Error) -> Self {
        Self::Parse(err.into())
    }
}

impl From<Utf8Error> for Error {
    fn from(err: Utf8Error) -> Self {
        Self::Parse(ParseError::new("invalid UTF-8", err.valid_up_to(), 1))
    }
}

impl From<tokio::sync::mpsc::error::SendError<crate::transport::TransportEvent>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<crate::transport::TransportEvent>) -> Self {
        Self::ChannelClosed
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Self::Tls(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<regex::Error> for Error {
    fn from(err: regex::Error) -> Self {
        Self::Config(err.to_string())
    }
}
