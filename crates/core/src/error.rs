//! Error types for the RTP runtime.

use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Errors returned by the RTP runtime.
///
/// Variants fall into four groups:
///
/// - **Configuration**: [`InvalidValue`](Self::InvalidValue),
///   [`NotSupported`](Self::NotSupported): caller mistakes, no state change.
/// - **Transient I/O**: [`Interrupted`](Self::Interrupted),
///   [`NotReady`](Self::NotReady): retried by the workers, surfaced only
///   from the send path.
/// - **Fatal I/O**: [`Socket`](Self::Socket), [`Bind`](Self::Bind),
///   [`Send`](Self::Send): the stream becomes unusable and later calls
///   return [`Unusable`](Self::Unusable) carrying the same [`ErrorKind`].
/// - **Stream end**: [`Eof`](Self::Eof): pull-mode receive on a closed stream.
///
/// Malformed inbound packets never show up here; the receiver counts and
/// drops them.
#[derive(Debug, thiserror::Error)]
pub enum RtpError {
    #[error("generic error: {0}")]
    Generic(String),

    /// Socket creation, option or receive failure.
    #[error("socket error: {0}")]
    Socket(#[source] io::Error),

    /// Binding the local port failed (usually already in use).
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// The endpoint refused an outbound datagram.
    #[error("send failed: {0}")]
    Send(#[source] io::Error),

    /// A deadline expired or the stream is shutting down.
    #[error("interrupted")]
    Interrupted,

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("not ready")]
    NotReady,

    #[error("end of stream")]
    Eof,

    /// A fatal error happened earlier; the stream refuses further work.
    #[error("stream unusable after earlier {0} failure")]
    Unusable(ErrorKind),
}

impl RtpError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidValue(msg.into())
    }

    /// Flat error code for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Generic(_) => ErrorKind::GenericError,
            Self::Socket(_) => ErrorKind::SocketError,
            Self::Bind { .. } => ErrorKind::BindError,
            Self::InvalidValue(_) => ErrorKind::InvalidValue,
            Self::Send(_) => ErrorKind::SendError,
            Self::Interrupted => ErrorKind::Interrupted,
            Self::NotSupported(_) => ErrorKind::NotSupported,
            Self::NotReady => ErrorKind::NotReady,
            Self::Eof => ErrorKind::Eof,
            Self::Unusable(kind) => *kind,
        }
    }

    /// Whether this error leaves the stream permanently unusable.
    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }
}

/// Flat error code, one per [`RtpError`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    GenericError,
    SocketError,
    BindError,
    InvalidValue,
    SendError,
    Interrupted,
    NotSupported,
    NotReady,
    Eof,
}

impl ErrorKind {
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::SocketError | Self::BindError | Self::SendError)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::GenericError => "generic",
            Self::SocketError => "socket",
            Self::BindError => "bind",
            Self::InvalidValue => "invalid value",
            Self::SendError => "send",
            Self::Interrupted => "interrupted",
            Self::NotSupported => "not supported",
            Self::NotReady => "not ready",
            Self::Eof => "end of stream",
        };
        f.write_str(name)
    }
}

/// Convenience alias for `Result<T, RtpError>`.
pub type Result<T> = std::result::Result<T, RtpError>;
