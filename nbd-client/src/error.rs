//! Error types for nbd-client.

use std::io;

use nix::errno::Errno;
use thiserror::Error;

pub use crate::protocol::NbdError;
use crate::protocol::format_message;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("handle is closed")]
    HandleClosed,

    #[error("invalid state: {operation} is not allowed while the connection is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("request out of bounds: offset {offset} + length {length} exceeds export size {size}")]
    OutOfBounds { offset: u64, length: u64, size: u64 },

    #[error("export is read-only")]
    ReadOnly,

    #[error("server does not support {feature}")]
    NotSupported { feature: &'static str },

    #[error("no meta context negotiation has occurred")]
    MetaContextsNotNegotiated,

    #[error("server has not returned export metadata, negotiate an export first")]
    NoExportInfo,

    #[error("buffer is in use by {holds} command(s) or slice(s)")]
    BufferInUse { holds: usize },

    #[error("unknown command cookie {cookie}")]
    UnknownCookie { cookie: u64 },

    #[error("command failed: {errno}{}", format_message(.message))]
    Command {
        errno: Errno,
        message: Option<String>,
    },

    #[error("callback failed: {0}")]
    Callback(#[from] CallbackError),

    #[error("nbd protocol error: {0}")]
    Nbd(#[from] NbdError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid NBD URI: {reason}")]
    Uri { reason: String },

    #[error("tls error: {reason}")]
    Tls { reason: String },
}

impl Error {
    pub(crate) fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub(crate) fn uri(reason: impl Into<String>) -> Self {
        Self::Uri {
            reason: reason.into(),
        }
    }

    /// The errno that best describes this error, mirroring what a C caller
    /// would see in `errno`.
    pub fn errno(&self) -> Errno {
        match self {
            Self::HandleClosed => Errno::EBADF,
            Self::InvalidState { .. } => Errno::ENOTCONN,
            Self::InvalidArgument { .. } | Self::Uri { .. } | Self::UnknownCookie { .. } => {
                Errno::EINVAL
            }
            Self::OutOfBounds { .. } => Errno::ERANGE,
            Self::ReadOnly => Errno::EPERM,
            Self::NotSupported { .. } | Self::MetaContextsNotNegotiated => Errno::ENOTSUP,
            Self::NoExportInfo => Errno::EINVAL,
            Self::BufferInUse { .. } => Errno::EBUSY,
            Self::Command { errno, .. } => *errno,
            Self::Callback(e) => e.errno,
            Self::Nbd(NbdError::Io(e)) => e
                .raw_os_error()
                .map(Errno::from_raw)
                .unwrap_or(Errno::EIO),
            Self::Nbd(NbdError::OptionUnsupported { .. }) => Errno::ENOTSUP,
            Self::Nbd(NbdError::ConnectionClosed | NbdError::ConnectionLost) => Errno::ENOTCONN,
            Self::Nbd(_) => Errno::EPROTO,
            Self::Config(_) => Errno::EINVAL,
            Self::Tls { .. } => Errno::ECONNREFUSED,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Nbd(NbdError::Io(err))
    }
}

/// Error raised by a caller-supplied callback.
///
/// Captured at the point it is raised and surfaced through the owning
/// command's terminal state.
#[derive(Debug, Clone, Error)]
#[error("{message} ({errno})")]
pub struct CallbackError {
    pub errno: Errno,
    pub message: String,
}

impl CallbackError {
    pub fn new(errno: Errno, message: impl Into<String>) -> Self {
        Self {
            errno,
            message: message.into(),
        }
    }
}

impl From<Errno> for CallbackError {
    fn from(errno: Errno) -> Self {
        Self {
            errno,
            message: errno.desc().to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(io::Error),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::OutOfBounds {
            offset: 100,
            length: 50,
            size: 120,
        };
        assert!(err.to_string().contains("120"));
    }

    #[test]
    fn command_error_display_with_message() {
        let err = Error::Command {
            errno: Errno::EIO,
            message: Some("bad sector".to_string()),
        };
        assert!(err.to_string().contains("bad sector"));
        assert_eq!(err.errno(), Errno::EIO);
    }

    #[test]
    fn io_errors_are_protocol_errors_tagged_with_cause() {
        let err: Error = io::Error::from_raw_os_error(nix::libc::ECONNRESET).into();
        assert!(matches!(err, Error::Nbd(NbdError::Io(_))));
        assert_eq!(err.errno(), Errno::ECONNRESET);
    }

    #[test]
    fn callback_error_from_errno() {
        let err = CallbackError::from(Errno::ENOSPC);
        assert_eq!(err.errno, Errno::ENOSPC);
        assert!(!err.message.is_empty());
    }
}
