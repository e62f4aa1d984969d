use std::fmt;
use std::io;

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Status bits stored by every channel role.
    ///
    /// Codes combine with `|`, so a registry can report the union of its intake
    /// and broadcast channel status. An empty set means the channel is healthy.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[repr(transparent)]
    pub struct ErrorCode: u64 {
        const ADDRESS_PARSE                = 1 << 0;
        const BIND                         = 1 << 1;
        const ADDRESS_FAMILY_NOT_SUPPORTED = 1 << 2;
        const ADDRESS_IN_USE               = 1 << 3;
        const ADDRESS_NOT_AVAILABLE        = 1 << 4;
        const SERIALIZATION                = 1 << 5;
        const PROTOCOL_NOT_SUPPORTED       = 1 << 6;
        const SOCKET_LIMIT                 = 1 << 7;
        const LIBRARY_SHUTDOWN             = 1 << 8;
        const INVALID_SOCKET               = 1 << 9;
        const INVALID_ENDPOINT             = 1 << 10;
        const BAD_OPERATION                = 1 << 11;
        const INTERRUPTED                  = 1 << 12;
        const TIMEOUT                      = 1 << 13;
    }
}

impl ErrorCode {
    /// No error recorded
    pub const NONE: ErrorCode = ErrorCode::empty();

    /// Returns true when no bit is set
    pub fn is_ok(&self) -> bool {
        self.is_empty()
    }

    /// Maps an I/O failure onto status bits, adding `context` (usually `BIND`).
    pub fn from_io(err: &io::Error, context: ErrorCode) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::AddrInUse => ErrorCode::ADDRESS_IN_USE,
            io::ErrorKind::AddrNotAvailable => ErrorCode::ADDRESS_NOT_AVAILABLE,
            io::ErrorKind::Unsupported => ErrorCode::ADDRESS_FAMILY_NOT_SUPPORTED,
            io::ErrorKind::InvalidInput => ErrorCode::INVALID_ENDPOINT,
            io::ErrorKind::Interrupted => ErrorCode::INTERRUPTED,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorCode::TIMEOUT,
            io::ErrorKind::PermissionDenied => ErrorCode::BAD_OPERATION,
            _ => err.raw_os_error().map(from_os_code).unwrap_or_default(),
        };
        context | kind
    }
}

#[cfg(target_os = "linux")]
fn from_os_code(code: i32) -> ErrorCode {
    match code {
        // ENFILE / EMFILE
        23 | 24 => ErrorCode::SOCKET_LIMIT,
        // EPROTONOSUPPORT
        93 => ErrorCode::PROTOCOL_NOT_SUPPORTED,
        // EAFNOSUPPORT
        97 => ErrorCode::ADDRESS_FAMILY_NOT_SUPPORTED,
        _ => ErrorCode::empty(),
    }
}

#[cfg(not(target_os = "linux"))]
fn from_os_code(_code: i32) -> ErrorCode {
    ErrorCode::empty()
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("None");
        }
        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                f.write_str(" | ")?;
            }
            f.write_str(name)?;
            first = false;
        }
        Ok(())
    }
}

/// Custom error types for the discovery crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Channel error: {0}")]
    Channel(ErrorCode),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Error::Serialization(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Creates a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Projects this error onto the status bitmask
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Io(e) => ErrorCode::from_io(e, ErrorCode::empty()),
            Error::Serialization(_) => ErrorCode::SERIALIZATION,
            Error::Channel(code) => *code,
            Error::Config(_) => ErrorCode::INVALID_ENDPOINT,
            Error::InvalidState(_) => ErrorCode::BAD_OPERATION,
        }
    }
}
