//! Error taxonomy shared by the wire protocol and the operation engine.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// The error-kind byte carried by a `STREAM_ERROR` packet (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ErrorKind {
    NotFound = 0x01,
    Permission = 0x02,
    IoError = 0x03,
    Timeout = 0x04,
    Cancelled = 0x05,
    NoMemory = 0x06,
    Invalid = 0x07,
    Exists = 0x08,
    NotDir = 0x09,
    IsDir = 0x0A,
    Unknown = 0xFF,
}

impl ErrorKind {
    /// Human-readable label used when rendering a tool `isError` result.
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::Permission => "permission denied",
            ErrorKind::IoError => "I/O error",
            ErrorKind::Timeout => "timed out",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::NoMemory => "out of memory",
            ErrorKind::Invalid => "invalid request",
            ErrorKind::Exists => "already exists",
            ErrorKind::NotDir => "not a directory",
            ErrorKind::IsDir => "is a directory",
            ErrorKind::Unknown => "unknown error",
        }
    }
}

/// Taxonomy of errors that can terminate a session or a single stream.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed packet: {0}")]
    Protocol(String),

    #[error("packet payload of {len} bytes exceeds the 16 MiB maximum")]
    PayloadTooLarge { len: usize },

    #[error("unsupported protocol version {got} (expected 2)")]
    VersionMismatch { got: u8 },

    #[error("remote operation failed ({})", .kind.label())]
    Operation {
        kind: ErrorKind,
        message: String,
    },

    #[error("client not connected")]
    NotConnected,

    #[error("Host path must be under {base}")]
    HostPathConfinement { base: String },

    #[error("refusing to overwrite existing file {path}")]
    OverwriteRefused { path: String },
}
