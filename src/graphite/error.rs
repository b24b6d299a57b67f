use std::io;

use thiserror::Error;

use super::state::ConnectionState;

/// Rejections raised before a metric ever reaches the buffer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("metric name must not be empty")]
    EmptyName,

    #[error("metric name {name:?} contains whitespace")]
    WhitespaceInName { name: String },

    #[error("metric {name:?} has non-finite value {value}")]
    NonFiniteValue { name: String, value: f64 },

    #[error("namespace {namespace:?} must match [A-Za-z0-9._-]")]
    InvalidNamespace { namespace: String },

    #[error("invalid host string {host:?}: {reason}")]
    InvalidHost { host: String, reason: &'static str },
}

/// An illegal connection-state transition. Always a logic bug in this crate.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("illegal connection state transition {from} -> {to}")]
pub struct ProtocolViolation {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Payload encode/decode failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("payload of {len} bytes exceeds the 4-byte length prefix")]
    PayloadTooLarge { len: usize },

    #[error("unexpected end of payload at offset {offset}")]
    Truncated { offset: usize },

    #[error("unsupported opcode 0x{opcode:02x} at offset {offset}")]
    UnsupportedOpcode { opcode: u8, offset: usize },

    #[error("malformed payload: {0}")]
    Malformed(&'static str),
}

/// Errors surfaced by sessions and the reliable transport.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("{op}: {message}")]
    Io {
        op: &'static str,
        kind: io::ErrorKind,
        message: String,
    },

    #[error("not connected")]
    NotConnected,

    #[error("transport closed before the flush completed")]
    Cancelled,
}

impl TransportError {
    pub(crate) fn io(op: &'static str, err: &io::Error) -> Self {
        Self::Io {
            op,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Connection failures worth retrying with backoff. Everything else is fatal.
pub fn is_retryable(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}
