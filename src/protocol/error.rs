use std::time::Duration;
use thiserror::Error;

use crate::crypto::KeyError;

/// Malformed input on the wire. Always fatal to the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("unknown command: 0x{0:08x}")]
    UnknownCommand(u32),

    #[error("truncated packet: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("payload too large: {size} bytes, maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("invalid OKAY payload: expected {expected} bytes, got {actual}")]
    InvalidAckPayload { expected: usize, actual: usize },
}

#[derive(Error, Debug)]
pub enum AdbError {
    #[error("malformed packet: {0}")]
    Format(#[from] FormatError),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("unsupported authentication packet type {0}")]
    UnsupportedPacket(u32),

    #[error("unsupported feature configuration: {0}")]
    UnsupportedFeatureConfiguration(String),

    #[error("socket refused by device: {service}")]
    SocketRefused { service: String },

    #[error("socket {local_id} is closed")]
    SocketClosed { local_id: u32 },

    #[error("transport closed")]
    TransportClosed,

    #[error("{operation} timed out after {limit:?}")]
    Timeout {
        operation: &'static str,
        limit: Duration,
    },

    #[error("unexpected {command} packet: {reason}")]
    UnexpectedPacket {
        command: &'static str,
        reason: String,
    },

    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("credential store error: {0}")]
    CredentialStore(#[source] anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdbError {
    /// Whether the caller can keep using the connection or retry on it.
    ///
    /// Authentication and single-socket failures leave the physical
    /// connection usable; everything else ends it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AdbError::AuthRejected(_)
                | AdbError::UnsupportedFeatureConfiguration(_)
                | AdbError::SocketRefused { .. }
                | AdbError::SocketClosed { .. }
                | AdbError::Key(_)
                | AdbError::CredentialStore(_)
        )
    }
}

pub type AdbResult<T> = Result<T, AdbError>;
