pub mod daemon;

use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

pub use daemon::{AuthenticateError, DaemonTransport};

/// Any ordered, reliable byte stream to an ADB daemon: a TCP socket, a USB
/// bulk endpoint pair wrapped as a stream, or an in-memory pipe.
pub trait DeviceConnection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> DeviceConnection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Lifecycle of a daemon connection
///
/// `Authenticating` may repeat once per key the device rejects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// CNXN sent, nothing received yet
    Connecting,
    /// Answering AUTH challenges
    Authenticating,
    /// Device CNXN received, parameters negotiated
    Connected,
    /// Dispatcher running, sockets may be opened
    Operational,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Authenticating => write!(f, "Authenticating"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Operational => write!(f, "Operational"),
            ConnectionState::Disconnected => write!(f, "Disconnected"),
        }
    }
}
