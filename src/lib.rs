//! Client side of the ADB daemon protocol.
//!
//! [`DaemonTransport`] authenticates with a device over any async byte stream
//! and multiplexes [`AdbSocket`]s over it.

pub mod config;
pub mod crypto;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod transport;

pub use config::ClientConfig;
pub use crypto::{AdbPrivateKey, KeyError};
pub use protocol::{AdbError, AdbMessage, AdbResult, Banner, Command};
pub use session::{
    AdbSocket, AuthEvent, AuthProcessor, CredentialStore, DisconnectReason,
    MemoryCredentialStore, ReverseTunnelHandler, SocketState,
};
pub use transport::{AuthenticateError, ConnectionState, DaemonTransport};
