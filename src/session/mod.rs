pub mod auth;
pub mod credentials;
pub mod dispatcher;
pub mod reverse;
pub mod socket;

pub use auth::{AuthEvent, AuthProcessor, AuthType, KeyInfo};
pub use credentials::{CredentialStore, KeyStream, MemoryCredentialStore};
pub use dispatcher::{DisconnectReason, Dispatcher, DispatcherOptions, DispatcherStats};
pub use reverse::{random_address, ReverseTunnelHandler};
pub use socket::{AdbSocket, AdbSocketReader, AdbSocketWriter, SocketState};
