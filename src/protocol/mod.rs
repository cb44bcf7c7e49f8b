pub mod banner;
pub mod checksum;
pub mod constants;
pub mod error;
pub mod features;
pub mod handshake;
pub mod message;

pub use banner::{host_banner, Banner};
pub use error::{AdbError, AdbResult, FormatError};
pub use handshake::{handshake, HandshakeResult};
pub use message::{read_message, write_message, AdbMessage, Command};
