// ADB daemon protocol constants

/// Oldest protocol version; packets carry a payload checksum.
pub const VERSION_MIN: u32 = 0x01000000;
/// First version where the checksum may be zero and service strings drop their NUL.
pub const VERSION_SKIP_CHECKSUM: u32 = 0x01000001;
pub const VERSION: u32 = VERSION_SKIP_CHECKSUM;

pub const MAX_PAYLOAD_V1: u32 = 4 * 1024;
pub const MAX_PAYLOAD: u32 = 1024 * 1024;
/// Upper bound accepted for a configured max payload.
pub const MAX_PAYLOAD_LIMIT: u32 = 16 * 1024 * 1024;

pub const DEFAULT_INITIAL_DELAYED_ACK_BYTES: u32 = 32 * 1024 * 1024;

pub const HEADER_SIZE: usize = 24;

// Command codes
pub const CNXN: u32 = 0x4e584e43;
pub const AUTH: u32 = 0x48545541;
pub const OPEN: u32 = 0x4e45504f;
pub const OKAY: u32 = 0x59414b4f;
pub const CLSE: u32 = 0x45534c43;
pub const WRTE: u32 = 0x45545257;

// AUTH packet arg0
pub const AUTH_TOKEN: u32 = 1;
pub const AUTH_SIGNATURE: u32 = 2;
pub const AUTH_RSAPUBLICKEY: u32 = 3;

/// Length of the device's authentication token.
pub const AUTH_TOKEN_SIZE: usize = 20;
