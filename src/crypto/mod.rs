pub mod bigint;
pub mod keys;

pub use bigint::U2048;
pub use keys::{
    derive_public_key_blob, fingerprint, parse_private_key, sign, AdbPrivateKey, KeyError,
    PUBLIC_KEY_BLOB_SIZE,
};
