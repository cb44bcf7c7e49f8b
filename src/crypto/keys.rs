//! ADB RSA credentials.
//!
//! The daemon does not speak standard RSA formats. It wants the public key in
//! the mincrypt `RSAPublicKey` layout and verifies the challenge with a raw
//! RSA operation over a pre-built PKCS#1 v1.5 block, so both are computed here
//! directly on top of [`U2048`].

use base64::{engine::general_purpose, Engine as _};
use md5::{Digest, Md5};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey};
use std::fmt;
use thiserror::Error;

use super::bigint::{Montgomery, U2048, BYTES, LIMBS};

/// Only 2048-bit keys are accepted by the daemon.
pub const MODULUS_BITS: usize = 2048;

/// Length of the raw signature and of the modulus in bytes.
pub const MODULUS_BYTES: usize = BYTES;

pub const PUBLIC_EXPONENT: u32 = 65537;

/// Size of the encoded public key: length word, n0inv, n, RR and exponent.
pub const PUBLIC_KEY_BLOB_SIZE: usize = 4 + 4 + MODULUS_BYTES + MODULUS_BYTES + 4;

/// DER prefix of a SHA-1 `DigestInfo`.
pub const SHA1_DIGEST_INFO: [u8; 15] = [
    0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00, 0x04, 0x14,
];

/// Minimum run of 0xFF bytes in a PKCS#1 v1.5 type 1 block.
const MIN_PADDING: usize = 8;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("invalid DER private key: {0}")]
    InvalidDer(String),

    #[error("invalid PEM private key: {0}")]
    InvalidPem(String),

    #[error("unsupported key size: {bits} bits, expected {MODULUS_BITS}")]
    UnsupportedKeySize { bits: usize },

    #[error("unsupported public exponent, expected {PUBLIC_EXPONENT}")]
    UnsupportedExponent,

    #[error("data too long to sign: {len} bytes, at most {max}")]
    DataTooLong { len: usize, max: usize },

    #[error("key generation failed: {0}")]
    Generation(String),
}

/// A 2048-bit RSA private key as the daemon protocol needs it.
#[derive(Clone)]
pub struct AdbPrivateKey {
    modulus: U2048,
    private_exponent: U2048,
    name: Option<String>,
}

impl AdbPrivateKey {
    /// Build a key from its modulus and private exponent.
    pub fn from_components(modulus: U2048, private_exponent: U2048) -> Result<Self, KeyError> {
        let bits = modulus.bits();
        if bits != MODULUS_BITS {
            return Err(KeyError::UnsupportedKeySize { bits });
        }
        Ok(Self {
            modulus,
            private_exponent,
            name: None,
        })
    }

    /// Parse a PKCS#8 (or bare PKCS#1) DER private key.
    pub fn from_der(der: &[u8]) -> Result<Self, KeyError> {
        let (modulus, private_exponent) = parse_private_key(der)?;
        Self::from_components(modulus, private_exponent)
    }

    /// Parse a PEM private key such as `~/.android/adbkey`.
    pub fn from_pem(pem: &str) -> Result<Self, KeyError> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| KeyError::InvalidPem(e.to_string()))?;
        Self::from_rsa(&key)
    }

    /// Generate a fresh 2048-bit key.
    pub fn generate() -> Result<Self, KeyError> {
        let mut rng = rand::rngs::OsRng;
        let key = RsaPrivateKey::new(&mut rng, MODULUS_BITS)
            .map_err(|e| KeyError::Generation(e.to_string()))?;
        Self::from_rsa(&key)
    }

    fn from_rsa(key: &RsaPrivateKey) -> Result<Self, KeyError> {
        if *key.e() != BigUint::from(PUBLIC_EXPONENT) {
            return Err(KeyError::UnsupportedExponent);
        }
        let modulus = U2048::from_be_slice(&key.n().to_bytes_be()).ok_or(
            KeyError::UnsupportedKeySize {
                bits: key.n().bits() as usize,
            },
        )?;
        let private_exponent = U2048::from_be_slice(&key.d().to_bytes_be())
            .ok_or_else(|| KeyError::InvalidDer("private exponent wider than modulus".into()))?;
        Self::from_components(modulus, private_exponent)
    }

    /// Attach a display name, sent along with the public key on enrollment.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn modulus(&self) -> &U2048 {
        &self.modulus
    }

    pub fn public_key_blob(&self) -> [u8; PUBLIC_KEY_BLOB_SIZE] {
        derive_public_key_blob(&self.modulus)
    }

    /// Base64 of the public key blob, as stored in `adbkey.pub`.
    pub fn public_key_base64(&self) -> String {
        general_purpose::STANDARD.encode(self.public_key_blob())
    }

    /// Payload of an `AUTH(RSAPUBLICKEY)` packet: base64, optional ` name`, NUL.
    pub fn public_key_payload(&self) -> Vec<u8> {
        let mut payload = self.public_key_base64().into_bytes();
        if let Some(name) = &self.name {
            payload.push(b' ');
            payload.extend_from_slice(name.as_bytes());
        }
        payload.push(0);
        payload
    }

    pub fn sign(&self, data: &[u8]) -> Result<[u8; MODULUS_BYTES], KeyError> {
        sign(&self.modulus, &self.private_exponent, data)
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.modulus)
    }
}

impl fmt::Debug for AdbPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdbPrivateKey")
            .field("fingerprint", &self.fingerprint())
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl PartialEq for AdbPrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.modulus == other.modulus && self.private_exponent == other.private_exponent
    }
}

impl Eq for AdbPrivateKey {}

/// Extract `(n, d)` from a PKCS#8 or PKCS#1 DER private key.
///
/// The modulus must be 2048 bits and the public exponent 65537.
pub fn parse_private_key(der: &[u8]) -> Result<(U2048, U2048), KeyError> {
    let key = RsaPrivateKey::from_pkcs8_der(der)
        .or_else(|_| RsaPrivateKey::from_pkcs1_der(der))
        .map_err(|e| KeyError::InvalidDer(e.to_string()))?;
    let key = AdbPrivateKey::from_rsa(&key)?;
    Ok((key.modulus, key.private_exponent))
}

/// Encode a modulus in the daemon's public key format.
///
/// Layout, all little-endian: modulus length in words, `n0inv`, `n`,
/// `RR = 2^4096 mod n`, exponent.
pub fn derive_public_key_blob(modulus: &U2048) -> [u8; PUBLIC_KEY_BLOB_SIZE] {
    let mut blob = [0u8; PUBLIC_KEY_BLOB_SIZE];
    // n is odd for every valid RSA key; an even modulus yields zero n0inv/RR.
    let (n0inv, rr) = match Montgomery::new(modulus) {
        Some(ctx) => (ctx.n0inv(), *ctx.rr()),
        None => (0, U2048::ZERO),
    };

    blob[0..4].copy_from_slice(&(LIMBS as u32).to_le_bytes());
    blob[4..8].copy_from_slice(&n0inv.to_le_bytes());
    blob[8..8 + MODULUS_BYTES].copy_from_slice(&modulus.to_le_bytes());
    blob[8 + MODULUS_BYTES..8 + 2 * MODULUS_BYTES].copy_from_slice(&rr.to_le_bytes());
    blob[8 + 2 * MODULUS_BYTES..].copy_from_slice(&PUBLIC_EXPONENT.to_le_bytes());
    blob
}

/// Raw RSA over a PKCS#1 v1.5 block carrying a SHA-1 `DigestInfo`.
///
/// `data` is the device's token, which already has digest length. The result
/// is `block^d mod n` as 256 big-endian bytes.
pub fn sign(
    modulus: &U2048,
    private_exponent: &U2048,
    data: &[u8],
) -> Result<[u8; MODULUS_BYTES], KeyError> {
    let max = MODULUS_BYTES - 3 - MIN_PADDING - SHA1_DIGEST_INFO.len();
    if data.len() > max {
        return Err(KeyError::DataTooLong {
            len: data.len(),
            max,
        });
    }
    let ctx = Montgomery::new(modulus).ok_or(KeyError::UnsupportedKeySize {
        bits: modulus.bits(),
    })?;

    let mut block = [0xffu8; MODULUS_BYTES];
    block[0] = 0x00;
    block[1] = 0x01;
    let data_start = MODULUS_BYTES - data.len();
    let info_start = data_start - SHA1_DIGEST_INFO.len();
    block[info_start - 1] = 0x00;
    block[info_start..data_start].copy_from_slice(&SHA1_DIGEST_INFO);
    block[data_start..].copy_from_slice(data);

    let padded = U2048::from_be_slice(&block).unwrap_or(U2048::ZERO);
    Ok(ctx.pow(&padded, private_exponent).to_be_bytes())
}

/// MD5 of the public key blob as colon separated hex pairs.
pub fn fingerprint(modulus: &U2048) -> String {
    let digest = Md5::digest(derive_public_key_blob(modulus));
    digest
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(":")
}
