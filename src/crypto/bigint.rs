//! Fixed-width 2048-bit unsigned arithmetic for ADB RSA keys.
//!
//! Only the operations the ADB key format and raw signing need are provided:
//! byte import/export in both orders, comparison, Montgomery multiplication
//! and modular exponentiation. Values are stored as 64 little-endian `u32`
//! limbs, which is also the word size the device-side key format uses.

use std::cmp::Ordering;
use std::fmt;

/// Number of 32-bit limbs in a [`U2048`].
pub const LIMBS: usize = 64;

/// Width of a [`U2048`] in bytes.
pub const BYTES: usize = LIMBS * 4;

/// A 2048-bit unsigned integer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct U2048([u32; LIMBS]);

impl U2048 {
    pub const ZERO: Self = Self([0; LIMBS]);
    pub const ONE: Self = {
        let mut limbs = [0; LIMBS];
        limbs[0] = 1;
        Self(limbs)
    };

    /// Read a big-endian byte string of at most 256 bytes.
    ///
    /// Returns `None` when the value does not fit, ignoring leading zero bytes.
    pub fn from_be_slice(bytes: &[u8]) -> Option<Self> {
        let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
        let significant = &bytes[start..];
        if significant.len() > BYTES {
            return None;
        }

        let mut limbs = [0u32; LIMBS];
        for (i, &byte) in significant.iter().rev().enumerate() {
            limbs[i / 4] |= (byte as u32) << ((i % 4) * 8);
        }
        Some(Self(limbs))
    }

    /// Read exactly 256 little-endian bytes.
    pub fn from_le_bytes(bytes: &[u8; BYTES]) -> Self {
        let mut limbs = [0u32; LIMBS];
        for (limb, chunk) in limbs.iter_mut().zip(bytes.chunks_exact(4)) {
            *limb = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self(limbs)
    }

    pub fn to_le_bytes(&self) -> [u8; BYTES] {
        let mut out = [0u8; BYTES];
        for (chunk, limb) in out.chunks_exact_mut(4).zip(self.0.iter()) {
            chunk.copy_from_slice(&limb.to_le_bytes());
        }
        out
    }

    pub fn to_be_bytes(&self) -> [u8; BYTES] {
        let mut out = self.to_le_bytes();
        out.reverse();
        out
    }

    /// Least significant 32 bits.
    pub fn low_u32(&self) -> u32 {
        self.0[0]
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&limb| limb == 0)
    }

    pub fn is_odd(&self) -> bool {
        self.0[0] & 1 == 1
    }

    /// Number of significant bits.
    pub fn bits(&self) -> usize {
        for (i, &limb) in self.0.iter().enumerate().rev() {
            if limb != 0 {
                return i * 32 + (32 - limb.leading_zeros() as usize);
            }
        }
        0
    }

    /// Value of bit `index`, counting from the least significant bit.
    pub fn bit(&self, index: usize) -> bool {
        index < LIMBS * 32 && (self.0[index / 32] >> (index % 32)) & 1 == 1
    }

    /// `self -= rhs`, returning the final borrow.
    fn sub_assign_borrow(&mut self, rhs: &Self) -> bool {
        let mut borrow = 0u64;
        for (a, &b) in self.0.iter_mut().zip(rhs.0.iter()) {
            let diff = (*a as u64).wrapping_sub(b as u64).wrapping_sub(borrow);
            *a = diff as u32;
            borrow = (diff >> 63) & 1;
        }
        borrow != 0
    }

    /// `self <<= 1`, returning the bit shifted out.
    fn shl1_assign(&mut self) -> bool {
        let mut carry = 0u32;
        for limb in self.0.iter_mut() {
            let next = *limb >> 31;
            *limb = (*limb << 1) | carry;
            carry = next;
        }
        carry != 0
    }
}

impl Ord for U2048 {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().rev().zip(other.0.iter().rev()) {
            match a.cmp(b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for U2048 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for U2048 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "U2048(0x")?;
        let bytes = self.to_be_bytes();
        let start = bytes.iter().position(|&b| b != 0).unwrap_or(BYTES - 1);
        for byte in &bytes[start..] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

/// Inverse of `a` modulo `m` by the extended Euclidean algorithm.
///
/// Returns `None` when `a` and `m` are not coprime.
pub fn mod_inverse(a: u64, m: u64) -> Option<u64> {
    if m == 0 {
        return None;
    }
    let (mut old_r, mut r) = (a as i128 % m as i128, m as i128);
    let (mut old_s, mut s) = (1i128, 0i128);
    while r != 0 {
        let quotient = old_r / r;
        (old_r, r) = (r, old_r - quotient * r);
        (old_s, s) = (s, old_s - quotient * s);
    }
    if old_r != 1 {
        return None;
    }
    Some(old_s.rem_euclid(m as i128) as u64)
}

/// Montgomery context for an odd 2048-bit modulus, with `R = 2^2048`.
#[derive(Clone)]
pub struct Montgomery {
    modulus: U2048,
    /// `-modulus^-1 mod 2^32`
    n0inv: u32,
    /// `R^2 mod modulus`
    rr: U2048,
}

impl Montgomery {
    /// Build the context. Returns `None` for an even or zero modulus.
    pub fn new(modulus: &U2048) -> Option<Self> {
        if !modulus.is_odd() {
            return None;
        }
        let inverse = mod_inverse(modulus.low_u32() as u64, 1 << 32)? as u32;
        Some(Self {
            modulus: *modulus,
            n0inv: inverse.wrapping_neg(),
            rr: r_squared(modulus),
        })
    }

    pub fn modulus(&self) -> &U2048 {
        &self.modulus
    }

    pub fn n0inv(&self) -> u32 {
        self.n0inv
    }

    /// `2^4096 mod modulus`
    pub fn rr(&self) -> &U2048 {
        &self.rr
    }

    /// `a * b * R^-1 mod modulus`, for `a, b < modulus` (CIOS form).
    fn mul(&self, a: &U2048, b: &U2048) -> U2048 {
        let n = &self.modulus.0;
        let mut t = [0u32; LIMBS + 2];

        for i in 0..LIMBS {
            let bi = b.0[i] as u64;
            let mut carry = 0u64;
            for j in 0..LIMBS {
                let uv = t[j] as u64 + a.0[j] as u64 * bi + carry;
                t[j] = uv as u32;
                carry = uv >> 32;
            }
            let uv = t[LIMBS] as u64 + carry;
            t[LIMBS] = uv as u32;
            t[LIMBS + 1] = (uv >> 32) as u32;

            let m = t[0].wrapping_mul(self.n0inv) as u64;
            let uv = t[0] as u64 + m * n[0] as u64;
            let mut carry = uv >> 32;
            for j in 1..LIMBS {
                let uv = t[j] as u64 + m * n[j] as u64 + carry;
                t[j - 1] = uv as u32;
                carry = uv >> 32;
            }
            let uv = t[LIMBS] as u64 + carry;
            t[LIMBS - 1] = uv as u32;
            t[LIMBS] = t[LIMBS + 1] + (uv >> 32) as u32;
            t[LIMBS + 1] = 0;
        }

        let mut result = U2048::ZERO;
        result.0.copy_from_slice(&t[..LIMBS]);
        if t[LIMBS] != 0 || result >= self.modulus {
            result.sub_assign_borrow(&self.modulus);
        }
        result
    }

    /// `base^exponent mod modulus` by left-to-right square-and-multiply.
    ///
    /// `base` must already be reduced below the modulus.
    pub fn pow(&self, base: &U2048, exponent: &U2048) -> U2048 {
        let base = self.mul(base, &self.rr);
        let mut acc = self.mul(&U2048::ONE, &self.rr);
        for index in (0..exponent.bits()).rev() {
            acc = self.mul(&acc, &acc);
            if exponent.bit(index) {
                acc = self.mul(&acc, &base);
            }
        }
        self.mul(&acc, &U2048::ONE)
    }
}

/// `2^4096 mod modulus` by repeated doubling, for a nonzero modulus.
fn r_squared(modulus: &U2048) -> U2048 {
    let mut x = U2048::ONE;
    if x >= *modulus {
        x.sub_assign_borrow(modulus);
    }
    for _ in 0..2 * LIMBS * 32 {
        let overflow = x.shl1_assign();
        if overflow || x >= *modulus {
            x.sub_assign_borrow(modulus);
        }
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(value: u64) -> U2048 {
        U2048::from_be_slice(&value.to_be_bytes()).unwrap()
    }

    #[test]
    fn test_byte_order_conversions() {
        let value = U2048::from_be_slice(&[0x01, 0x02, 0x03, 0x04, 0x05]).unwrap();
        assert_eq!(value.low_u32(), 0x02030405);
        assert_eq!(value.bits(), 33);

        let le = value.to_le_bytes();
        assert_eq!(&le[..5], &[0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(U2048::from_le_bytes(&le), value);

        let be = value.to_be_bytes();
        assert_eq!(&be[BYTES - 5..], &[0x01, 0x02, 0x03, 0x04, 0x05]);
    }

    #[test]
    fn test_from_be_slice_limits() {
        let mut padded = vec![0u8; 10];
        padded.extend_from_slice(&[0xff; BYTES]);
        assert!(U2048::from_be_slice(&padded).is_some());
        assert!(U2048::from_be_slice(&[0xff; BYTES + 1]).is_none());
        assert_eq!(U2048::from_be_slice(&[]), Some(U2048::ZERO));
    }

    #[test]
    fn test_ordering() {
        assert!(small(5) < small(6));
        assert!(U2048::from_be_slice(&[1, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap() > small(u64::MAX));
        assert_eq!(small(42).cmp(&small(42)), Ordering::Equal);
    }

    #[test]
    fn test_mod_inverse() {
        assert_eq!(mod_inverse(3, 11), Some(4));
        assert_eq!(mod_inverse(10, 17), Some(12));
        assert_eq!(mod_inverse(6, 9), None);

        let odd = 0x9e37_79b9u64;
        let inverse = mod_inverse(odd, 1 << 32).unwrap();
        assert_eq!((odd * inverse) % (1 << 32), 1);
    }

    #[test]
    fn test_montgomery_rejects_even_modulus() {
        assert!(Montgomery::new(&small(100)).is_none());
        assert!(Montgomery::new(&U2048::ZERO).is_none());
    }

    #[test]
    fn test_pow_small_values() {
        let ctx = Montgomery::new(&small(1_000_000_007)).unwrap();
        // 2^10 mod p
        assert_eq!(ctx.pow(&small(2), &small(10)), small(1024));
        // Fermat: a^(p-1) = 1 mod p
        assert_eq!(ctx.pow(&small(123_456), &small(1_000_000_006)), U2048::ONE);
        assert_eq!(ctx.pow(&small(7), &U2048::ZERO), U2048::ONE);
    }

    #[test]
    fn test_r_squared_small_modulus() {
        // 2^4096 mod 3 == 1, since 2^2 == 1 mod 3
        let ctx = Montgomery::new(&small(3)).unwrap();
        assert_eq!(*ctx.rr(), U2048::ONE);
        assert_eq!(ctx.n0inv().wrapping_mul(3), u32::MAX);
    }
}
