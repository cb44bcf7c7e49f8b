/// Legacy payload checksum: byte sum modulo 2^32.
pub fn calculate(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |sum, &byte| sum.wrapping_add(byte as u32))
}

pub fn verify(data: &[u8], expected: u32) -> bool {
    calculate(data) == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_checksum() {
        assert_eq!(calculate(&[]), 0);
    }

    #[test]
    fn test_simple_checksum() {
        // 'h' + 'e' + 'l' + 'l' + 'o'
        assert_eq!(calculate(b"hello"), 104 + 101 + 108 + 108 + 111);
        assert!(verify(b"hello", 532));
    }

    #[test]
    fn test_checksum_wraps() {
        let data = vec![0xffu8; 0x0101_0102];
        let expected = (0xffu64 * data.len() as u64 % (1u64 << 32)) as u32;
        assert_eq!(calculate(&data), expected);
    }

    #[test]
    fn test_verify_mismatch() {
        assert!(!verify(b"hello world", 0x12345678));
    }
}
