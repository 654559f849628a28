//! Checksum helpers for persisted metadata blocks
//!
//! Superblocks and free-space manager blocks end with a little-endian
//! CRC32C of everything before it.

/// Size of the trailing checksum field
pub const CHECKSUM_LEN: usize = 4;

/// Quick CRC32C computation
#[inline]
#[must_use]
pub fn compute_crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Quick CRC32C verification
#[inline]
#[must_use]
pub fn verify_crc32c(data: &[u8], expected: u32) -> bool {
    crc32c::crc32c(data) == expected
}

/// Verify a block whose last four bytes hold the checksum of the rest.
///
/// Returns the payload without the checksum on success.
#[must_use]
pub fn split_checked(block: &[u8]) -> Option<&[u8]> {
    if block.len() < CHECKSUM_LEN {
        return None;
    }
    let (payload, tail) = block.split_at(block.len() - CHECKSUM_LEN);
    let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    verify_crc32c(payload, stored).then_some(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32c_verify() {
        let data = b"free space header";
        let crc = compute_crc32c(data);
        assert!(verify_crc32c(data, crc));
        assert!(!verify_crc32c(b"free space headeR", crc));
    }

    #[test]
    fn test_split_checked() {
        let mut block = b"MCSB payload".to_vec();
        let crc = compute_crc32c(&block);
        block.extend_from_slice(&crc.to_le_bytes());

        assert_eq!(split_checked(&block), Some(&b"MCSB payload"[..]));

        block[0] ^= 0xff;
        assert!(split_checked(&block).is_none());
        assert!(split_checked(&[1, 2]).is_none());
    }
}
