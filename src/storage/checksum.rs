//! CRC32 checksums for page headers and journal records
//!
//! Uses CRC32 (IEEE polynomial) via `crc32fast`.

use crc32fast::Hasher;

/// Computes a CRC32 checksum over the provided data.
pub fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Computes a CRC32 checksum over several slices as if concatenated.
pub fn compute_checksum_parts(parts: &[&[u8]]) -> u32 {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

/// Returns true if `data` hashes to `expected`.
pub fn verify_checksum(data: &[u8], expected: u32) -> bool {
    compute_checksum(data) == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_deterministic() {
        let data = b"page payload";
        assert_eq!(compute_checksum(data), compute_checksum(data));
    }

    #[test]
    fn test_checksum_detects_single_bit_flip() {
        let mut data = vec![0u8; 64];
        let original = compute_checksum(&data);
        data[17] ^= 0x04;
        assert_ne!(original, compute_checksum(&data));
    }

    #[test]
    fn test_parts_equal_concatenation() {
        let whole = compute_checksum(b"headerpayload");
        let parts = compute_checksum_parts(&[b"header", b"payload"]);
        assert_eq!(whole, parts);
    }

    #[test]
    fn test_verify_checksum() {
        let data = b"verify me";
        let sum = compute_checksum(data);
        assert!(verify_checksum(data, sum));
        assert!(!verify_checksum(data, sum ^ 1));
    }
}
