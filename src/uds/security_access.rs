//! SecurityAccess (service `0x27`) seed/key helpers.

/// Derives a security-access key from a seed using the bitwise-complement of each byte.
///
/// This is the default algorithm when no manufacturer-specific `key_algo` is supplied to
/// [`crate::uds::UdsClient`]. It is deliberately not cryptographically meaningful — a real
/// vehicle's algorithm is manufacturer-confidential and out of scope here; this default exists
/// purely so `security_access` has something to call when the caller doesn't provide one.
pub fn default_key_algo(seed: &[u8]) -> Vec<u8> {
    seed.iter().map(|b| !b).collect()
}

/// Sub-function byte for a seed request at the given security level (levels are conventionally
/// odd values: `0x01`, `0x03`, ...).
pub fn seed_subfunction(level: u8) -> u8 {
    level * 2 - 1
}

/// Sub-function byte for sending back the derived key at the given security level.
pub fn key_subfunction(level: u8) -> u8 {
    level * 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_algo_complements_each_byte() {
        assert_eq!(default_key_algo(&[0xAA, 0xBB]), vec![0x55, 0x44]);
    }

    #[test]
    fn subfunction_bytes_follow_level_arithmetic() {
        assert_eq!(seed_subfunction(1), 0x01);
        assert_eq!(key_subfunction(1), 0x02);
        assert_eq!(seed_subfunction(3), 0x05);
        assert_eq!(key_subfunction(3), 0x06);
    }
}
