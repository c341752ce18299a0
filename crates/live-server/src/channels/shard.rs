//! Shard selection for channel layer keys.

/// Map a group or process name onto one of `shard_count` store shards.
///
/// Uses CRC32 (IEEE) so every process, regardless of platform or build,
/// agrees on the shard for a name. A single shard always maps to index 0.
#[must_use]
pub fn consistent_hash(name: &str, shard_count: usize) -> usize {
    if shard_count <= 1 {
        return 0;
    }
    crc32fast::hash(name.as_bytes()) as usize % shard_count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_shard_is_always_zero() {
        assert_eq!(consistent_hash("room.123", 1), 0);
        assert_eq!(consistent_hash("anything", 0), 0);
    }

    #[test]
    fn test_matches_crc32_check_value() {
        // CRC-32/ISO-HDLC check value for "123456789" is 0xCBF43926.
        assert_eq!(consistent_hash("123456789", 1000), 0xCBF4_3926 % 1000);
        assert_eq!(consistent_hash("123456789", 7), 0xCBF4_3926 % 7);
    }

    #[test]
    fn test_stable_and_in_range() {
        for name in ["user.a", "world.democon", "version.abc.production"] {
            let first = consistent_hash(name, 5);
            assert!(first < 5);
            assert_eq!(first, consistent_hash(name, 5));
        }
    }
}
