//! Key-to-partition routing and topic name validation.
//!
//! The key hash is part of the wire contract: producers in any language must
//! agree on it, or the same key would land in different partitions depending
//! on who produced it. It is the classic left-shift polynomial
//! `h = 31*h + codepoint` over the key's Unicode code points, evaluated in
//! wrapping 64-bit signed arithmetic.

/// Maximum topic name length.
pub const MAX_TOPIC_LEN: usize = 256;

/// The 31-polynomial hash over the key's Unicode code points.
///
/// Overflow wraps in two's-complement 64-bit arithmetic. Do not change
/// this function: it moves keys between partitions.
pub fn key_hash(key: &str) -> i64 {
    let mut h: i64 = 0;
    for c in key.chars() {
        h = h.wrapping_mul(31).wrapping_add(c as i64);
    }
    h
}

/// Picks a partition in `[0, partition_num)` for `key`.
///
/// The empty key always routes to partition 0, regardless of `partition_num`.
pub fn partition_for_key(key: &str, partition_num: u32) -> u32 {
    if key.is_empty() || partition_num == 0 {
        return 0;
    }
    (key_hash(key).unsigned_abs() % u64::from(partition_num)) as u32
}

/// Validates a topic name: `[A-Za-z0-9_-]{1,256}`.
///
/// Topic names are interpolated into per-partition table names, so the
/// character class is deliberately narrow.
pub fn is_valid_topic_name(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LEN
        && topic
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
