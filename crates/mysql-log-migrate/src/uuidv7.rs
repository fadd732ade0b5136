//! UUIDv7 synthesis from row timestamps.
//!
//! The identifier is rendered as 32 lowercase hex characters with no
//! separators so lexicographic comparison matches big-endian byte comparison;
//! identifiers derived from later timestamps always sort later.

use std::fmt::Write as _;

use chrono::{DateTime, TimeZone};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{MigrateError, Result};

/// Derive a UUIDv7 from a timestamp: 48-bit big-endian UnixMilli, version 7
/// nibble, RFC 4122 variant bits, and 74 bits of cryptographic randomness.
pub fn from_timestamp<Tz: TimeZone>(ts: &DateTime<Tz>) -> Result<String> {
    let ms = ts.timestamp_millis() as u64;

    let mut b = [0u8; 16];
    b[0] = (ms >> 40) as u8;
    b[1] = (ms >> 32) as u8;
    b[2] = (ms >> 24) as u8;
    b[3] = (ms >> 16) as u8;
    b[4] = (ms >> 8) as u8;
    b[5] = ms as u8;

    let mut rnd = [0u8; 10];
    OsRng
        .try_fill_bytes(&mut rnd)
        .map_err(|e| MigrateError::Stage(format!("randomness source failed: {}", e)))?;

    // version 7 (0b0111) in the high nibble of byte 6
    b[6] = 0x70 | (rnd[0] >> 4);
    b[7] = rnd[1];
    // variant 10xxxxxx
    b[8] = 0x80 | (rnd[2] & 0x3f);
    b[9..].copy_from_slice(&rnd[3..]);

    let mut out = String::with_capacity(32);
    for byte in b {
        // infallible for String
        let _ = write!(out, "{:02x}", byte);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn at_millis(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn test_shape() {
        let id = from_timestamp(&Utc::now()).unwrap();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, id.to_lowercase());
        assert!(!id.contains('-'));
    }

    #[test]
    fn test_version_and_variant_bits() {
        let id = from_timestamp(&Utc::now()).unwrap();
        // Byte 6 upper nibble is the version: hex digit 12 must be '7'.
        assert_eq!(id.as_bytes()[12], b'7');
        // Byte 8 upper two bits are `10`: hex digit 16 in 8..=b.
        assert!(matches!(id.as_bytes()[16], b'8' | b'9' | b'a' | b'b'));
    }

    #[test]
    fn test_timestamp_prefix_encodes_unix_millis() {
        let id = from_timestamp(&at_millis(0x0123_4567_89ab)).unwrap();
        assert_eq!(&id[..12], "0123456789ab");

        let id = from_timestamp(&at_millis(0)).unwrap();
        assert_eq!(&id[..12], "000000000000");
    }

    #[test]
    fn test_lexicographic_order_follows_time() {
        let t1 = at_millis(1_704_067_200_000); // 2024-01-01 00:00:00.000
        let t2 = at_millis(1_704_067_200_001); // one millisecond later
        let id1 = from_timestamp(&t1).unwrap();
        let id2 = from_timestamp(&t2).unwrap();
        assert!(id1 < id2);
        assert_ne!(&id1[..12], &id2[..12]);
    }

    #[test]
    fn test_same_millisecond_ids_are_unique() {
        let t = Utc::now();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            assert!(seen.insert(from_timestamp(&t).unwrap()));
        }
    }
}
