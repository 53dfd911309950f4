//! Deterministic 16-bit hash of handler names.
//!
//! Fletcher-16 over the UTF-16 code units of the name. The value is the same
//! on every host and every run, so both sides of a connection can agree on a
//! compact handler id without exchanging a table.

/// Compute the stable 16-bit hash of `text`
pub fn stable_hash(text: &str) -> u16 {
    let mut sum1: u32 = 0;
    let mut sum2: u32 = 0;

    for unit in text.encode_utf16() {
        sum1 = (sum1 + u32::from(unit)) % 255;
        sum2 = (sum2 + sum1) % 255;
    }

    ((sum2 << 8) | sum1) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_string() {
        assert_eq!(stable_hash(""), 0);
    }

    #[test]
    fn test_known_values() {
        // 'a' = 97: sum1 = 97, sum2 = 97
        assert_eq!(stable_hash("a"), (97 << 8) | 97);
        // "ab": sum1 = 97 + 98 = 195, sum2 = 97 + 195 = 292 % 255 = 37
        assert_eq!(stable_hash("ab"), (37 << 8) | 195);
    }

    #[test]
    fn test_deterministic_and_order_sensitive() {
        assert_eq!(stable_hash("SyncObject"), stable_hash("SyncObject"));
        assert_ne!(stable_hash("ab"), stable_hash("ba"));
    }

    #[test]
    fn test_uses_utf16_units() {
        // U+00E9 is one UTF-16 unit with value 0xE9 = 233
        assert_eq!(stable_hash("é"), (233 << 8) | 233);
    }
}
