//! Formats raw keys for log output. Stored keys mix ASCII tags with packed
//! binary fields, so everything goes through escaping.

use itertools::Itertools as _;

/// Formats raw bytes as an escaped ASCII string.
pub fn bytes(bytes: &[u8]) -> String {
    let escaped = bytes
        .iter()
        .copied()
        .flat_map(std::ascii::escape_default)
        .collect_vec();
    format!("\"{}\"", String::from_utf8_lossy(&escaped))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escapes_binary() {
        assert_eq!(bytes(b"abc"), "\"abc\"");
        assert_eq!(bytes(&[0x00, 0xff]), "\"\\x00\\xff\"");
    }
}
