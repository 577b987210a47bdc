//! Uppercase hex for frame logs

use std::fmt::Write;

/// Encode bytes to uppercase hex string
/// Example: [0x9D, 0xA1, 0x14] -> "9DA114"
pub fn encode_upper(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 2);
    for byte in data {
        // Writing to String buffer is infallible
        let _ = write!(&mut result, "{:02X}", byte);
    }
    result
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_encode_upper_basic() {
        assert_eq!(encode_upper(&[0x9D, 0xA1, 0x06, 0xC3, 0x00, 0x32]), "9DA106C30032");
    }

    #[test]
    fn test_encode_upper_empty() {
        assert_eq!(encode_upper(&[]), "");
    }

    #[test]
    fn test_encode_upper_single_byte() {
        assert_eq!(encode_upper(&[0xFF]), "FF");
        assert_eq!(encode_upper(&[0x00]), "00");
        assert_eq!(encode_upper(&[0x0F]), "0F");
    }
}
