// Value codec: fixed-width integers and hex for characteristic payloads
//
// GATT APIs carry integers little-endian; big-endian decoding is provided for
// peers that do not follow that convention.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Value too short: need {needed} bytes, got {actual}")]
    TooShort { needed: usize, actual: usize },
    #[error("Invalid hex: {0}")]
    InvalidHex(String),
}

fn require(raw: &[u8], needed: usize) -> Result<(), CodecError> {
    if raw.len() < needed {
        return Err(CodecError::TooShort {
            needed,
            actual: raw.len(),
        });
    }
    Ok(())
}

pub fn encode_u32_le(value: u32) -> [u8; 4] {
    value.to_le_bytes()
}

pub fn encode_u32_be(value: u32) -> [u8; 4] {
    value.to_be_bytes()
}

pub fn encode_u16_le(value: u16) -> [u8; 2] {
    value.to_le_bytes()
}

pub fn encode_u16_be(value: u16) -> [u8; 2] {
    value.to_be_bytes()
}

/// Decode the first four bytes as a little-endian u32
pub fn decode_u32_le(raw: &[u8]) -> Result<u32, CodecError> {
    require(raw, 4)?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

/// Decode the first four bytes as a big-endian u32
pub fn decode_u32_be(raw: &[u8]) -> Result<u32, CodecError> {
    require(raw, 4)?;
    Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

pub fn decode_u16_le(raw: &[u8]) -> Result<u16, CodecError> {
    require(raw, 2)?;
    Ok(u16::from_le_bytes([raw[0], raw[1]]))
}

pub fn decode_u16_be(raw: &[u8]) -> Result<u16, CodecError> {
    require(raw, 2)?;
    Ok(u16::from_be_bytes([raw[0], raw[1]]))
}

/// Upper-case hex rendering of a byte slice
pub fn hex_from_bytes(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Parse a hex string (either case) into bytes
pub fn bytes_from_hex(s: &str) -> Result<Vec<u8>, CodecError> {
    hex::decode(s).map_err(|e| CodecError::InvalidHex(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_u32_le_layout() {
        assert_eq!(encode_u32_le(0x0102_0304), [0x04, 0x03, 0x02, 0x01]);
        assert_eq!(decode_u32_le(&[0x04, 0x03, 0x02, 0x01]).unwrap(), 0x0102_0304);
    }

    #[test]
    fn test_u32_be_layout() {
        assert_eq!(encode_u32_be(0x0102_0304), [0x01, 0x02, 0x03, 0x04]);
        assert_eq!(decode_u32_be(&[0x01, 0x02, 0x03, 0x04]).unwrap(), 0x0102_0304);
    }

    #[test]
    fn test_u16_layouts() {
        assert_eq!(encode_u16_le(0x1234), [0x34, 0x12]);
        assert_eq!(encode_u16_be(0x1234), [0x12, 0x34]);
        assert_eq!(decode_u16_be(&[0x12, 0x34, 0xFF]).unwrap(), 0x1234);
        assert_eq!(
            decode_u16_be(&[0x12]),
            Err(CodecError::TooShort {
                needed: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        assert_eq!(decode_u32_le(&[1, 0, 0, 0, 0xFF]).unwrap(), 1);
        assert_eq!(decode_u16_le(&[0x34, 0x12, 0x00]).unwrap(), 0x1234);
    }

    #[test]
    fn test_decode_too_short() {
        assert_eq!(
            decode_u32_le(&[1, 2, 3]),
            Err(CodecError::TooShort {
                needed: 4,
                actual: 3
            })
        );
        assert!(decode_u16_le(&[]).is_err());
    }

    #[test]
    fn test_hex_upper_case() {
        assert_eq!(hex_from_bytes(&[0x00, 0xAB, 0x7f]), "00AB7F");
        assert_eq!(bytes_from_hex("00ab7F").unwrap(), vec![0x00, 0xAB, 0x7F]);
    }

    #[test]
    fn test_invalid_hex() {
        assert!(matches!(bytes_from_hex("ABC"), Err(CodecError::InvalidHex(_))));
        assert!(matches!(bytes_from_hex("ZZ"), Err(CodecError::InvalidHex(_))));
    }

    proptest! {
        #[test]
        fn prop_u32_le_roundtrip(x in any::<u32>()) {
            prop_assert_eq!(decode_u32_le(&encode_u32_le(x)).unwrap(), x);
        }

        #[test]
        fn prop_u32_be_roundtrip(x in any::<u32>()) {
            prop_assert_eq!(decode_u32_be(&encode_u32_be(x)).unwrap(), x);
        }

        #[test]
        fn prop_u16_le_roundtrip(x in any::<u16>()) {
            prop_assert_eq!(decode_u16_le(&encode_u16_le(x)).unwrap(), x);
        }

        #[test]
        fn prop_u16_be_roundtrip(x in any::<u16>()) {
            prop_assert_eq!(decode_u16_be(&encode_u16_be(x)).unwrap(), x);
        }

        #[test]
        fn prop_hex_roundtrip(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            prop_assert_eq!(bytes_from_hex(&hex_from_bytes(&bytes)).unwrap(), bytes);
        }
    }
}
