//! Remaining Length encoding for the MQTT fixed header.
//!
//! Seven value bits per byte, least significant group first, with the high bit
//! set on every byte except the last. At most four bytes are allowed, which
//! caps the value at [`MAX_REMAINING_LENGTH`].

use crate::error::{ProtocolError, Result};

/// Largest value a four byte Remaining Length can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Longest legal encoding in bytes.
pub const MAX_ENCODED_LEN: usize = 4;

/// Decode a Remaining Length from the start of `buf`.
///
/// Returns `Ok(Some((value, bytes_consumed)))` on success and `Ok(None)` when
/// the buffer ends before the final byte. A fifth continuation byte is
/// [`ProtocolError::MalformedHeader`].
///
/// # Example
/// ```
/// use quaymq_core::varint::decode;
/// let (value, consumed) = decode(&[0xC1, 0x02]).unwrap().unwrap();
/// assert_eq!(value, 321);
/// assert_eq!(consumed, 2);
/// ```
pub fn decode(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut value = 0usize;

    for (i, &byte) in buf.iter().enumerate() {
        if i == MAX_ENCODED_LEN {
            return Err(ProtocolError::MalformedHeader.into());
        }

        value |= ((byte & 0x7F) as usize) << (7 * i);

        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }

    if buf.len() >= MAX_ENCODED_LEN {
        return Err(ProtocolError::MalformedHeader.into());
    }
    Ok(None)
}

/// Append the encoding of `value` to `buf`, returning the bytes written.
///
/// Values above [`MAX_REMAINING_LENGTH`] are the caller's bug; the encoder
/// does not clamp them.
pub fn encode(mut value: usize, buf: &mut Vec<u8>) -> usize {
    debug_assert!(value <= MAX_REMAINING_LENGTH);
    let start = buf.len();
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
    buf.len() - start
}

/// Number of bytes [`encode`] will write for `value`.
pub fn encoded_len(value: usize) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_decode_boundaries() {
        assert_eq!(decode(&[0x00]).unwrap(), Some((0, 1)));
        assert_eq!(decode(&[0x7F]).unwrap(), Some((127, 1)));
        assert_eq!(decode(&[0x80, 0x01]).unwrap(), Some((128, 2)));
        assert_eq!(decode(&[0xFF, 0x7F]).unwrap(), Some((16_383, 2)));
        assert_eq!(decode(&[0x80, 0x80, 0x01]).unwrap(), Some((16_384, 3)));
        assert_eq!(
            decode(&[0xFF, 0xFF, 0xFF, 0x7F]).unwrap(),
            Some((MAX_REMAINING_LENGTH, 4))
        );
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        assert_eq!(decode(&[0x05, 0xAA, 0xBB]).unwrap(), Some((5, 1)));
    }

    #[test]
    fn test_decode_needs_more() {
        assert_eq!(decode(&[]).unwrap(), None);
        assert_eq!(decode(&[0x80]).unwrap(), None);
        assert_eq!(decode(&[0xFF, 0xFF, 0xFF]).unwrap(), None);
    }

    #[test]
    fn test_decode_rejects_fifth_byte() {
        let err = decode(&[0x80, 0x80, 0x80, 0x80, 0x01]).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::MalformedHeader)
        ));
        // Four continuation bytes can never be completed legally.
        assert!(decode(&[0x80, 0x80, 0x80, 0x80]).is_err());
    }

    #[test]
    fn test_encode_matches_encoded_len() {
        for value in [0, 127, 128, 16_383, 16_384, 2_097_151, 2_097_152, MAX_REMAINING_LENGTH] {
            let mut buf = Vec::new();
            let written = encode(value, &mut buf);
            assert_eq!(written, encoded_len(value));
            assert_eq!(decode(&buf).unwrap(), Some((value, written)));
        }
    }

    #[test]
    fn test_encode_known_bytes() {
        let mut buf = Vec::new();
        encode(321, &mut buf);
        assert_eq!(buf, [0xC1, 0x02]);
    }
}
