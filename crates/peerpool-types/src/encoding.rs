//! Bitcoin wire-format integer encodings.
//!
//! Varints here are the transaction-serialization flavor (1/3/5/9 bytes with
//! 0xfd/0xfe/0xff markers), not the base-128 kind used elsewhere.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodingError {
    #[error("empty data")]
    Empty,

    #[error("insufficient data for {0}-byte varint")]
    Truncated(usize),
}

/// Encode a Bitcoin-style variable-length integer.
pub fn write_varint(val: u64) -> Vec<u8> {
    match val {
        0..=0xfc => vec![val as u8],
        0xfd..=0xffff => {
            let mut b = vec![0xfd];
            b.extend_from_slice(&(val as u16).to_le_bytes());
            b
        }
        0x1_0000..=0xffff_ffff => {
            let mut b = vec![0xfe];
            b.extend_from_slice(&(val as u32).to_le_bytes());
            b
        }
        _ => {
            let mut b = vec![0xff];
            b.extend_from_slice(&val.to_le_bytes());
            b
        }
    }
}

/// Decode a Bitcoin-style variable-length integer.
/// Returns the value and the number of bytes consumed.
pub fn read_varint(data: &[u8]) -> Result<(u64, usize), EncodingError> {
    let first = *data.first().ok_or(EncodingError::Empty)?;
    match first {
        0..=0xfc => Ok((first as u64, 1)),
        0xfd => {
            let b: [u8; 2] = data
                .get(1..3)
                .ok_or(EncodingError::Truncated(3))?
                .try_into()
                .unwrap();
            Ok((u16::from_le_bytes(b) as u64, 3))
        }
        0xfe => {
            let b: [u8; 4] = data
                .get(1..5)
                .ok_or(EncodingError::Truncated(5))?
                .try_into()
                .unwrap();
            Ok((u32::from_le_bytes(b) as u64, 5))
        }
        0xff => {
            let b: [u8; 8] = data
                .get(1..9)
                .ok_or(EncodingError::Truncated(9))?
                .try_into()
                .unwrap();
            Ok((u64::from_le_bytes(b), 9))
        }
    }
}

/// Encode a Bitcoin script push-length prefix (OP_PUSHDATA1/2/4 as needed).
pub fn write_script_len(length: usize) -> Vec<u8> {
    match length {
        0..=0x4b => vec![length as u8],
        0x4c..=0xff => vec![0x4c, length as u8],
        0x100..=0xffff => {
            let mut b = vec![0x4d];
            b.extend_from_slice(&(length as u16).to_le_bytes());
            b
        }
        _ => {
            let mut b = vec![0x4e];
            b.extend_from_slice(&(length as u32).to_le_bytes());
            b
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_round_trip() {
        let cases: &[u64] = &[
            0,
            1,
            0xfc,
            0xfd,
            0xfffe,
            0xffff,
            0x1_0000,
            0xffff_fffe,
            0xffff_ffff,
            0x1_0000_0000,
            u64::MAX,
        ];

        for &val in cases {
            let encoded = write_varint(val);
            let (decoded, n) = read_varint(&encoded).unwrap();
            assert_eq!(decoded, val, "value mismatch for {val}");
            assert_eq!(n, encoded.len(), "length mismatch for {val}");
        }
    }

    #[test]
    fn test_varint_sizes() {
        assert_eq!(write_varint(0).len(), 1);
        assert_eq!(write_varint(0xfc).len(), 1);
        assert_eq!(write_varint(0xfd).len(), 3);
        assert_eq!(write_varint(0xffff).len(), 3);
        assert_eq!(write_varint(0x1_0000).len(), 5);
        assert_eq!(write_varint(0xffff_ffff).len(), 5);
        assert_eq!(write_varint(0x1_0000_0000).len(), 9);
    }

    #[test]
    fn test_varint_truncated() {
        assert_eq!(read_varint(&[]), Err(EncodingError::Empty));
        assert_eq!(read_varint(&[0xfd, 0x01]), Err(EncodingError::Truncated(3)));
        assert_eq!(
            read_varint(&[0xfe, 0x01, 0x02, 0x03]),
            Err(EncodingError::Truncated(5))
        );
        assert_eq!(
            read_varint(&[0xff, 0, 1, 2, 3, 4, 5, 6]),
            Err(EncodingError::Truncated(9))
        );
    }

    #[test]
    fn test_script_len() {
        assert_eq!(write_script_len(0x20), vec![0x20]);
        assert_eq!(write_script_len(0x4b), vec![0x4b]);
        assert_eq!(write_script_len(0x4c), vec![0x4c, 0x4c]);
        assert_eq!(write_script_len(0xff), vec![0x4c, 0xff]);
        assert_eq!(write_script_len(0x100), vec![0x4d, 0x00, 0x01]);
    }
}
