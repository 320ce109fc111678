//! Optional zstd compression for coinbase payloads on the wire.

use thiserror::Error;

/// The zstd frame magic. Anything else passes through untouched, which
/// keeps older (uncompressed) senders compatible.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Decompression output cap; a legitimate coinbase is nowhere near this.
const MAX_DECOMPRESSED: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum CompressError {
    #[error("zstd error: {0}")]
    Zstd(#[from] std::io::Error),
}

/// Compress coinbase bytes with zstd.
pub fn compress_coinbase(data: &[u8]) -> Result<Vec<u8>, CompressError> {
    Ok(zstd::bulk::compress(data, 0)?)
}

/// Decompress coinbase bytes if they carry the zstd magic; return the input
/// verbatim otherwise.
pub fn decompress_coinbase(data: &[u8]) -> Result<Vec<u8>, CompressError> {
    if data.len() < 4 || data[0..4] != ZSTD_MAGIC {
        return Ok(data.to_vec());
    }
    Ok(zstd::bulk::decompress(data, MAX_DECOMPRESSED)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let data = vec![0x42u8; 4096];
        let compressed = compress_coinbase(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(&compressed[0..4], &ZSTD_MAGIC);
        assert_eq!(decompress_coinbase(&compressed).unwrap(), data);
    }

    #[test]
    fn test_uncompressed_passthrough() {
        let data = vec![0x01, 0x02, 0x03];
        assert_eq!(decompress_coinbase(&data).unwrap(), data);

        let empty: Vec<u8> = Vec::new();
        assert_eq!(decompress_coinbase(&empty).unwrap(), empty);
    }

    #[test]
    fn test_truncated_frame_errors() {
        let data = vec![0x28, 0xb5, 0x2f, 0xfd, 0x00];
        assert!(decompress_coinbase(&data).is_err());
    }
}
