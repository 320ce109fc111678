//! The share data model: an 80-byte Bitcoin-compatible header plus the
//! sharechain fields that link it to its parent share.

use std::sync::OnceLock;

use num_bigint::BigUint;
use num_traits::Zero;
use thiserror::Error;

use crate::encoding::{read_varint, write_varint, EncodingError};
use crate::hash::{compact_to_target, hash_meets_target, hash_to_hex, sha256d};

/// All-zero parent hash marking the sharechain genesis.
pub const GENESIS_PREV_HASH: [u8; 32] = [0u8; 32];

#[derive(Debug, Error)]
pub enum ShareDecodeError {
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("share record truncated at {0}")]
    Truncated(&'static str),

    #[error("miner address is not valid utf-8")]
    BadAddress,
}

// =============================================================================
// ShareHeader
// =============================================================================

/// The header of a share. Byte-for-byte a Bitcoin block header, so a share
/// that happens to meet the Bitcoin target is a complete block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShareHeader {
    pub version: i32,
    pub prev_block_hash: [u8; 32],
    pub merkle_root: [u8; 32],
    pub timestamp: u32,
    /// Bitcoin difficulty target (nBits) the miner was working against.
    pub bits: u32,
    pub nonce: u32,
}

impl ShareHeader {
    /// Serialize to the canonical 80-byte Bitcoin block header layout.
    pub fn serialize(&self) -> [u8; 80] {
        let mut buf = [0u8; 80];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..36].copy_from_slice(&self.prev_block_hash);
        buf[36..68].copy_from_slice(&self.merkle_root);
        buf[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[72..76].copy_from_slice(&self.bits.to_le_bytes());
        buf[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        buf
    }

    /// Parse an 80-byte header.
    pub fn deserialize(buf: &[u8; 80]) -> Self {
        let mut prev_block_hash = [0u8; 32];
        prev_block_hash.copy_from_slice(&buf[4..36]);
        let mut merkle_root = [0u8; 32];
        merkle_root.copy_from_slice(&buf[36..68]);
        Self {
            version: i32::from_le_bytes(buf[0..4].try_into().unwrap()),
            prev_block_hash,
            merkle_root,
            timestamp: u32::from_le_bytes(buf[68..72].try_into().unwrap()),
            bits: u32::from_le_bytes(buf[72..76].try_into().unwrap()),
            nonce: u32::from_le_bytes(buf[76..80].try_into().unwrap()),
        }
    }

    /// Double-SHA-256 of the serialized header (the share/block hash).
    pub fn hash(&self) -> [u8; 32] {
        sha256d(&self.serialize())
    }
}

// =============================================================================
// Share
// =============================================================================

/// A single proof of work in the sharechain.
#[derive(Debug)]
pub struct Share {
    pub header: ShareHeader,

    /// Sharechain format version (currently 1).
    pub share_version: u32,
    /// Hash of the previous share; all zeros for genesis.
    pub prev_share_hash: [u8; 32],
    /// Sharechain difficulty target this share was required to meet.
    pub share_target: BigUint,
    /// Miner's payout address (bech32).
    pub miner_address: String,
    /// Full serialized coinbase transaction (non-witness form).
    pub coinbase_tx: Vec<u8>,

    hash: OnceLock<[u8; 32]>,
}

impl Share {
    pub fn new(
        header: ShareHeader,
        share_version: u32,
        prev_share_hash: [u8; 32],
        share_target: BigUint,
        miner_address: String,
        coinbase_tx: Vec<u8>,
    ) -> Self {
        Self {
            header,
            share_version,
            prev_share_hash,
            share_target,
            miner_address,
            coinbase_tx,
            hash: OnceLock::new(),
        }
    }

    /// The share's id: the header hash. Cached after the first computation.
    pub fn hash(&self) -> [u8; 32] {
        *self.hash.get_or_init(|| self.header.hash())
    }

    /// True iff this share is the sharechain genesis.
    pub fn is_genesis(&self) -> bool {
        self.prev_share_hash == GENESIS_PREV_HASH
    }

    /// True iff the share hash meets the given target.
    pub fn meets_target(&self, target: &BigUint) -> bool {
        hash_meets_target(&self.hash(), target)
    }

    /// True iff the share meets its own sharechain target.
    pub fn meets_share_target(&self) -> bool {
        !self.share_target.is_zero() && self.meets_target(&self.share_target)
    }

    /// True iff the share also meets Bitcoin's full difficulty from its
    /// header nBits, i.e. it is a complete Bitcoin block.
    pub fn is_block(&self) -> bool {
        self.meets_target(&compact_to_target(self.header.bits))
    }

    /// Hash in human-readable display order.
    pub fn hash_hex(&self) -> String {
        hash_to_hex(&self.hash())
    }

    /// Parent hash in human-readable display order.
    pub fn prev_share_hash_hex(&self) -> String {
        hash_to_hex(&self.prev_share_hash)
    }

    // -------------------------------------------------------------------------
    // Storage codec
    // -------------------------------------------------------------------------

    /// Serialize for persistent storage. Layout: 80-byte header, u32 LE share
    /// version, 32-byte prev share hash, varint-prefixed big-endian target,
    /// varint-prefixed address, varint-prefixed coinbase.
    pub fn encode(&self) -> Vec<u8> {
        let target_bytes = self.share_target.to_bytes_be();
        let mut buf = Vec::with_capacity(
            80 + 4 + 32 + target_bytes.len() + self.miner_address.len() + self.coinbase_tx.len() + 16,
        );
        buf.extend_from_slice(&self.header.serialize());
        buf.extend_from_slice(&self.share_version.to_le_bytes());
        buf.extend_from_slice(&self.prev_share_hash);
        buf.extend_from_slice(&write_varint(target_bytes.len() as u64));
        buf.extend_from_slice(&target_bytes);
        buf.extend_from_slice(&write_varint(self.miner_address.len() as u64));
        buf.extend_from_slice(self.miner_address.as_bytes());
        buf.extend_from_slice(&write_varint(self.coinbase_tx.len() as u64));
        buf.extend_from_slice(&self.coinbase_tx);
        buf
    }

    /// Inverse of [`Share::encode`].
    pub fn decode(data: &[u8]) -> Result<Self, ShareDecodeError> {
        let header_bytes: &[u8; 80] = data
            .get(0..80)
            .and_then(|s| s.try_into().ok())
            .ok_or(ShareDecodeError::Truncated("header"))?;
        let header = ShareHeader::deserialize(header_bytes);
        let mut pos = 80;

        let version_bytes = data
            .get(pos..pos + 4)
            .ok_or(ShareDecodeError::Truncated("share version"))?;
        let share_version = u32::from_le_bytes(version_bytes.try_into().unwrap());
        pos += 4;

        let prev_bytes = data
            .get(pos..pos + 32)
            .ok_or(ShareDecodeError::Truncated("prev share hash"))?;
        let mut prev_share_hash = [0u8; 32];
        prev_share_hash.copy_from_slice(prev_bytes);
        pos += 32;

        let (target_bytes, next) = read_field(data, pos, "share target")?;
        let share_target = BigUint::from_bytes_be(target_bytes);
        pos = next;

        let (addr_bytes, next) = read_field(data, pos, "miner address")?;
        let miner_address = std::str::from_utf8(addr_bytes)
            .map_err(|_| ShareDecodeError::BadAddress)?
            .to_string();
        pos = next;

        let (coinbase, _) = read_field(data, pos, "coinbase tx")?;

        Ok(Share::new(
            header,
            share_version,
            prev_share_hash,
            share_target,
            miner_address,
            coinbase.to_vec(),
        ))
    }
}

fn read_field<'a>(
    data: &'a [u8],
    pos: usize,
    what: &'static str,
) -> Result<(&'a [u8], usize), ShareDecodeError> {
    let (len, consumed) = read_varint(data.get(pos..).ok_or(ShareDecodeError::Truncated(what))?)?;
    let start = pos + consumed;
    let end = start
        .checked_add(len as usize)
        .ok_or(ShareDecodeError::Truncated(what))?;
    let field = data.get(start..end).ok_or(ShareDecodeError::Truncated(what))?;
    Ok((field, end))
}

impl Clone for Share {
    fn clone(&self) -> Self {
        let hash = OnceLock::new();
        if let Some(h) = self.hash.get() {
            let _ = hash.set(*h);
        }
        Self {
            header: self.header,
            share_version: self.share_version,
            prev_share_hash: self.prev_share_hash,
            share_target: self.share_target.clone(),
            miner_address: self.miner_address.clone(),
            coinbase_tx: self.coinbase_tx.clone(),
            hash,
        }
    }
}

impl PartialEq for Share {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header
            && self.share_version == other.share_version
            && self.prev_share_hash == other.prev_share_hash
            && self.share_target == other.share_target
            && self.miner_address == other.miner_address
            && self.coinbase_tx == other.coinbase_tx
    }
}

impl Eq for Share {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> ShareHeader {
        ShareHeader {
            version: 1,
            prev_block_hash: [0u8; 32],
            merkle_root: [0u8; 32],
            timestamp: 1_700_000_000,
            bits: 0x1d00ffff,
            nonce: 12345,
        }
    }

    #[test]
    fn test_header_serialize_length_and_layout() {
        let h = sample_header();
        let data = h.serialize();
        assert_eq!(data.len(), 80);
        assert_eq!(&data[0..4], &1i32.to_le_bytes());
        assert_eq!(&data[72..76], &0x1d00ffffu32.to_le_bytes());
        assert_eq!(ShareHeader::deserialize(&data), h);
    }

    #[test]
    fn test_header_hash_deterministic() {
        let mut h = sample_header();
        let hash1 = h.hash();
        assert_eq!(hash1, h.hash());

        // Any single field change must change the hash.
        h.nonce = 1;
        assert_ne!(hash1, h.hash());
        h.nonce = 12345;
        h.timestamp += 1;
        assert_ne!(hash1, h.hash());
    }

    #[test]
    fn test_hash_matches_serialized_bytes() {
        let h = sample_header();
        assert_eq!(h.hash(), sha256d(&h.serialize()));
    }

    fn sample_share() -> Share {
        Share::new(
            sample_header(),
            1,
            [0u8; 32],
            compact_to_target(0x207fffff),
            "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx".to_string(),
            vec![0x01, 0x02, 0x03],
        )
    }

    #[test]
    fn test_meets_target() {
        let share = sample_share();

        let easy = (BigUint::from(1u8) << 256u32) - 1u8;
        assert!(share.meets_target(&easy));
        assert!(!share.meets_target(&BigUint::zero()));
    }

    #[test]
    fn test_is_block_regtest_bits() {
        let mut share = sample_share();
        share.header.bits = 0x207fffff;
        // At regtest difficulty almost every hash qualifies.
        assert!(share.is_block());
    }

    #[test]
    fn test_hash_hex_length() {
        assert_eq!(sample_share().hash_hex().len(), 64);
    }

    #[test]
    fn test_storage_codec_round_trip() {
        let share = sample_share();
        let decoded = Share::decode(&share.encode()).unwrap();
        assert_eq!(decoded, share);
        assert_eq!(decoded.hash(), share.hash());
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let bytes = sample_share().encode();
        for cut in [0, 40, 80, 85, bytes.len() - 1] {
            assert!(Share::decode(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }
}
