//! Stratum job construction and submission reconstruction.
//!
//! Everything here is byte-exact: the coinbase split must reassemble to the
//! transaction the merkle root commits to, and the reconstructed 80-byte
//! header must hash to the value the miner actually ground.

use thiserror::Error;

use peerpool_rpc::BlockTemplate;
use peerpool_types::coinbase::{add_coinbase_witness, build_share_commitment, CoinbaseBuilder, CoinbaseError};
use peerpool_types::constants::Network;
use peerpool_types::encoding::write_varint;
use peerpool_types::hash::{reverse_bytes, sha256d};
use peerpool_types::PayoutEntry;

#[derive(Debug, Error)]
pub enum WorkError {
    #[error("no block template available")]
    NoTemplate,

    #[error("coinbase build failed: {0}")]
    Coinbase(#[from] CoinbaseError),

    #[error("invalid hex in {what}: {source}")]
    Hex {
        what: &'static str,
        #[source]
        source: hex::FromHexError,
    },

    #[error("{what}: expected {expected} bytes, got {got}")]
    BadLength {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("header too short: {0} bytes")]
    HeaderTooShort(usize),

    #[error(
        "merkle root mismatch: header={header} expected={expected} coinbase_txid={coinbase} tx_count={tx_count}"
    )]
    MerkleMismatch {
        header: String,
        expected: String,
        coinbase: String,
        tx_count: usize,
    },
}

fn decode_hex(s: &str, what: &'static str) -> Result<Vec<u8>, WorkError> {
    hex::decode(s).map_err(|source| WorkError::Hex { what, source })
}

/// A Stratum work unit plus the internal fields needed to validate
/// submissions against it.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    /// Monotonic sequence number; the orchestrator only broadcasts the
    /// latest observed one.
    pub seq: u64,
    /// Previous block hash in Stratum wire order.
    pub prev_block_hash: String,
    pub coinbase1: String,
    pub coinbase2: String,
    /// The unsplit non-witness coinbase.
    pub coinbase_tx: Vec<u8>,
    pub extranonce_offset: usize,
    pub merkle_branches: Vec<String>,
    /// 4-byte big-endian hex fields as sent to miners.
    pub version: String,
    pub nbits: String,
    pub ntime: String,
    pub height: i64,
    pub clean_jobs: bool,
    /// The template this job was built from.
    pub template: BlockTemplate,
}

// =============================================================================
// Job Construction
// =============================================================================

/// Split a coinbase at the extranonce region into the two hex halves the
/// Stratum notify carries.
pub fn split_coinbase(
    coinbase_tx: &[u8],
    extranonce_offset: usize,
    extranonce_size: usize,
) -> (String, String) {
    let coinbase1 = hex::encode(&coinbase_tx[..extranonce_offset]);
    let coinbase2 = hex::encode(&coinbase_tx[extranonce_offset + extranonce_size..]);
    (coinbase1, coinbase2)
}

/// Merkle branches for Stratum: the sibling path of the coinbase leaf, bottom
/// to top. `tx_hashes` are the non-coinbase txids in internal byte order (hex).
pub fn compute_merkle_branches(tx_hashes: &[String]) -> Result<Vec<String>, WorkError> {
    if tx_hashes.is_empty() {
        return Ok(Vec::new());
    }

    let mut hashes: Vec<Vec<u8>> = Vec::with_capacity(tx_hashes.len());
    for h in tx_hashes {
        hashes.push(decode_hex(h, "tx hash")?);
    }

    let mut branches = Vec::new();
    while !hashes.is_empty() {
        branches.push(hex::encode(&hashes[0]));
        if hashes.len() == 1 {
            break;
        }

        // Pair up the remainder (duplicating a trailing odd element) to form
        // the next level.
        let remaining = &hashes[1..];
        let mut next_level = Vec::with_capacity(remaining.len().div_ceil(2));
        for pair in remaining.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            let mut combined = Vec::with_capacity(64);
            combined.extend_from_slice(left);
            combined.extend_from_slice(right);
            next_level.push(sha256d(&combined).to_vec());
        }
        hashes = next_level;
    }

    Ok(branches)
}

/// Fold a coinbase hash through merkle branches to the root, exactly what a
/// Stratum miner does.
pub fn compute_merkle_root(coinbase_hash: &[u8], branches: &[String]) -> Result<Vec<u8>, WorkError> {
    let mut current = coinbase_hash.to_vec();
    for branch in branches {
        let branch_bytes = decode_hex(branch, "merkle branch")?;
        let mut combined = Vec::with_capacity(64);
        combined.extend_from_slice(&current);
        combined.extend_from_slice(&branch_bytes);
        current = sha256d(&combined).to_vec();
    }
    Ok(current)
}

/// Standard bottom-up merkle root over all txids (coinbase first, internal
/// byte order). Used for pre-submission verification, independent of the
/// branch path.
pub fn compute_full_merkle_root(txids: &[Vec<u8>]) -> Option<Vec<u8>> {
    if txids.is_empty() {
        return None;
    }

    let mut hashes: Vec<Vec<u8>> = txids.to_vec();
    while hashes.len() > 1 {
        if hashes.len() % 2 != 0 {
            hashes.push(hashes[hashes.len() - 1].clone());
        }
        let mut next_level = Vec::with_capacity(hashes.len() / 2);
        for pair in hashes.chunks(2) {
            let mut combined = Vec::with_capacity(64);
            combined.extend_from_slice(&pair[0]);
            combined.extend_from_slice(&pair[1]);
            next_level.push(sha256d(&combined).to_vec());
        }
        hashes = next_level;
    }
    hashes.pop()
}

/// Build a Stratum job from a template plus the current payout snapshot and
/// tip-share commitment.
pub fn build_job_from_template(
    job_id: String,
    tmpl: &BlockTemplate,
    network: Network,
    payouts: &[PayoutEntry],
    prev_share_hash: [u8; 32],
    extranonce_size: usize,
) -> Result<Job, WorkError> {
    let builder = CoinbaseBuilder::new(network);
    let commitment = build_share_commitment(&prev_share_hash);
    let (coinbase_tx, extranonce_offset) = builder.build(
        tmpl.height,
        &commitment,
        payouts,
        &tmpl.default_witness_commitment,
        extranonce_size,
    )?;

    let (coinbase1, coinbase2) = split_coinbase(&coinbase_tx, extranonce_offset, extranonce_size);

    let tx_hashes = internal_tx_hashes(tmpl)?;
    let merkle_branches = compute_merkle_branches(&tx_hashes)?;

    let prev_block_hash = display_to_stratum_prevhash(&tmpl.previous_block_hash)?;

    Ok(Job {
        id: job_id,
        seq: 0,
        prev_block_hash,
        coinbase1,
        coinbase2,
        coinbase_tx,
        extranonce_offset,
        merkle_branches,
        version: format!("{:08x}", tmpl.version),
        nbits: tmpl.bits.clone(),
        ntime: format!("{:08x}", tmpl.cur_time),
        height: tmpl.height,
        clean_jobs: false,
        template: tmpl.clone(),
    })
}

/// Template txids converted from display order to internal byte order.
fn internal_tx_hashes(tmpl: &BlockTemplate) -> Result<Vec<String>, WorkError> {
    tmpl.transactions
        .iter()
        .map(|tx| {
            let b = decode_hex(&tx.txid, "template txid")?;
            Ok(hex::encode(reverse_bytes(&b)))
        })
        .collect()
}

// =============================================================================
// Submission Reconstruction
// =============================================================================

/// Rebuild the 80-byte header and the full coinbase from a miner submission.
///
/// `version` is the rolled version (BIP 310 bits already applied). The
/// 4-byte fields arrive as big-endian hex and are reversed into the header's
/// little-endian layout; the prevhash arrives in Stratum wire order and is
/// word-swapped back to internal order.
pub fn reconstruct_header(
    job: &Job,
    version: &str,
    extranonce1: &str,
    extranonce2: &str,
    ntime: &str,
    nonce: &str,
) -> Result<([u8; 80], Vec<u8>), WorkError> {
    let coinbase_hex = format!(
        "{}{}{}{}",
        job.coinbase1, extranonce1, extranonce2, job.coinbase2
    );
    let coinbase_bytes = decode_hex(&coinbase_hex, "coinbase")?;

    let coinbase_hash = sha256d(&coinbase_bytes);
    let merkle_root = compute_merkle_root(&coinbase_hash, &job.merkle_branches)?;

    let version_bytes = hex_be_to_le(version, 4, "version")?;
    let prev_hash = stratum_prevhash_to_internal(&job.prev_block_hash)?;
    let ntime_bytes = hex_be_to_le(ntime, 4, "ntime")?;
    let nbits_bytes = hex_be_to_le(&job.nbits, 4, "nbits")?;
    let nonce_bytes = hex_be_to_le(nonce, 4, "nonce")?;

    let mut header = [0u8; 80];
    header[0..4].copy_from_slice(&version_bytes);
    header[4..36].copy_from_slice(&prev_hash);
    header[36..68].copy_from_slice(&merkle_root);
    header[68..72].copy_from_slice(&ntime_bytes);
    header[72..76].copy_from_slice(&nbits_bytes);
    header[76..80].copy_from_slice(&nonce_bytes);

    Ok((header, coinbase_bytes))
}

/// Assemble the full serialized block for `submitblock`: header, tx count,
/// witness-wrapped coinbase, then the template transactions verbatim.
pub fn reconstruct_block(
    header: &[u8; 80],
    coinbase: &[u8],
    tmpl: &BlockTemplate,
) -> Result<String, WorkError> {
    let mut block = Vec::with_capacity(80 + 9 + coinbase.len() + 36);
    block.extend_from_slice(header);
    block.extend_from_slice(&write_varint(1 + tmpl.transactions.len() as u64));
    block.extend_from_slice(&add_coinbase_witness(coinbase));
    for tx in &tmpl.transactions {
        block.extend_from_slice(&decode_hex(&tx.data, "template tx data")?);
    }
    Ok(hex::encode(block))
}

/// Independently recompute the merkle root from the non-witness coinbase and
/// the template txids, and compare against header bytes 36..68. A mismatch
/// means the block must not be submitted.
pub fn verify_merkle_root(
    header: &[u8],
    coinbase: &[u8],
    tmpl: &BlockTemplate,
) -> Result<(), WorkError> {
    if header.len() < 68 {
        return Err(WorkError::HeaderTooShort(header.len()));
    }
    let header_root = &header[36..68];

    let coinbase_hash = sha256d(coinbase);
    let mut txids: Vec<Vec<u8>> = Vec::with_capacity(1 + tmpl.transactions.len());
    txids.push(coinbase_hash.to_vec());
    for tx in &tmpl.transactions {
        let b = decode_hex(&tx.txid, "template txid")?;
        txids.push(reverse_bytes(&b));
    }

    let expected = compute_full_merkle_root(&txids).expect("txids is non-empty");

    if header_root != expected.as_slice() {
        return Err(WorkError::MerkleMismatch {
            header: hex::encode(header_root),
            expected: hex::encode(&expected),
            coinbase: hex::encode(coinbase_hash),
            tx_count: tmpl.transactions.len(),
        });
    }
    Ok(())
}

// =============================================================================
// Hex Byte-Order Helpers
// =============================================================================

/// Decode big-endian hex and reverse to little-endian bytes.
fn hex_be_to_le(hex_str: &str, expected: usize, what: &'static str) -> Result<Vec<u8>, WorkError> {
    let b = decode_hex(hex_str, what)?;
    if b.len() != expected {
        return Err(WorkError::BadLength {
            what,
            expected,
            got: b.len(),
        });
    }
    Ok(reverse_bytes(&b))
}

/// Display order (big-endian, as getblocktemplate reports it) to Stratum
/// wire order: full byte reverse, then a 4-byte word swap.
pub fn display_to_stratum_prevhash(display_hex: &str) -> Result<String, WorkError> {
    let b = decode_hex(display_hex, "prevhash")?;
    if b.len() != 32 {
        return Err(WorkError::BadLength {
            what: "prevhash",
            expected: 32,
            got: b.len(),
        });
    }
    let mut internal = reverse_bytes(&b);
    swap_words4(&mut internal);
    Ok(hex::encode(internal))
}

/// Stratum wire order back to the internal byte order used in the header.
pub fn stratum_prevhash_to_internal(stratum_hex: &str) -> Result<Vec<u8>, WorkError> {
    let mut b = decode_hex(stratum_hex, "prevhash")?;
    if b.len() != 32 {
        return Err(WorkError::BadLength {
            what: "prevhash",
            expected: 32,
            got: b.len(),
        });
    }
    swap_words4(&mut b);
    Ok(b)
}

/// Byte-swap each 4-byte word in place.
fn swap_words4(b: &mut [u8]) {
    for word in b.chunks_exact_mut(4) {
        word.swap(0, 3);
        word.swap(1, 2);
    }
}
