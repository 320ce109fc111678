//! Coinbase transaction construction and inspection.
//!
//! The pool coinbase pays every PPLNS window participant, embeds the
//! template's SegWit witness commitment, and commits to the parent share
//! hash in a second OP_RETURN output so peers can tie the coinbase to its
//! place in the sharechain. A reserved zero region inside the scriptSig is
//! where Stratum sessions roll their extranonce.

use thiserror::Error;

use crate::address::{script_pubkey, AddressError};
use crate::constants::Network;
use crate::encoding::{read_varint, write_varint, EncodingError};
use crate::payout::PayoutEntry;

/// Tag bytes identifying the share-commitment OP_RETURN payload ("p2pl").
pub const SHARE_COMMITMENT_TAG: [u8; 4] = [0x70, 0x32, 0x70, 0x6c];

/// ASCII marker appended to the scriptSig after the extranonce region.
const POOL_SIGNATURE: &[u8] = b"/peerpool/";

/// Bitcoin consensus bounds on the coinbase scriptSig.
const MAX_SCRIPT_SIG_LEN: usize = 100;

#[derive(Debug, Error)]
pub enum CoinbaseError {
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("address error: {0}")]
    Address(#[from] AddressError),

    #[error("invalid witness commitment hex: {0}")]
    WitnessCommitment(#[from] hex::FromHexError),

    #[error("coinbase scriptSig would be {0} bytes, max {MAX_SCRIPT_SIG_LEN}")]
    ScriptSigTooLarge(usize),

    #[error("coinbase transaction truncated at {0}")]
    Truncated(&'static str),

    #[error("expected exactly 1 input, got {0}")]
    InputCount(u64),

    #[error("no share commitment output found")]
    MissingCommitment,

    #[error("miner address {0:?} not present in coinbase outputs with a nonzero amount")]
    MinerNotPaid(String),
}

/// A parsed coinbase output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinbaseOutput {
    pub value: u64,
    pub script: Vec<u8>,
}

// =============================================================================
// Share Commitment
// =============================================================================

/// Build the OP_RETURN script committing to the parent share hash.
pub fn build_share_commitment(prev_share_hash: &[u8; 32]) -> Vec<u8> {
    let mut script = Vec::with_capacity(38);
    script.push(0x6a); // OP_RETURN
    script.push(0x24); // push 36 bytes
    script.extend_from_slice(&SHARE_COMMITMENT_TAG);
    script.extend_from_slice(prev_share_hash);
    script
}

/// Extract the committed parent share hash from a serialized coinbase.
pub fn extract_share_commitment(coinbase_tx: &[u8]) -> Result<[u8; 32], CoinbaseError> {
    for output in parse_coinbase_outputs(coinbase_tx)? {
        let s = &output.script;
        if s.len() == 38 && s[0] == 0x6a && s[1] == 0x24 && s[2..6] == SHARE_COMMITMENT_TAG {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&s[6..38]);
            return Ok(hash);
        }
    }
    Err(CoinbaseError::MissingCommitment)
}

// =============================================================================
// Builder
// =============================================================================

/// Builds pool coinbase transactions for a given network.
#[derive(Debug, Clone, Copy)]
pub struct CoinbaseBuilder {
    network: Network,
}

impl CoinbaseBuilder {
    pub fn new(network: Network) -> Self {
        Self { network }
    }

    /// Build the non-witness coinbase transaction.
    ///
    /// Returns the serialized bytes and the offset of the zeroed
    /// `extranonce_size`-byte region inside them. The non-witness form is
    /// what the merkle tree hashes; wrap with [`add_coinbase_witness`]
    /// before submitting the full block.
    pub fn build(
        &self,
        height: i64,
        share_commitment_script: &[u8],
        payouts: &[PayoutEntry],
        witness_commitment_hex: &str,
        extranonce_size: usize,
    ) -> Result<(Vec<u8>, usize), CoinbaseError> {
        // scriptSig: BIP34 height push, pushed extranonce placeholder, tag.
        let height_push = encode_bip34_height(height);
        let mut script_sig = height_push.clone();
        script_sig.push(extranonce_size as u8);
        script_sig.extend_from_slice(&vec![0u8; extranonce_size]);
        script_sig.extend_from_slice(POOL_SIGNATURE);

        if script_sig.len() > MAX_SCRIPT_SIG_LEN {
            return Err(CoinbaseError::ScriptSigTooLarge(script_sig.len()));
        }

        let mut tx = Vec::with_capacity(256 + payouts.len() * 43);

        // Version
        tx.extend_from_slice(&2i32.to_le_bytes());

        // One input: null prevout, max index.
        tx.extend_from_slice(&write_varint(1));
        tx.extend_from_slice(&[0u8; 32]);
        tx.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
        tx.extend_from_slice(&write_varint(script_sig.len() as u64));

        // The extranonce zeros sit after the height push and its own push
        // opcode, measured from the start of the whole transaction.
        let extranonce_offset = tx.len() + height_push.len() + 1;

        tx.extend_from_slice(&script_sig);
        tx.extend_from_slice(&0xffff_ffffu32.to_le_bytes()); // sequence

        // Outputs: payouts, then witness commitment, then share commitment.
        let witness_script = if witness_commitment_hex.is_empty() {
            Vec::new()
        } else {
            hex::decode(witness_commitment_hex)?
        };
        let mut output_count = payouts.len() + 1;
        if !witness_script.is_empty() {
            output_count += 1;
        }
        tx.extend_from_slice(&write_varint(output_count as u64));

        for payout in payouts {
            let script = script_pubkey(&payout.address, self.network)?;
            tx.extend_from_slice(&payout.amount.to_le_bytes());
            tx.extend_from_slice(&write_varint(script.len() as u64));
            tx.extend_from_slice(&script);
        }

        if !witness_script.is_empty() {
            tx.extend_from_slice(&0u64.to_le_bytes());
            tx.extend_from_slice(&write_varint(witness_script.len() as u64));
            tx.extend_from_slice(&witness_script);
        }

        tx.extend_from_slice(&0u64.to_le_bytes());
        tx.extend_from_slice(&write_varint(share_commitment_script.len() as u64));
        tx.extend_from_slice(share_commitment_script);

        // Locktime
        tx.extend_from_slice(&0u32.to_le_bytes());

        Ok((tx, extranonce_offset))
    }
}

/// Wrap a non-witness coinbase with the SegWit marker, flag, and the single
/// all-zero 32-byte witness reserved value required next to a witness
/// commitment. This is the form submitted to the full node.
pub fn add_coinbase_witness(nonwitness: &[u8]) -> Vec<u8> {
    let body = &nonwitness[4..nonwitness.len() - 4];
    let locktime = &nonwitness[nonwitness.len() - 4..];

    let mut tx = Vec::with_capacity(nonwitness.len() + 2 + 34);
    tx.extend_from_slice(&nonwitness[0..4]);
    tx.push(0x00); // marker
    tx.push(0x01); // flag
    tx.extend_from_slice(body);
    tx.push(0x01); // one witness stack item
    tx.push(0x20); // 32 bytes
    tx.extend_from_slice(&[0u8; 32]); // witness reserved value
    tx.extend_from_slice(locktime);
    tx
}

/// Parse the outputs of a serialized non-witness coinbase transaction.
pub fn parse_coinbase_outputs(tx: &[u8]) -> Result<Vec<CoinbaseOutput>, CoinbaseError> {
    let mut pos = 4; // version
    let rest = tx.get(pos..).ok_or(CoinbaseError::Truncated("version"))?;

    let (input_count, n) = read_varint(rest)?;
    if input_count != 1 {
        return Err(CoinbaseError::InputCount(input_count));
    }
    pos += n + 36; // prevout hash + index

    let (script_len, n) = read_varint(tx.get(pos..).ok_or(CoinbaseError::Truncated("scriptSig"))?)?;
    pos += n + script_len as usize + 4; // scriptSig + sequence

    let (output_count, n) =
        read_varint(tx.get(pos..).ok_or(CoinbaseError::Truncated("output count"))?)?;
    pos += n;

    let mut outputs = Vec::with_capacity(output_count as usize);
    for _ in 0..output_count {
        let value_bytes = tx
            .get(pos..pos + 8)
            .ok_or(CoinbaseError::Truncated("output value"))?;
        let value = u64::from_le_bytes(value_bytes.try_into().unwrap());
        pos += 8;

        let (script_len, n) =
            read_varint(tx.get(pos..).ok_or(CoinbaseError::Truncated("output script"))?)?;
        pos += n;
        let script = tx
            .get(pos..pos + script_len as usize)
            .ok_or(CoinbaseError::Truncated("output script"))?
            .to_vec();
        pos += script_len as usize;

        outputs.push(CoinbaseOutput { value, script });
    }

    Ok(outputs)
}

/// Check that the coinbase pays the miner's own address a nonzero amount.
pub fn validate_miner_in_outputs(
    outputs: &[CoinbaseOutput],
    miner_address: &str,
    network: Network,
) -> Result<(), CoinbaseError> {
    let script = script_pubkey(miner_address, network)?;
    if outputs.iter().any(|o| o.script == script && o.value > 0) {
        Ok(())
    } else {
        Err(CoinbaseError::MinerNotPaid(miner_address.to_string()))
    }
}

/// BIP34 height push, encoded exactly as Bitcoin Core's `CScript() << height`.
pub fn encode_bip34_height(height: i64) -> Vec<u8> {
    match height {
        0 => vec![0x00],                    // OP_0
        1..=16 => vec![0x50 + height as u8], // OP_1..OP_16
        _ => {
            let mut num = Vec::new();
            let mut v = height as u64;
            while v > 0 {
                num.push((v & 0xff) as u8);
                v >>= 8;
            }
            // CScriptNum: pad so the sign bit stays clear.
            if num.last().is_some_and(|b| b & 0x80 != 0) {
                num.push(0x00);
            }
            let mut out = Vec::with_capacity(num.len() + 1);
            out.push(num.len() as u8);
            out.extend_from_slice(&num);
            out
        }
    }
}
