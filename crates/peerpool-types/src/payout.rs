//! Coinbase payout entries.

use serde::{Deserialize, Serialize};

/// A single output in the pool coinbase transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutEntry {
    /// Miner payout address (bech32).
    pub address: String,
    /// Amount in satoshis.
    pub amount: u64,
}

impl PayoutEntry {
    pub fn new(address: impl Into<String>, amount: u64) -> Self {
        Self {
            address: address.into(),
            amount,
        }
    }
}
