//! The PPLNS sliding window and per-share weights.

use std::collections::HashMap;

use num_bigint::BigUint;
use num_traits::{One, Zero};
use peerpool_types::Share;

/// A window of recent shares, newest first.
pub struct Window {
    shares: Vec<Share>,
    max_target: BigUint,
}

impl Window {
    pub fn new(shares: Vec<Share>, max_target: BigUint) -> Self {
        Self { shares, max_target }
    }

    /// Weight of a single share: `max_target / share_target`, i.e. the
    /// share's difficulty. Shares with a missing (zero) target count as 1.
    pub fn share_weight(&self, share: &Share) -> BigUint {
        if share.share_target.is_zero() {
            return BigUint::one();
        }
        &self.max_target / &share.share_target
    }

    /// Total weight per miner address.
    pub fn miner_weights(&self) -> HashMap<String, BigUint> {
        let mut weights: HashMap<String, BigUint> = HashMap::new();
        for share in &self.shares {
            let weight = self.share_weight(share);
            *weights
                .entry(share.miner_address.clone())
                .or_insert_with(BigUint::zero) += weight;
        }
        weights
    }

    /// Sum of all share weights in the window.
    pub fn total_weight(&self) -> BigUint {
        self.shares
            .iter()
            .map(|s| self.share_weight(s))
            .sum()
    }

    pub fn share_count(&self) -> usize {
        self.shares.len()
    }

    pub fn max_target(&self) -> &BigUint {
        &self.max_target
    }
}
