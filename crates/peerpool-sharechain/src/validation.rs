//! Structural and consensus validation of incoming shares.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use num_bigint::BigUint;
use thiserror::Error;

use peerpool_types::address::validate_address;
use peerpool_types::coinbase::{
    extract_share_commitment, parse_coinbase_outputs, validate_miner_in_outputs,
};
use peerpool_types::constants::{
    Network, MAX_COINBASE_TX_SIZE, MAX_MINER_ADDRESS_LEN, SHARE_VERSION,
};
use peerpool_types::hash::target_to_compact;
use peerpool_types::Share;

use crate::store::ShareStore;

/// Maximum a share timestamp may run ahead of our clock.
const MAX_TIME_FUTURE_SECS: u64 = 2 * 60;

/// Maximum a share timestamp may lag behind its parent.
const MAX_TIME_PAST_SECS: u64 = 10 * 60;

#[derive(Debug, Error)]
#[error("share validation failed: {reason}")]
pub struct ValidationError {
    pub reason: String,
}

impl ValidationError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Computes the consensus-expected target for a share given its parent hash.
pub type TargetFn = Arc<dyn Fn(&[u8; 32]) -> BigUint + Send + Sync>;

/// Validates incoming shares against the store and the retarget rule.
pub struct Validator {
    store: Arc<ShareStore>,
    target_fn: TargetFn,
    network: Network,
}

impl Validator {
    pub fn new(store: Arc<ShareStore>, target_fn: TargetFn, network: Network) -> Self {
        Self {
            store,
            target_fn,
            network,
        }
    }

    /// Run every validation check, failing on the first violation.
    pub fn validate_share(&self, share: &Share) -> Result<(), ValidationError> {
        // 1. Share format version.
        if share.share_version != SHARE_VERSION {
            return Err(ValidationError::new(format!(
                "unsupported share version {}, expected {SHARE_VERSION}",
                share.share_version
            )));
        }

        // 2. Size caps, before any expensive work.
        if share.miner_address.len() > MAX_MINER_ADDRESS_LEN {
            return Err(ValidationError::new(format!(
                "miner address too long: {} bytes",
                share.miner_address.len()
            )));
        }
        if share.coinbase_tx.len() > MAX_COINBASE_TX_SIZE {
            return Err(ValidationError::new(format!(
                "coinbase tx too large: {} bytes",
                share.coinbase_tx.len()
            )));
        }

        // 3. Miner address must be well-formed for our network.
        if share.miner_address.is_empty() {
            return Err(ValidationError::new("missing miner address"));
        }
        if let Err(e) = validate_address(&share.miner_address, self.network) {
            return Err(ValidationError::new(format!("invalid miner address: {e}")));
        }

        // 4. Parent must exist unless this is genesis.
        if !share.is_genesis() {
            match self.store.has(&share.prev_share_hash) {
                Ok(true) => {}
                Ok(false) => {
                    return Err(ValidationError::new(format!(
                        "parent share {} not found",
                        hex::encode(&share.prev_share_hash[..8])
                    )))
                }
                Err(e) => return Err(ValidationError::new(format!("store error: {e}"))),
            }
        }

        // 5. Timestamp window.
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let share_time = share.header.timestamp as u64;

        if share_time > now + MAX_TIME_FUTURE_SECS {
            return Err(ValidationError::new(format!(
                "share timestamp {share_time} is too far in the future"
            )));
        }

        if !share.is_genesis() {
            if let Ok(Some(parent)) = self.store.get(&share.prev_share_hash) {
                let parent_time = parent.header.timestamp as u64;
                if share_time + MAX_TIME_PAST_SECS < parent_time {
                    return Err(ValidationError::new(
                        "share timestamp is too far behind parent",
                    ));
                }
            }
        }

        // 6. Proof of work against the consensus-computed target.
        let expected_target = (self.target_fn)(&share.prev_share_hash);
        if !share.meets_target(&expected_target) {
            return Err(ValidationError::new("share does not meet required target"));
        }

        // 7. The declared target must agree with consensus, compared in
        //    compact form since that is how targets travel on the wire.
        let declared_bits = target_to_compact(&share.share_target);
        let expected_bits = target_to_compact(&expected_target);
        if declared_bits != expected_bits {
            return Err(ValidationError::new(format!(
                "share target mismatch: declared bits 0x{declared_bits:08x}, expected 0x{expected_bits:08x}"
            )));
        }

        // 8 + 9. Coinbase commitment and miner payout.
        if share.coinbase_tx.is_empty() {
            return Err(ValidationError::new("missing coinbase transaction"));
        }
        let committed = extract_share_commitment(&share.coinbase_tx)
            .map_err(|e| ValidationError::new(format!("coinbase commitment extraction failed: {e}")))?;
        if committed != share.prev_share_hash {
            return Err(ValidationError::new(format!(
                "coinbase commitment {} does not match previous share hash {}",
                hex::encode(&committed[..8]),
                hex::encode(&share.prev_share_hash[..8])
            )));
        }

        let outputs = parse_coinbase_outputs(&share.coinbase_tx)
            .map_err(|e| ValidationError::new(format!("coinbase output parsing failed: {e}")))?;
        validate_miner_in_outputs(&outputs, &share.miner_address, self.network)
            .map_err(|e| ValidationError::new(format!("miner not in coinbase outputs: {e}")))?;

        // nBits is deliberately not validated: the sharechain cannot know
        // which Bitcoin template the miner was working from. Only the share
        // hash vs. the sharechain target matters here.

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;
    use num_traits::One;
    use peerpool_types::coinbase::{build_share_commitment, CoinbaseBuilder};
    use peerpool_types::hash::compact_to_target;
    use peerpool_types::{PayoutEntry, ShareHeader};

    const MINER1: &str = "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx";

    fn easy_target() -> BigUint {
        (BigUint::one() << 256u32) - 1u8
    }

    fn now_ts() -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as u32
    }

    fn coinbase_for(prev: &[u8; 32]) -> Vec<u8> {
        let builder = CoinbaseBuilder::new(Network::Testnet);
        let commitment = build_share_commitment(prev);
        let (tx, _) = builder
            .build(
                100,
                &commitment,
                &[PayoutEntry::new(MINER1, 5_000_000_000)],
                "",
                8,
            )
            .unwrap();
        tx
    }

    fn valid_share(prev: [u8; 32]) -> Share {
        Share::new(
            ShareHeader {
                version: 0x2000_0000,
                prev_block_hash: [0u8; 32],
                merkle_root: [0u8; 32],
                timestamp: now_ts(),
                bits: 0x1d00ffff,
                nonce: 42,
            },
            1,
            prev,
            easy_target(),
            MINER1.to_string(),
            coinbase_for(&prev),
        )
    }

    fn validator(store: Arc<ShareStore>) -> Validator {
        let target = easy_target();
        Validator::new(
            store,
            Arc::new(move |_| target.clone()),
            Network::Testnet,
        )
    }

    #[test]
    fn test_valid_genesis_share() {
        let store = Arc::new(ShareStore::open_in_memory().unwrap());
        let v = validator(store);
        v.validate_share(&valid_share([0u8; 32])).unwrap();
    }

    #[test]
    fn test_rejects_wrong_version() {
        let store = Arc::new(ShareStore::open_in_memory().unwrap());
        let v = validator(store);
        let mut share = valid_share([0u8; 32]);
        share.share_version = 2;
        let err = v.validate_share(&share).unwrap_err();
        assert!(err.reason.contains("version"));
    }

    #[test]
    fn test_rejects_oversized_fields() {
        let store = Arc::new(ShareStore::open_in_memory().unwrap());
        let v = validator(store);

        let mut share = valid_share([0u8; 32]);
        share.miner_address = "x".repeat(MAX_MINER_ADDRESS_LEN + 1);
        assert!(v.validate_share(&share).is_err());

        let mut share = valid_share([0u8; 32]);
        share.coinbase_tx = vec![0u8; MAX_COINBASE_TX_SIZE + 1];
        assert!(v.validate_share(&share).is_err());
    }

    #[test]
    fn test_rejects_bad_address() {
        let store = Arc::new(ShareStore::open_in_memory().unwrap());
        let v = validator(store);

        let mut share = valid_share([0u8; 32]);
        share.miner_address = String::new();
        assert!(v.validate_share(&share).is_err());

        let mut share = valid_share([0u8; 32]);
        share.miner_address = "notbech32".to_string();
        assert!(v.validate_share(&share).is_err());
    }

    #[test]
    fn test_rejects_unknown_parent() {
        let store = Arc::new(ShareStore::open_in_memory().unwrap());
        let v = validator(store);
        let share = valid_share([0x55; 32]);
        let err = v.validate_share(&share).unwrap_err();
        assert!(err.reason.contains("not found"));
    }

    #[test]
    fn test_rejects_future_timestamp() {
        let store = Arc::new(ShareStore::open_in_memory().unwrap());
        let v = validator(store);
        let mut share = valid_share([0u8; 32]);
        share.header.timestamp = now_ts() + 10 * 60;
        let err = v.validate_share(&share).unwrap_err();
        assert!(err.reason.contains("future"));
    }

    #[test]
    fn test_rejects_timestamp_behind_parent() {
        let store = Arc::new(ShareStore::open_in_memory().unwrap());

        let parent = valid_share([0u8; 32]);
        store.add(&parent).unwrap();

        let v = validator(store);
        let mut child = valid_share(parent.hash());
        child.coinbase_tx = coinbase_for(&parent.hash());
        child.header.timestamp = parent.header.timestamp - 11 * 60;
        let err = v.validate_share(&child).unwrap_err();
        assert!(err.reason.contains("behind parent"));
    }

    #[test]
    fn test_rejects_pow_failure() {
        let store = Arc::new(ShareStore::open_in_memory().unwrap());
        // Impossible target: nothing meets zero.
        let v = Validator::new(
            store,
            Arc::new(|_| BigUint::default()),
            Network::Testnet,
        );
        let share = valid_share([0u8; 32]);
        let err = v.validate_share(&share).unwrap_err();
        assert!(err.reason.contains("does not meet"));
    }

    #[test]
    fn test_rejects_declared_target_mismatch() {
        let store = Arc::new(ShareStore::open_in_memory().unwrap());
        let v = validator(store);
        let mut share = valid_share([0u8; 32]);
        share.share_target = compact_to_target(0x1d00ffff);
        let err = v.validate_share(&share).unwrap_err();
        assert!(err.reason.contains("target mismatch"));
    }

    #[test]
    fn test_rejects_wrong_commitment() {
        let store = Arc::new(ShareStore::open_in_memory().unwrap());
        let v = validator(store);
        let mut share = valid_share([0u8; 32]);
        // Coinbase commits to a different parent.
        share.coinbase_tx = coinbase_for(&[0x77; 32]);
        let err = v.validate_share(&share).unwrap_err();
        assert!(err.reason.contains("commitment"));
    }

    #[test]
    fn test_rejects_missing_coinbase() {
        let store = Arc::new(ShareStore::open_in_memory().unwrap());
        let v = validator(store);
        let mut share = valid_share([0u8; 32]);
        share.coinbase_tx = Vec::new();
        let err = v.validate_share(&share).unwrap_err();
        assert!(err.reason.contains("missing coinbase"));
    }

    #[test]
    fn test_rejects_miner_not_paid() {
        let store = Arc::new(ShareStore::open_in_memory().unwrap());
        let v = validator(store);
        let mut share = valid_share([0u8; 32]);
        // Valid address, but the coinbase pays MINER1.
        share.miner_address =
            "tb1qqqqqp399et2xygdj5xreqhjjvcmzhxw4aywxecjdzew6hylgvsesrxh6hy".to_string();
        let err = v.validate_share(&share).unwrap_err();
        assert!(err.reason.contains("not in coinbase outputs"));
    }
}
