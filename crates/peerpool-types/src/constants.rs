//! Network selection and sharechain-wide constants.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::hash::compact_to_target;

// =============================================================================
// Network Types
// =============================================================================

/// Bitcoin network the pool runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    /// Map to the `bitcoin` crate's network type (address parsing).
    pub fn to_bitcoin(self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }
}

impl std::str::FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network {other:?}")),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
            Network::Regtest => write!(f, "regtest"),
        }
    }
}

// =============================================================================
// Sharechain Constants
// =============================================================================

/// Current sharechain share format version.
pub const SHARE_VERSION: u32 = 1;

/// Compact bits of the hardest allowed share target (Bitcoin difficulty 1).
pub const MIN_SHARE_TARGET_BITS: u32 = 0x1d00ffff;

/// Compact bits of the easiest allowed share target. Regtest-style so CPU
/// miners can produce shares on a cold-started chain.
pub const MAX_SHARE_TARGET_BITS: u32 = 0x207fffff;

/// Target interval between shares, in seconds.
pub const TARGET_SHARE_INTERVAL_SECS: u64 = 30;

/// Number of shares the difficulty retarget looks back over.
pub const DIFFICULTY_ADJUSTMENT_WINDOW: usize = 72;

/// Default PPLNS payout window (same ancestor walk as the retarget window).
pub const DEFAULT_PPLNS_WINDOW: usize = 72;

/// Maximum accepted serialized coinbase transaction size. Consensus allows
/// far more, but a legitimate pool coinbase stays well under 1 KiB.
pub const MAX_COINBASE_TX_SIZE: usize = 100 * 1024;

/// Maximum accepted miner address length. Bech32m tops out around 90 chars.
pub const MAX_MINER_ADDRESS_LEN: usize = 128;

/// Hardest allowed share target as a big integer.
pub fn min_share_target() -> BigUint {
    compact_to_target(MIN_SHARE_TARGET_BITS)
}

/// Easiest allowed share target as a big integer.
pub fn max_share_target() -> BigUint {
    compact_to_target(MAX_SHARE_TARGET_BITS)
}
