//! Miner address validation and output script derivation.
//!
//! Parsing and network checking are delegated to the `bitcoin` crate; the
//! rest of the byte-level Bitcoin plumbing in this workspace stays in-repo.

use std::str::FromStr;

use bitcoin::Address;
use thiserror::Error;

use crate::constants::Network;

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("empty address")]
    Empty,

    #[error("invalid address {address:?}: {reason}")]
    Invalid { address: String, reason: String },

    #[error("address {address:?} is not valid for {network}")]
    WrongNetwork { address: String, network: Network },
}

/// Check that an address parses and belongs to the configured network.
pub fn validate_address(address: &str, network: Network) -> Result<(), AddressError> {
    script_pubkey(address, network).map(|_| ())
}

/// Derive the scriptPubKey paying to the given address.
pub fn script_pubkey(address: &str, network: Network) -> Result<Vec<u8>, AddressError> {
    if address.is_empty() {
        return Err(AddressError::Empty);
    }

    let parsed = Address::from_str(address).map_err(|e| AddressError::Invalid {
        address: address.to_string(),
        reason: e.to_string(),
    })?;

    let checked = parsed
        .require_network(network.to_bitcoin())
        .map_err(|_| AddressError::WrongNetwork {
            address: address.to_string(),
            network,
        })?;

    Ok(checked.script_pubkey().to_bytes())
}
