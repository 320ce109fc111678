//! Command-line configuration.

use std::path::PathBuf;

use clap::Parser;

use peerpool_types::Network;

/// A decentralized Bitcoin mining pool node.
#[derive(Debug, Clone, Parser)]
#[command(name = "peerpool", version, about)]
pub struct Config {
    /// P2P listen port.
    #[arg(long, default_value_t = 38333)]
    pub listen_port: u16,

    /// Stratum listen address.
    #[arg(long, default_value = "0.0.0.0:3333")]
    pub stratum_addr: String,

    /// Bitcoin Core JSON-RPC URL.
    #[arg(long, default_value = "http://127.0.0.1:18332")]
    pub rpc_url: String,

    /// Bitcoin Core RPC username.
    #[arg(long, default_value = "")]
    pub rpc_user: String,

    /// Bitcoin Core RPC password.
    #[arg(long, default_value = "")]
    pub rpc_password: String,

    /// Data directory (share database, identity key).
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// Bootstrap peer addresses for initial sync.
    #[arg(long)]
    pub bootnodes: Vec<String>,

    /// Enable mDNS local peer discovery (handled by the transport layer).
    #[arg(long, default_value_t = true)]
    pub mdns: bool,

    /// Initial Stratum session difficulty.
    #[arg(long, default_value_t = 1.0)]
    pub initial_difficulty: f64,

    /// Bitcoin network.
    #[arg(long, default_value = "testnet")]
    pub network: Network,

    /// Prometheus metrics listen address.
    #[arg(long, default_value = "127.0.0.1:9090")]
    pub metrics_addr: String,

    /// Fallback payout address: receives the whole reward while the
    /// sharechain window is empty, and the finder fee for jobs built by
    /// this node.
    #[arg(long)]
    pub pool_address: String,

    /// PPLNS payout window size, in shares.
    #[arg(long, default_value_t = 72)]
    pub pplns_window: usize,

    /// Finder fee, percent of the block reward.
    #[arg(long, default_value_t = 0.5)]
    pub finder_fee_percent: f64,

    /// Dust threshold for payout consolidation, satoshis.
    #[arg(long, default_value_t = 546)]
    pub dust_threshold: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_parse() {
        let config = Config::parse_from([
            "peerpool",
            "--pool-address",
            "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx",
        ]);
        assert_eq!(config.listen_port, 38333);
        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.pplns_window, 72);
        assert!(config.bootnodes.is_empty());
    }

    #[test]
    fn test_network_flag() {
        let config = Config::parse_from([
            "peerpool",
            "--pool-address",
            "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080",
            "--network",
            "regtest",
            "--bootnodes",
            "10.0.0.1:38333",
            "--bootnodes",
            "10.0.0.2:38333",
        ]);
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.bootnodes.len(), 2);
    }
}
