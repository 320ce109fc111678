//! Process-wide Prometheus metrics. Registered once at startup, read-only
//! thereafter.

use once_cell::sync::Lazy;
use prometheus::{
    register_gauge, register_int_counter, register_int_counter_vec, register_int_gauge, Encoder,
    Gauge, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

pub static SHARECHAIN_HEIGHT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "p2pool_sharechain_height",
        "Number of shares in the sharechain"
    )
    .unwrap()
});

pub static MINERS_CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "p2pool_miners_connected",
        "Number of active stratum miner sessions"
    )
    .unwrap()
});

pub static PEERS_CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("p2pool_peers_connected", "Number of connected P2P peers").unwrap()
});

pub static SHARE_DIFFICULTY: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("p2pool_share_difficulty", "Current sharechain difficulty").unwrap()
});

pub static BLOCKS_FOUND: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "p2pool_blocks_found_total",
        "Total Bitcoin blocks found by the pool"
    )
    .unwrap()
});

pub static SHARES_ACCEPTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "p2pool_stratum_shares_accepted_total",
        "Total valid stratum shares accepted"
    )
    .unwrap()
});

pub static SHARES_REJECTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "p2pool_stratum_shares_rejected_total",
        "Total stratum shares rejected"
    )
    .unwrap()
});

pub static REORGS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("p2pool_reorgs_total", "Total sharechain reorgs observed").unwrap()
});

pub static BLOCK_SUBMISSIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "p2pool_block_submissions_total",
        "Block submission attempts by result",
        &["result"]
    )
    .unwrap()
});

/// Render the default registry in Prometheus text exposition format.
pub fn gather() -> String {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
