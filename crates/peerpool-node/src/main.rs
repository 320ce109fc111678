//! The peerpool daemon.

mod config;
mod metrics;
mod orchestrator;
mod p2p_tasks;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use peerpool_p2p::gossip::{GossipPump, INCOMING_SHARE_BUFFER};
use peerpool_p2p::identity::{load_or_create_identity, IdentityError};
use peerpool_p2p::{PeerId, PeerNotifier};
use peerpool_rpc::{BitcoinRpc, RpcClient, RpcConfig};
use peerpool_sharechain::{ShareStore, Sharechain, SharechainConfig, StoreError};
use peerpool_stratum::mux::serve_http_once;
use peerpool_stratum::{StratumServer, StratumServerConfig};
use peerpool_types::address::{validate_address, AddressError};
use peerpool_types::constants::TARGET_SHARE_INTERVAL_SECS;
use peerpool_types::PayoutEntry;
use peerpool_work::{Generator, GeneratorConfig};

use config::Config;
use orchestrator::{Orchestrator, OrchestratorInputs};

#[derive(Debug, Error)]
enum StartupError {
    #[error("create data dir: {0}")]
    DataDir(#[from] std::io::Error),

    #[error("identity: {0}")]
    Identity(#[from] IdentityError),

    #[error("share store: {0}")]
    Store(#[from] StoreError),

    #[error("invalid pool address: {0}")]
    PoolAddress(#[from] AddressError),

    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

#[tokio::main]
async fn main() {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(config).await {
        error!(error = %e, "startup failed");
        std::process::exit(1);
    }
}

async fn bind(addr: &str) -> Result<TcpListener, StartupError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: addr.to_string(),
            source,
        })
}

async fn run(config: Config) -> Result<(), StartupError> {
    info!(network = %config.network, "peerpool starting");

    validate_address(&config.pool_address, config.network)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let identity = load_or_create_identity(&config.data_dir)?;
    let peer_id = PeerId(hex::encode(identity.verifying_key().to_bytes()));
    info!(peer_id = %peer_id, "node identity loaded");

    let store = Arc::new(ShareStore::open(config.data_dir.join("shares.db"))?);
    let chain = Arc::new(Sharechain::new(
        Arc::clone(&store),
        SharechainConfig {
            network: config.network,
            target_share_interval: Duration::from_secs(TARGET_SHARE_INTERVAL_SECS),
            pplns_window: config.pplns_window,
            finder_fee_percent: config.finder_fee_percent,
            dust_threshold_sats: config.dust_threshold,
        },
    )?);
    let chain_events = chain.subscribe().expect("fresh engine has an event stream");
    info!(shares = chain.share_count().unwrap_or(0), "sharechain open");

    // Bitcoin RPC client plus a reachability probe; an unreachable node is
    // survivable (the poller backs off), just loud.
    let rpc = Arc::new(RpcClient::with_config(RpcConfig {
        url: config.rpc_url.clone(),
        username: (!config.rpc_user.is_empty()).then(|| config.rpc_user.clone()),
        password: (!config.rpc_password.is_empty()).then(|| config.rpc_password.clone()),
        timeout: Duration::from_secs(30),
    }));
    match rpc.get_block_count().await {
        Ok(height) => info!(height, "bitcoind reachable"),
        Err(e) => warn!(error = %e, "bitcoind not reachable yet"),
    }

    // Listeners up front so a taken port fails startup, not steady state.
    let stratum_listener = bind(&config.stratum_addr).await?;
    let sync_listener = bind(&format!("0.0.0.0:{}", config.listen_port)).await?;
    let metrics_listener = bind(&config.metrics_addr).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Work generator, fed by payout and tip snapshots from the engine.
    let finder_address = Arc::new(RwLock::new(config.pool_address.clone()));
    let (generator, job_rx) = {
        let payouts_chain = Arc::clone(&chain);
        let payouts_finder = Arc::clone(&finder_address);
        let tip_chain = Arc::clone(&chain);
        Generator::new(
            Arc::clone(&rpc),
            GeneratorConfig {
                network: config.network,
                extranonce_size: 8,
            },
            Arc::new(move |coinbase_value| {
                let finder = payouts_finder.read().unwrap().clone();
                let payouts = payouts_chain.pplns_payouts(coinbase_value, &finder);
                if payouts.is_empty() {
                    // Empty window: the whole reward goes to the fallback
                    // address so the coinbase always pays someone.
                    vec![PayoutEntry::new(finder, coinbase_value.max(0) as u64)]
                } else {
                    payouts
                }
            }),
            Arc::new(move || tip_chain.current_tip_hash().unwrap_or_default()),
        )
    };
    if let Err(e) = generator.fetch_template().await {
        warn!(error = %e, "initial template fetch failed, poller will retry");
    }
    tokio::spawn(Arc::clone(&generator).run(shutdown_rx.clone()));

    // Stratum server with a small HTTP status page on the same port.
    let (stratum, submit_rx) = StratumServer::new(StratumServerConfig {
        initial_difficulty: config.initial_difficulty,
        extranonce2_size: 4,
    });
    let status_chain = Arc::clone(&chain);
    let status_body: Arc<dyn Fn() -> String + Send + Sync> = Arc::new(move || {
        serde_json::json!({
            "sharechain_height": status_chain.share_count().unwrap_or(0),
            "tip": status_chain
                .current_tip_hash()
                .map(|h| peerpool_types::hash::hash_to_hex(&h)),
        })
        .to_string()
    });
    tokio::spawn(Arc::clone(&stratum).serve(stratum_listener, Some(status_body)));

    // P2P plumbing: shared ingress for gossip and sync, connection pump,
    // sync server and dialer over TCP streams.
    let (p2p_shares_tx, p2p_shares_rx) = mpsc::channel(INCOMING_SHARE_BUFFER);
    let _gossip_pump = GossipPump::with_sender(peer_id.clone(), p2p_shares_tx.clone());
    let (peer_notifier, peer_rx) = PeerNotifier::new();
    let (broadcast_tx, broadcast_rx) = mpsc::channel(64);
    let (sync_req_tx, sync_req_rx) = mpsc::channel(16);

    tokio::spawn(p2p_tasks::serve_sync(
        sync_listener,
        p2p_tasks::chain_sync_handler(Arc::clone(&chain)),
        shutdown_rx.clone(),
    ));
    tokio::spawn(p2p_tasks::run_sync_dialer(
        sync_req_rx,
        Arc::clone(&chain),
        p2p_shares_tx,
    ));
    tokio::spawn(p2p_tasks::run_gossip_egress(broadcast_rx));

    // Metrics exposition.
    tokio::spawn(async move {
        loop {
            match metrics_listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(async move {
                        let _ = serve_http_once(
                            stream,
                            200,
                            "text/plain; version=0.0.4",
                            &metrics::gather(),
                        )
                        .await;
                    });
                }
                Err(e) => warn!(error = %e, "metrics accept failed"),
            }
        }
    });

    // Session gauge refresher.
    {
        let stratum = Arc::clone(&stratum);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(15));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        metrics::MINERS_CONNECTED.set(stratum.session_count() as i64);
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    // Seed initial sync rounds from the configured bootnodes.
    for bootnode in &config.bootnodes {
        peer_notifier.on_connected(PeerId(bootnode.clone()));
    }

    let orchestrator = Orchestrator::new(
        Arc::clone(&chain),
        generator,
        rpc,
        stratum,
        broadcast_tx,
        sync_req_tx,
        finder_address,
    );
    let inputs = OrchestratorInputs {
        jobs: job_rx,
        submissions: submit_rx,
        p2p_shares: p2p_shares_rx,
        peer_connected: peer_rx,
        chain_events,
    };

    tokio::select! {
        _ = orchestrator.run(inputs, shutdown_rx) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    }

    info!("peerpool stopped");
    Ok(())
}
