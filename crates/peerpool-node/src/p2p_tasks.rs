//! Long-lived P2P tasks: the sync protocol server, the outbound sync
//! dialer, and the gossip egress drain.
//!
//! The sync protocol runs over plain TCP streams here; a richer transport
//! (encryption, multiplexing, pubsub, discovery) can bind the same
//! handlers without touching the protocol logic.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use peerpool_p2p::messages::ShareMsg;
use peerpool_p2p::sync::{request_locator, serve_sync_stream, SyncError, SyncHandler};
use peerpool_sharechain::Sharechain;

use crate::orchestrator::SyncRequest;

/// Upper bound on chained sync rounds against one peer.
const MAX_SYNC_ROUNDS: usize = 1000;

/// Pause between chained rounds so the orchestrator can append the previous
/// batch before the locator is recomputed.
const ROUND_SETTLE_DELAY: Duration = Duration::from_millis(200);

/// Build the server-side sync handler over the sharechain engine.
pub fn chain_sync_handler(chain: Arc<Sharechain>) -> SyncHandler {
    Arc::new(move |req| {
        match chain.shares_after(&req.locators, req.max_count as usize) {
            Ok((shares, more)) => peerpool_p2p::ShareLocatorResp {
                shares: shares.iter().map(ShareMsg::from_share).collect(),
                more,
            },
            Err(e) => {
                warn!(error = %e, "sync handler store walk failed");
                peerpool_p2p::ShareLocatorResp::default()
            }
        }
    })
}

/// Accept inbound sync streams until shutdown.
pub async fn serve_sync(
    listener: TcpListener,
    handler: SyncHandler,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(addr = ?listener.local_addr().ok(), "sync protocol listening");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "sync stream accepted");
                        tokio::spawn(serve_sync_stream(stream, Arc::clone(&handler)));
                    }
                    Err(e) => warn!(error = %e, "sync accept failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Fulfill sync rounds requested by the orchestrator: dial the peer, run
/// locator requests until the peer has nothing newer, and feed received
/// shares into the common ingress queue.
pub async fn run_sync_dialer(
    mut requests: mpsc::Receiver<SyncRequest>,
    chain: Arc<Sharechain>,
    shares_tx: mpsc::Sender<ShareMsg>,
) {
    while let Some(request) = requests.recv().await {
        debug!(peer = %request.peer, "starting sync round");
        if let Err(e) = sync_with_peer(&request, &chain, &shares_tx).await {
            debug!(peer = %request.peer, error = %e, "sync round failed");
        }
    }
}

async fn sync_with_peer(
    request: &SyncRequest,
    chain: &Sharechain,
    shares_tx: &mpsc::Sender<ShareMsg>,
) -> Result<(), SyncError> {
    let mut locators = request.locators.clone();
    let mut total = 0usize;

    for _ in 0..MAX_SYNC_ROUNDS {
        let stream = TcpStream::connect(&request.peer.0).await?;
        let resp = request_locator(stream, locators.clone(), request.max_count).await?;

        let received = resp.shares.len();
        total += received;
        for share in resp.shares {
            if shares_tx.send(share).await.is_err() {
                return Ok(());
            }
        }

        if !resp.more || received == 0 {
            break;
        }

        // Let the previous batch land, then continue from the new tip.
        tokio::time::sleep(ROUND_SETTLE_DELAY).await;
        locators = chain.locator().unwrap_or_default();
    }

    if total > 0 {
        info!(peer = %request.peer, shares = total, "sync round complete");
    }
    Ok(())
}

/// Drain gossip egress. This is the attach point for a pubsub transport;
/// until one is bound, shares are counted and dropped.
pub async fn run_gossip_egress(mut broadcast_rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(payload) = broadcast_rx.recv().await {
        debug!(bytes = payload.len(), "share ready for gossip publish");
    }
}
