//! The orchestrator: the single event loop that owns all sharechain
//! mutation. It consumes jobs from the work generator, share submissions
//! from Stratum sessions, shares and peer-connect events from the P2P
//! layer, and chain events from the engine, and cross-wires everything.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use peerpool_p2p::compress::{compress_coinbase, decompress_coinbase};
use peerpool_p2p::gossip::encode_share_for_broadcast;
use peerpool_p2p::sync::MAX_SYNC_BATCH_SIZE;
use peerpool_p2p::{PeerId, ShareMsg};
use peerpool_rpc::{BitcoinRpc, RpcError};
use peerpool_sharechain::chain::AppendError;
use peerpool_sharechain::{ChainEvent, Sharechain, StoreError};
use peerpool_stratum::{JobNotification, ShareSubmission, StratumServer};
use peerpool_types::coinbase::extract_share_commitment;
use peerpool_types::constants::SHARE_VERSION;
use peerpool_types::hash::sha256d;
use peerpool_types::{Share, ShareHeader};
use peerpool_work::template::{
    reconstruct_block, reconstruct_header, verify_merkle_root, Job,
};
use peerpool_work::Generator;

use crate::metrics;

/// BIP 310 version-rolling mask: the bits miners may roll.
const VERSION_ROLLING_MASK: u32 = 0x1fff_e000;

/// An outbound sync round the transport layer should perform.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub peer: PeerId,
    pub locators: Vec<[u8; 32]>,
    pub max_count: u64,
}

/// All inbound event streams the orchestrator drains.
pub struct OrchestratorInputs {
    pub jobs: mpsc::Receiver<Arc<Job>>,
    pub submissions: mpsc::Receiver<ShareSubmission>,
    pub p2p_shares: mpsc::Receiver<ShareMsg>,
    pub peer_connected: mpsc::Receiver<PeerId>,
    pub chain_events: mpsc::Receiver<ChainEvent>,
}

pub struct Orchestrator<R: BitcoinRpc + 'static> {
    chain: Arc<Sharechain>,
    generator: Arc<Generator<R>>,
    rpc: Arc<R>,
    stratum: Arc<StratumServer>,

    /// Gossip egress: encoded `ShareMsg` payloads for the pubsub transport.
    broadcast_tx: mpsc::Sender<Vec<u8>>,
    /// Sync rounds for the transport layer to dial.
    sync_req_tx: mpsc::Sender<SyncRequest>,

    /// Address used as prospective finder when building jobs; follows the
    /// most recent accepted local share.
    finder_address: Arc<RwLock<String>>,

    /// Header hashes already handed to `submitblock`.
    submitted_blocks: HashSet<[u8; 32]>,
    /// Highest job sequence broadcast so far; older jobs are stale.
    last_job_seq: u64,
}

impl<R: BitcoinRpc + 'static> Orchestrator<R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<Sharechain>,
        generator: Arc<Generator<R>>,
        rpc: Arc<R>,
        stratum: Arc<StratumServer>,
        broadcast_tx: mpsc::Sender<Vec<u8>>,
        sync_req_tx: mpsc::Sender<SyncRequest>,
        finder_address: Arc<RwLock<String>>,
    ) -> Self {
        Self {
            chain,
            generator,
            rpc,
            stratum,
            broadcast_tx,
            sync_req_tx,
            finder_address,
            submitted_blocks: HashSet::new(),
            last_job_seq: 0,
        }
    }

    /// Drain all event sources until shutdown.
    pub async fn run(mut self, mut inputs: OrchestratorInputs, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                Some(job) = inputs.jobs.recv() => self.on_job(job).await,
                Some(submission) = inputs.submissions.recv() => self.on_submission(submission).await,
                Some(share) = inputs.p2p_shares.recv() => self.on_p2p_share(share),
                Some(peer) = inputs.peer_connected.recv() => self.on_peer_connected(peer),
                Some(event) = inputs.chain_events.recv() => self.on_chain_event(event),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("orchestrator shutting down");
                        return;
                    }
                }
                else => return,
            }
        }
    }

    // -------------------------------------------------------------------------
    // Jobs
    // -------------------------------------------------------------------------

    async fn on_job(&mut self, job: Arc<Job>) {
        // Only ever act on the newest sequence so a stale clean_jobs can't
        // follow a fresh one out of order.
        if job.seq <= self.last_job_seq {
            debug!(seq = job.seq, last = self.last_job_seq, "stale job skipped");
            return;
        }
        self.last_job_seq = job.seq;

        self.stratum.broadcast_job(&job_to_notification(&job)).await;
        debug!(job = %job.id, clean = job.clean_jobs, "job broadcast");
    }

    // -------------------------------------------------------------------------
    // Miner Submissions
    // -------------------------------------------------------------------------

    async fn on_submission(&mut self, submission: ShareSubmission) {
        let reject = |submission: ShareSubmission, reason: String| {
            metrics::SHARES_REJECTED.inc();
            debug!(worker = %submission.worker, %reason, "share rejected");
            let _ = submission.respond.send(Err(reason));
        };

        let job = match self.generator.get_job(&submission.job_id) {
            Some(job) => job,
            None => return reject(submission, "job not found".into()),
        };

        let version = apply_version_rolling(&job.version, submission.version_bits.as_deref());
        let (header, coinbase) = match reconstruct_header(
            &job,
            &version,
            &submission.extranonce1,
            &submission.extranonce2,
            &submission.ntime,
            &submission.nonce,
        ) {
            Ok(pair) => pair,
            Err(e) => return reject(submission, format!("malformed submission: {e}")),
        };

        // The job's coinbase committed to the tip at build time; that
        // commitment is the share's parent.
        let prev_share_hash = match extract_share_commitment(&coinbase) {
            Ok(hash) => hash,
            Err(e) => return reject(submission, format!("commitment missing: {e}")),
        };

        let share_target = self.chain.expected_target_for(&prev_share_hash);
        let share = Share::new(
            ShareHeader::deserialize(&header),
            SHARE_VERSION,
            prev_share_hash,
            share_target,
            submission.worker.clone(),
            coinbase.clone(),
        );

        match self.chain.append(&share) {
            Ok(_) => {
                metrics::SHARES_ACCEPTED.inc();
                *self.finder_address.write().unwrap() = submission.worker.clone();
                let _ = submission.respond.send(Ok(()));

                if share.is_block() {
                    self.try_submit_block(&header, &coinbase, &job).await;
                } else {
                    self.broadcast_share(&share);
                }
            }
            Err(AppendError::Store(StoreError::DuplicateShare)) => {
                // A block the miner re-sent is still a block; the dedupe set
                // keeps the RPC call idempotent.
                if share.is_block() {
                    self.try_submit_block(&header, &coinbase, &job).await;
                }
                reject(submission, "duplicate share".into());
            }
            Err(AppendError::Validation(e)) => reject(submission, e.reason),
            Err(AppendError::Store(e)) => {
                error!(error = %e, "share store failure");
                reject(submission, "internal error".into());
            }
        }
    }

    async fn try_submit_block(&mut self, header: &[u8; 80], coinbase: &[u8], job: &Job) {
        let header_hash = sha256d(header);
        if !self.submitted_blocks.insert(header_hash) {
            debug!("block already submitted, skipping");
            return;
        }

        // Independent merkle check; a mismatch would make bitcoind ban us
        // for an invalid block, so it never goes out.
        if let Err(e) = verify_merkle_root(header, coinbase, &job.template) {
            error!(error = %e, "pre-submit merkle verification failed, block NOT submitted");
            metrics::BLOCK_SUBMISSIONS
                .with_label_values(&["merkle_mismatch"])
                .inc();
            return;
        }

        let block_hex = match reconstruct_block(header, coinbase, &job.template) {
            Ok(hex) => hex,
            Err(e) => {
                error!(error = %e, "block reconstruction failed");
                metrics::BLOCK_SUBMISSIONS
                    .with_label_values(&["reconstruct_error"])
                    .inc();
                return;
            }
        };

        info!(height = job.height, "block found! submitting to bitcoind");
        match self.rpc.submit_block(&block_hex).await {
            Ok(()) => {
                metrics::BLOCKS_FOUND.inc();
                metrics::BLOCK_SUBMISSIONS
                    .with_label_values(&["accepted"])
                    .inc();
                info!(height = job.height, "block accepted");
            }
            Err(RpcError::BlockRejected { reason }) => {
                // Definitive rejection: never retry.
                metrics::BLOCK_SUBMISSIONS
                    .with_label_values(&["rejected"])
                    .inc();
                error!(%reason, "block rejected by bitcoind");
            }
            Err(e) => {
                // Transient transport error: allow an identical future
                // submission to retry.
                self.submitted_blocks.remove(&header_hash);
                metrics::BLOCK_SUBMISSIONS
                    .with_label_values(&["error"])
                    .inc();
                warn!(error = %e, "block submission failed");
            }
        }
    }

    fn broadcast_share(&self, share: &Share) {
        let mut msg = ShareMsg::from_share(share);
        if let Ok(compressed) = compress_coinbase(&msg.coinbase_tx) {
            if compressed.len() < msg.coinbase_tx.len() {
                msg.coinbase_tx = compressed;
            }
        }
        match encode_share_for_broadcast(&msg) {
            Ok(payload) => {
                if self.broadcast_tx.try_send(payload).is_err() {
                    warn!("gossip egress full, share not broadcast");
                }
            }
            Err(e) => error!(error = %e, "share encode failed"),
        }
    }

    // -------------------------------------------------------------------------
    // P2P
    // -------------------------------------------------------------------------

    fn on_p2p_share(&mut self, mut msg: ShareMsg) {
        match decompress_coinbase(&msg.coinbase_tx) {
            Ok(coinbase) => msg.coinbase_tx = coinbase,
            Err(e) => {
                debug!(error = %e, "peer share coinbase decompression failed");
                return;
            }
        }

        let share = msg.to_share();
        match self.chain.append(&share) {
            Ok(event) => {
                debug!(share = %share.hash_hex(), ?event, "peer share appended");
            }
            // Gossip routinely redelivers; duplicates are expected.
            Err(AppendError::Store(StoreError::DuplicateShare)) => {}
            Err(AppendError::Validation(e)) => {
                debug!(reason = %e.reason, "peer share rejected");
            }
            Err(AppendError::Store(e)) => error!(error = %e, "share store failure"),
        }
    }

    fn on_peer_connected(&mut self, peer: PeerId) {
        let locators = match self.chain.locator() {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "locator build failed");
                Vec::new()
            }
        };
        debug!(%peer, locators = locators.len(), "initiating sync round");
        let request = SyncRequest {
            peer,
            locators,
            max_count: MAX_SYNC_BATCH_SIZE,
        };
        if self.sync_req_tx.try_send(request).is_err() {
            debug!("sync request queue full; next connect retriggers");
        }
    }

    // -------------------------------------------------------------------------
    // Chain Events
    // -------------------------------------------------------------------------

    fn on_chain_event(&mut self, event: ChainEvent) {
        match event {
            ChainEvent::Appended { .. } => {
                if let Ok(count) = self.chain.share_count() {
                    metrics::SHARECHAIN_HEIGHT.set(count as i64);
                }
            }
            ChainEvent::Reorg {
                old_tip,
                new_tip,
                common_ancestor,
            } => {
                metrics::REORGS.inc();
                warn!(
                    old_tip = %hex::encode(&old_tip[..8]),
                    new_tip = %hex::encode(&new_tip[..8]),
                    ancestor = %hex::encode(&common_ancestor[..8]),
                    "sharechain reorg"
                );
            }
        }
    }
}

/// Convert a generator job into the 9-param Stratum notify form.
pub fn job_to_notification(job: &Job) -> JobNotification {
    JobNotification {
        job_id: job.id.clone(),
        prev_hash: job.prev_block_hash.clone(),
        coinbase1: job.coinbase1.clone(),
        coinbase2: job.coinbase2.clone(),
        merkle_branches: job.merkle_branches.clone(),
        version: job.version.clone(),
        nbits: job.nbits.clone(),
        ntime: job.ntime.clone(),
        clean_jobs: job.clean_jobs,
    }
}

/// Merge miner-rolled version bits into the job version under the BIP 310
/// mask.
fn apply_version_rolling(job_version: &str, rolled: Option<&str>) -> String {
    let Some(rolled) = rolled else {
        return job_version.to_string();
    };
    let base = u32::from_str_radix(job_version, 16).unwrap_or(0x2000_0000);
    let bits = u32::from_str_radix(rolled, 16).unwrap_or(0);
    format!("{:08x}", (base & !VERSION_ROLLING_MASK) | (bits & VERSION_ROLLING_MASK))
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerpool_rpc::{BlockTemplate, MockRpc};
    use peerpool_sharechain::{ShareStore, SharechainConfig};
    use peerpool_stratum::StratumServerConfig;
    use peerpool_types::constants::Network;
    use peerpool_types::PayoutEntry;
    use peerpool_work::GeneratorConfig;
    use tokio::sync::oneshot;

    const MINER1: &str = "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx";

    fn easy_template() -> BlockTemplate {
        BlockTemplate {
            version: 0x2000_0000,
            previous_block_hash:
                "0000000000000003fa0d845513ea5014a7859d411f5f4a91eaab24eb47a18f39".to_string(),
            transactions: Vec::new(),
            coinbase_value: 5_000_000_000,
            target: "7fffff0000000000000000000000000000000000000000000000000000000000"
                .to_string(),
            cur_time: 1_700_000_000,
            // Regtest-grade difficulty so test submissions can be blocks.
            bits: "207fffff".to_string(),
            height: 2_500_000,
            default_witness_commitment: String::new(),
            min_time: 0,
            mutable: Vec::new(),
        }
    }

    fn hard_template() -> BlockTemplate {
        BlockTemplate {
            bits: "1d00ffff".to_string(),
            ..easy_template()
        }
    }

    struct Harness {
        orchestrator: Orchestrator<MockRpc>,
        rpc: Arc<MockRpc>,
        chain: Arc<Sharechain>,
        generator: Arc<Generator<MockRpc>>,
        broadcast_rx: mpsc::Receiver<Vec<u8>>,
        sync_rx: mpsc::Receiver<SyncRequest>,
    }

    async fn harness(template: BlockTemplate) -> Harness {
        let store = Arc::new(ShareStore::open_in_memory().unwrap());
        let chain = Arc::new(
            Sharechain::new(
                store,
                SharechainConfig {
                    network: Network::Testnet,
                    ..Default::default()
                },
            )
            .unwrap(),
        );

        let rpc = Arc::new(MockRpc::new(template));
        let finder = Arc::new(RwLock::new(MINER1.to_string()));

        let payouts_chain = Arc::clone(&chain);
        let payouts_finder = Arc::clone(&finder);
        let tip_chain = Arc::clone(&chain);
        let (generator, _job_rx) = Generator::new(
            Arc::clone(&rpc),
            GeneratorConfig {
                network: Network::Testnet,
                extranonce_size: 8,
            },
            Arc::new(move |coinbase_value| {
                let finder = payouts_finder.read().unwrap().clone();
                let payouts = payouts_chain.pplns_payouts(coinbase_value, &finder);
                if payouts.is_empty() {
                    vec![PayoutEntry::new(finder, coinbase_value.max(0) as u64)]
                } else {
                    payouts
                }
            }),
            Arc::new(move || tip_chain.current_tip_hash().unwrap_or_default()),
        );
        generator.fetch_template().await.unwrap();

        let (stratum, _submit_rx) = StratumServer::new(StratumServerConfig::default());
        let (broadcast_tx, broadcast_rx) = mpsc::channel(16);
        let (sync_req_tx, sync_rx) = mpsc::channel(16);

        let orchestrator = Orchestrator::new(
            Arc::clone(&chain),
            Arc::clone(&generator),
            Arc::clone(&rpc),
            stratum,
            broadcast_tx,
            sync_req_tx,
            finder,
        );

        Harness {
            orchestrator,
            rpc,
            chain,
            generator,
            broadcast_rx,
            sync_rx,
        }
    }

    /// Grind extranonce2 values until the reconstructed header meets the
    /// sharechain target (and, with a regtest template, the block target).
    fn grind_submission(
        harness: &Harness,
        job: &Job,
    ) -> (String, String, oneshot::Receiver<Result<(), String>>, ShareSubmission) {
        let target = harness.chain.expected_target_for(
            &extract_share_commitment(&job.coinbase_tx).unwrap(),
        );

        for i in 0u32..100_000 {
            let extranonce2 = format!("{i:08x}");
            let (header, _) = reconstruct_header(
                job,
                &job.version,
                "00000001",
                &extranonce2,
                &job.ntime,
                "00000000",
            )
            .unwrap();
            let share_hash = sha256d(&header);
            if peerpool_types::hash::hash_meets_target(&share_hash, &target) {
                let (tx, rx) = oneshot::channel();
                let submission = ShareSubmission {
                    session_id: 1,
                    worker: MINER1.to_string(),
                    job_id: job.id.clone(),
                    extranonce1: "00000001".to_string(),
                    extranonce2: extranonce2.clone(),
                    ntime: job.ntime.clone(),
                    nonce: "00000000".to_string(),
                    version_bits: None,
                    difficulty: 1.0,
                    respond: tx,
                };
                return ("00000001".to_string(), extranonce2, rx, submission);
            }
        }
        panic!("no solution found");
    }

    #[tokio::test]
    async fn test_block_submission_once_and_idempotent() {
        let mut h = harness(easy_template()).await;
        let job = h.generator.generate_job().unwrap();

        let (_, extranonce2, rx, submission) = grind_submission(&h, &job);
        h.orchestrator.on_submission(submission).await;

        assert_eq!(rx.await.unwrap(), Ok(()));
        assert_eq!(h.rpc.submitted_blocks().len(), 1, "block submitted once");
        assert!(h.chain.current_tip_hash().is_some(), "share appended");

        // Identical second submit: duplicate share, and no second RPC call.
        let (tx, rx2) = oneshot::channel();
        let duplicate = ShareSubmission {
            session_id: 1,
            worker: MINER1.to_string(),
            job_id: job.id.clone(),
            extranonce1: "00000001".to_string(),
            extranonce2,
            ntime: job.ntime.clone(),
            nonce: "00000000".to_string(),
            version_bits: None,
            difficulty: 1.0,
            respond: tx,
        };
        h.orchestrator.on_submission(duplicate).await;

        assert!(rx2.await.unwrap().is_err(), "duplicate reported");
        assert_eq!(h.rpc.submitted_blocks().len(), 1, "submit is idempotent");
    }

    #[tokio::test]
    async fn test_non_block_share_is_broadcast() {
        let mut h = harness(hard_template()).await;
        let job = h.generator.generate_job().unwrap();

        let (_, _, rx, submission) = grind_submission(&h, &job);
        h.orchestrator.on_submission(submission).await;
        assert_eq!(rx.await.unwrap(), Ok(()));

        // Not a Bitcoin block at 1d00ffff, so it travels by gossip instead.
        assert!(h.rpc.submitted_blocks().is_empty());
        let payload = h.broadcast_rx.try_recv().expect("share broadcast");
        let msg = peerpool_p2p::messages::decode_share_msg(&payload).unwrap();
        assert_eq!(msg.miner_address, MINER1);
    }

    #[tokio::test]
    async fn test_unknown_job_rejected() {
        let mut h = harness(easy_template()).await;
        let (tx, rx) = oneshot::channel();
        let submission = ShareSubmission {
            session_id: 1,
            worker: MINER1.to_string(),
            job_id: "deadbeef".to_string(),
            extranonce1: "00000001".to_string(),
            extranonce2: "00000000".to_string(),
            ntime: "65432100".to_string(),
            nonce: "00000000".to_string(),
            version_bits: None,
            difficulty: 1.0,
            respond: tx,
        };
        h.orchestrator.on_submission(submission).await;
        let err = rx.await.unwrap().unwrap_err();
        assert!(err.contains("job not found"));
    }

    #[tokio::test]
    async fn test_p2p_share_appended_and_duplicate_silent() {
        let mut h = harness(hard_template()).await;
        let job = h.generator.generate_job().unwrap();

        // Locally mined share, replayed as if it came from a peer.
        let (_, _, _rx, submission) = grind_submission(&h, &job);
        let (header, coinbase) = reconstruct_header(
            &job,
            &job.version,
            &submission.extranonce1,
            &submission.extranonce2,
            &submission.ntime,
            &submission.nonce,
        )
        .unwrap();
        let prev = extract_share_commitment(&coinbase).unwrap();
        let share = Share::new(
            ShareHeader::deserialize(&header),
            SHARE_VERSION,
            prev,
            h.chain.expected_target_for(&prev),
            MINER1.to_string(),
            coinbase,
        );
        let msg = ShareMsg::from_share(&share);

        h.orchestrator.on_p2p_share(msg.clone());
        assert_eq!(h.chain.share_count().unwrap(), 1);

        // Redelivery is silently ignored.
        h.orchestrator.on_p2p_share(msg);
        assert_eq!(h.chain.share_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_p2p_share_dropped() {
        let mut h = harness(hard_template()).await;
        let msg = ShareMsg {
            share_version: 99,
            miner_address: MINER1.to_string(),
            ..Default::default()
        };
        h.orchestrator.on_p2p_share(msg);
        assert_eq!(h.chain.share_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_peer_connect_triggers_sync_round() {
        let mut h = harness(easy_template()).await;
        h.orchestrator.on_peer_connected(PeerId("peer1".into()));

        let request = h.sync_rx.try_recv().unwrap();
        assert_eq!(request.peer, PeerId("peer1".into()));
        assert_eq!(request.max_count, MAX_SYNC_BATCH_SIZE);
        assert!(request.locators.is_empty(), "empty chain, empty locator");
    }

    #[tokio::test]
    async fn test_stale_job_sequence_skipped() {
        let mut h = harness(easy_template()).await;
        let older = h.generator.generate_job().unwrap();
        let newer = h.generator.generate_job().unwrap();

        // Deliver out of order: the newer sequence first.
        h.orchestrator.on_job(Arc::clone(&newer)).await;
        assert_eq!(h.orchestrator.last_job_seq, newer.seq);

        h.orchestrator.on_job(older).await;
        assert_eq!(h.orchestrator.last_job_seq, newer.seq, "stale seq ignored");
    }

    #[test]
    fn test_apply_version_rolling() {
        // No rolled bits: job version untouched.
        assert_eq!(apply_version_rolling("20000000", None), "20000000");
        // Rolled bits merge under the mask only.
        assert_eq!(
            apply_version_rolling("20000000", Some("1fffe000")),
            "3fffe000"
        );
        // Bits outside the mask are discarded.
        assert_eq!(
            apply_version_rolling("20000000", Some("ffffffff")),
            "3fffe000"
        );
    }
}
