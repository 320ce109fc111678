//! Template polling and job emission.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use peerpool_rpc::{BitcoinRpc, BlockTemplate};
use peerpool_types::constants::Network;
use peerpool_types::PayoutEntry;

use crate::template::{build_job_from_template, Job, WorkError};

/// How often to ask bitcoind for a fresh template.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How often to re-send a non-clean job so idle miners keep a live work unit.
pub const JOB_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Backoff cap when the node is unreachable.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Jobs retained for validating late submissions.
const MAX_STORED_JOBS: usize = 20;

/// Snapshot providers wired to the sharechain engine. The payout provider
/// receives the template's coinbase value and must return entries summing
/// to it.
pub type PayoutsFn = Arc<dyn Fn(i64) -> Vec<PayoutEntry> + Send + Sync>;
pub type PrevShareHashFn = Arc<dyn Fn() -> [u8; 32] + Send + Sync>;

#[derive(Clone)]
pub struct GeneratorConfig {
    pub network: Network,
    /// Total extranonce width reserved in the coinbase (extranonce1 +
    /// extranonce2).
    pub extranonce_size: usize,
}

/// Produces mining jobs from block templates.
pub struct Generator<R: BitcoinRpc> {
    rpc: Arc<R>,
    config: GeneratorConfig,

    current_template: RwLock<Option<BlockTemplate>>,
    job_counter: AtomicU64,
    job_tx: mpsc::Sender<Arc<Job>>,

    jobs: Mutex<HashMap<String, Arc<Job>>>,

    payouts_fn: PayoutsFn,
    prev_share_hash_fn: PrevShareHashFn,

    last_job_time: Mutex<Option<Instant>>,
}

impl<R: BitcoinRpc + 'static> Generator<R> {
    pub fn new(
        rpc: Arc<R>,
        config: GeneratorConfig,
        payouts_fn: PayoutsFn,
        prev_share_hash_fn: PrevShareHashFn,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<Job>>) {
        let (job_tx, job_rx) = mpsc::channel(8);
        let generator = Arc::new(Self {
            rpc,
            config,
            current_template: RwLock::new(None),
            job_counter: AtomicU64::new(0),
            job_tx,
            jobs: Mutex::new(HashMap::new()),
            payouts_fn,
            prev_share_hash_fn,
            last_job_time: Mutex::new(None),
        });
        (generator, job_rx)
    }

    /// Run the polling loop until cancelled.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut consecutive_failures: u32 = 0;
        let mut last_failure: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {
                    if let (true, Some(at)) = (consecutive_failures > 0, last_failure) {
                        if at.elapsed() < backoff_duration(consecutive_failures) {
                            continue;
                        }
                    }

                    match self.fetch_template().await {
                        Ok(()) => {
                            if consecutive_failures > 0 {
                                info!(after_failures = consecutive_failures, "bitcoin RPC recovered");
                                consecutive_failures = 0;
                            }
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            last_failure = Some(Instant::now());
                            warn!(
                                error = %e,
                                consecutive_failures,
                                next_retry_secs = backoff_duration(consecutive_failures).as_secs(),
                                "bitcoin RPC failed, serving last-known template"
                            );
                        }
                    }
                }
            }
        }
    }

    /// Last successfully fetched template, if any.
    pub fn current_template(&self) -> Option<BlockTemplate> {
        self.current_template.read().unwrap().clone()
    }

    /// Build a job from the current template with a fresh sequence number.
    pub fn generate_job(&self) -> Result<Arc<Job>, WorkError> {
        let tmpl = self
            .current_template
            .read()
            .unwrap()
            .clone()
            .ok_or(WorkError::NoTemplate)?;

        let payouts = (self.payouts_fn)(tmpl.coinbase_value);
        let prev_share_hash = (self.prev_share_hash_fn)();

        let seq = self.job_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let mut job = build_job_from_template(
            format!("{seq:x}"),
            &tmpl,
            self.config.network,
            &payouts,
            prev_share_hash,
            self.config.extranonce_size,
        )?;
        job.seq = seq;

        let job = Arc::new(job);
        self.store_job(Arc::clone(&job));
        Ok(job)
    }

    /// Look up a retained job by id.
    pub fn get_job(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs.lock().unwrap().get(id).cloned()
    }

    fn store_job(&self, job: Arc<Job>) {
        let mut jobs = self.jobs.lock().unwrap();
        jobs.insert(job.id.clone(), job);

        while jobs.len() > MAX_STORED_JOBS {
            // Evict the oldest by sequence number.
            if let Some(oldest) = jobs
                .values()
                .min_by_key(|j| j.seq)
                .map(|j| j.id.clone())
            {
                jobs.remove(&oldest);
            }
        }
    }

    /// Fetch a template once: called by the poll loop, and directly at
    /// startup so the first job does not wait a full poll interval.
    pub async fn fetch_template(&self) -> Result<(), peerpool_rpc::RpcError> {
        let tmpl = self.rpc.get_block_template().await?;

        let new_block = {
            let mut current = self.current_template.write().unwrap();
            let changed = current
                .as_ref()
                .map(|old| old.previous_block_hash != tmpl.previous_block_hash)
                .unwrap_or(true);
            *current = Some(tmpl.clone());
            changed
        };

        if new_block {
            info!(
                height = tmpl.height,
                prevhash = &tmpl.previous_block_hash[..16.min(tmpl.previous_block_hash.len())],
                "new block template"
            );
        }

        let needs_refresh = !new_block
            && self
                .last_job_time
                .lock()
                .unwrap()
                .map(|t| t.elapsed() >= JOB_REFRESH_INTERVAL)
                .unwrap_or(true);

        if new_block || needs_refresh {
            match self.generate_job() {
                Ok(job) => {
                    let mut job = (*job).clone();
                    job.clean_jobs = new_block;
                    match self.job_tx.try_send(Arc::new(job)) {
                        Ok(()) => {
                            *self.last_job_time.lock().unwrap() = Some(Instant::now());
                        }
                        Err(_) => warn!("job channel full, dropping job"),
                    }
                }
                Err(e) => error!(error = %e, "failed to generate job"),
            }
        }

        Ok(())
    }
}

/// Exponential backoff: base poll interval, doubled per consecutive failure,
/// capped at [`MAX_BACKOFF`].
fn backoff_duration(failures: u32) -> Duration {
    if failures == 0 {
        return POLL_INTERVAL;
    }
    let mut d = POLL_INTERVAL;
    for _ in 1..failures {
        d *= 2;
        if d > MAX_BACKOFF {
            return MAX_BACKOFF;
        }
    }
    d
}
