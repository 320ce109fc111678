//! The sharechain engine: wires the store, validator, and retarget
//! calculator together, resolves forks by cumulative work, and publishes
//! chain events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use num_bigint::BigUint;
use num_traits::{One, Zero};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use peerpool_pplns::{Calculator, Window};
use peerpool_types::constants::{
    max_share_target, Network, DEFAULT_PPLNS_WINDOW, DIFFICULTY_ADJUSTMENT_WINDOW,
    TARGET_SHARE_INTERVAL_SECS,
};
use peerpool_types::share::GENESIS_PREV_HASH;
use peerpool_types::{PayoutEntry, Share};

use crate::difficulty::DifficultyCalculator;
use crate::store::{ShareStore, StoreError};
use crate::validation::{ValidationError, Validator};

/// Wire-protocol cap on locator lists.
pub const MAX_LOCATOR_COUNT: usize = 64;

/// Buffered chain events before the consumer falls behind.
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum AppendError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Emitted after every successful append, once the new state is durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    Appended {
        hash: [u8; 32],
    },
    Reorg {
        old_tip: [u8; 32],
        new_tip: [u8; 32],
        common_ancestor: [u8; 32],
    },
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct SharechainConfig {
    pub network: Network,
    pub target_share_interval: Duration,
    pub pplns_window: usize,
    pub finder_fee_percent: f64,
    pub dust_threshold_sats: u64,
}

impl Default for SharechainConfig {
    fn default() -> Self {
        Self {
            network: Network::Testnet,
            target_share_interval: Duration::from_secs(TARGET_SHARE_INTERVAL_SECS),
            pplns_window: DEFAULT_PPLNS_WINDOW,
            finder_fee_percent: 0.5,
            dust_threshold_sats: 546,
        }
    }
}

/// Expected target for a share whose parent is `parent_hash`, derived from
/// the retarget window ending at that parent.
fn expected_target(
    store: &ShareStore,
    calc: &DifficultyCalculator,
    parent_hash: &[u8; 32],
) -> BigUint {
    if *parent_hash == GENESIS_PREV_HASH {
        return max_share_target();
    }
    match store.get_ancestors(parent_hash, DIFFICULTY_ADJUSTMENT_WINDOW) {
        Ok(window) => calc.next_target(&window),
        Err(e) => {
            warn!(error = %e, "ancestor walk failed during retarget, using max target");
            max_share_target()
        }
    }
}

/// The sharechain engine. All mutation funnels through [`Sharechain::append`];
/// the orchestrator is its single writer.
pub struct Sharechain {
    store: Arc<ShareStore>,
    validator: Validator,
    calc: DifficultyCalculator,
    config: SharechainConfig,
    max_target: BigUint,

    tip: RwLock<Option<[u8; 32]>>,
    work_cache: Mutex<HashMap<[u8; 32], BigUint>>,

    events_tx: mpsc::Sender<ChainEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ChainEvent>>>,
}

impl Sharechain {
    /// Build an engine over an open store, restoring the tip pointer.
    pub fn new(store: Arc<ShareStore>, config: SharechainConfig) -> Result<Self, StoreError> {
        let calc = DifficultyCalculator::new(config.target_share_interval);

        let target_store = Arc::clone(&store);
        let target_interval = config.target_share_interval;
        let validator = Validator::new(
            Arc::clone(&store),
            Arc::new(move |parent: &[u8; 32]| {
                let calc = DifficultyCalculator::new(target_interval);
                expected_target(&target_store, &calc, parent)
            }),
            config.network,
        );

        let tip = store.tip_hash()?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        Ok(Self {
            store,
            validator,
            calc,
            config,
            max_target: max_share_target(),
            tip: RwLock::new(tip),
            work_cache: Mutex::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// Take the chain event stream. Single consumer; later calls get `None`.
    pub fn subscribe(&self) -> Option<mpsc::Receiver<ChainEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    /// Validate and persist a share, switching the tip when the share's
    /// chain carries strictly more cumulative work. The returned event has
    /// already been pushed to the subscriber stream.
    pub fn append(&self, share: &Share) -> Result<ChainEvent, AppendError> {
        self.validator.validate_share(share)?;
        self.store.add(share)?;

        let hash = share.hash();
        let new_work = self.cumulative_work(&hash)?;

        let old_tip = *self.tip.read().unwrap();
        let event = match old_tip {
            None => {
                self.store.set_tip(&hash)?;
                *self.tip.write().unwrap() = Some(hash);
                ChainEvent::Appended { hash }
            }
            Some(old_tip) => {
                let tip_work = self.cumulative_work(&old_tip)?;
                if new_work > tip_work {
                    self.store.set_tip(&hash)?;
                    *self.tip.write().unwrap() = Some(hash);
                    if share.prev_share_hash == old_tip {
                        ChainEvent::Appended { hash }
                    } else {
                        let common_ancestor = self.common_ancestor(&old_tip, &hash)?;
                        ChainEvent::Reorg {
                            old_tip,
                            new_tip: hash,
                            common_ancestor,
                        }
                    }
                } else {
                    // Orphan-branch share: retained, tip unchanged.
                    ChainEvent::Appended { hash }
                }
            }
        };

        if self.events_tx.try_send(event.clone()).is_err() {
            warn!("chain event buffer full, dropping event");
        }
        Ok(event)
    }

    /// Current tip hash, if the chain is non-empty.
    pub fn current_tip_hash(&self) -> Option<[u8; 32]> {
        *self.tip.read().unwrap()
    }

    /// Current tip share.
    pub fn current_tip_share(&self) -> Result<Option<Share>, StoreError> {
        self.store.tip()
    }

    /// Expose the retarget rule for a prospective child of `parent_hash`.
    pub fn expected_target_for(&self, parent_hash: &[u8; 32]) -> BigUint {
        expected_target(&self.store, &self.calc, parent_hash)
    }

    /// Total shares stored (all branches).
    pub fn share_count(&self) -> Result<u64, StoreError> {
        self.store.count()
    }

    /// PPLNS payouts over the window ending at the current tip.
    pub fn pplns_payouts(&self, total_reward: i64, finder_address: &str) -> Vec<PayoutEntry> {
        let tip = match self.current_tip_hash() {
            Some(t) => t,
            None => return Vec::new(),
        };
        let shares = match self.store.get_ancestors(&tip, self.config.pplns_window) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "ancestor walk failed during payout computation");
                return Vec::new();
            }
        };
        let window = Window::new(shares, self.max_target.clone());
        let calc = Calculator::new(self.config.finder_fee_percent, self.config.dust_threshold_sats);
        calc.calculate_payouts(&window, total_reward, finder_address)
    }

    /// Exponentially spaced locator from the tip: offsets 0, 1, 2, 4, 8, …
    /// ending at genesis, capped at [`MAX_LOCATOR_COUNT`] entries.
    pub fn locator(&self) -> Result<Vec<[u8; 32]>, StoreError> {
        let mut locators = Vec::new();
        let mut current = match self.current_tip_hash() {
            Some(t) => t,
            None => return Ok(locators),
        };
        let mut gap: u64 = 1;

        loop {
            locators.push(current);
            if locators.len() >= MAX_LOCATOR_COUNT {
                break;
            }

            let mut share = match self.store.get(&current)? {
                Some(s) => s,
                None => break,
            };
            if share.is_genesis() {
                break;
            }

            // Two single steps off the tip, then exponential spacing.
            if locators.len() >= 3 {
                gap = gap.saturating_mul(2);
            }

            // Advance `gap` parents, clamping at genesis.
            for _ in 0..gap {
                if share.is_genesis() {
                    break;
                }
                match self.store.get(&share.prev_share_hash)? {
                    Some(parent) => share = parent,
                    None => break,
                }
            }
            current = share.hash();
        }

        Ok(locators)
    }

    /// Serve a locator-based sync request: find the first locator that lies
    /// on the main chain and return up to `max_count` shares after it,
    /// oldest first. No match starts from genesis. `more` reports whether
    /// the chunk was truncated by `max_count`.
    pub fn shares_after(
        &self,
        locators: &[[u8; 32]],
        max_count: usize,
    ) -> Result<(Vec<Share>, bool), StoreError> {
        let tip = match self.current_tip_hash() {
            Some(t) => t,
            None => return Ok((Vec::new(), false)),
        };

        // Main chain, oldest first.
        let mut chain_hashes: Vec<[u8; 32]> = Vec::new();
        let mut current = tip;
        loop {
            chain_hashes.push(current);
            match self.store.get(&current)? {
                Some(share) if !share.is_genesis() => current = share.prev_share_hash,
                _ => break,
            }
        }
        chain_hashes.reverse();

        let index_of: HashMap<[u8; 32], usize> = chain_hashes
            .iter()
            .enumerate()
            .map(|(i, h)| (*h, i))
            .collect();

        let start = locators
            .iter()
            .find_map(|loc| index_of.get(loc))
            .map(|&i| i + 1)
            .unwrap_or(0);

        let remaining = chain_hashes.len().saturating_sub(start);
        let more = remaining > max_count;

        let mut shares = Vec::with_capacity(remaining.min(max_count));
        for hash in chain_hashes.iter().skip(start).take(max_count) {
            match self.store.get(hash)? {
                Some(share) => shares.push(share),
                None => {
                    return Err(StoreError::Corruption(
                        "main-chain share disappeared during sync walk".into(),
                    ))
                }
            }
        }

        Ok((shares, more))
    }

    /// Cumulative work of the chain ending at `hash`: the sum of
    /// `max_target / share_target` over all ancestors. Memoized.
    fn cumulative_work(&self, hash: &[u8; 32]) -> Result<BigUint, StoreError> {
        // Walk back to the nearest cached ancestor (or genesis).
        let mut path: Vec<([u8; 32], BigUint)> = Vec::new();
        let mut current = *hash;
        let mut base = BigUint::zero();

        loop {
            if let Some(cached) = self.work_cache.lock().unwrap().get(&current) {
                base = cached.clone();
                break;
            }
            let share = match self.store.get(&current)? {
                Some(s) => s,
                None => break, // missing parent: treat as chain start
            };
            let weight = if share.share_target.is_zero() {
                BigUint::one()
            } else {
                &self.max_target / &share.share_target
            };
            let prev = share.prev_share_hash;
            path.push((current, weight));
            if prev == GENESIS_PREV_HASH {
                break;
            }
            current = prev;
        }

        // Roll forward, filling the cache.
        let mut cache = self.work_cache.lock().unwrap();
        for (h, weight) in path.into_iter().rev() {
            base += weight;
            cache.insert(h, base.clone());
        }
        Ok(base)
    }

    /// Most recent ancestor shared by both chains; the zero hash if the
    /// branches share nothing but the (implicit) pre-genesis root.
    fn common_ancestor(
        &self,
        a: &[u8; 32],
        b: &[u8; 32],
    ) -> Result<[u8; 32], StoreError> {
        let mut seen = std::collections::HashSet::new();
        let mut current = *a;
        loop {
            seen.insert(current);
            match self.store.get(&current)? {
                Some(share) if !share.is_genesis() => current = share.prev_share_hash,
                _ => break,
            }
        }

        let mut current = *b;
        loop {
            if seen.contains(&current) {
                return Ok(current);
            }
            match self.store.get(&current)? {
                Some(share) if !share.is_genesis() => current = share.prev_share_hash,
                _ => return Ok(GENESIS_PREV_HASH),
            }
        }
    }
}
