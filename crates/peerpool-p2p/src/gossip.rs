//! Share gossip admission.
//!
//! The transport delivers raw topic messages here; the pump filters our own
//! messages, rate-limits each source with a token bucket, decodes, and
//! hands shares to the orchestrator through a bounded queue. A slow
//! consumer drops shares rather than stalling the network stack.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::messages::{decode_share_msg, encode_share_msg, ShareMsg, WireError};

/// GossipSub topic for share propagation.
pub const SHARE_TOPIC: &str = "/p2pool/shares/1.0.0";

/// Bounded ingress queue between the gossip reader and the orchestrator.
pub const INCOMING_SHARE_BUFFER: usize = 256;

/// Connection-event queue; overflow is dropped since the next connect will
/// re-trigger any needed sync.
pub const PEER_CONNECTED_BUFFER: usize = 16;

/// Token bucket refill rate per source, messages per second.
const LIMITER_RATE: f64 = 10.0;

/// Token bucket burst per source.
const LIMITER_BURST: f64 = 20.0;

/// Cap on tracked sources; overflow evicts an arbitrary entry.
const MAX_LIMITERS: usize = 500;

/// Opaque transport-level peer identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId(pub String);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A classic token bucket.
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new() -> Self {
        Self {
            tokens: LIMITER_BURST,
            last_refill: Instant::now(),
        }
    }

    fn allow(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * LIMITER_RATE).min(LIMITER_BURST);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Admits gossip messages into the node.
pub struct GossipPump {
    self_id: PeerId,
    limiters: Mutex<HashMap<PeerId, TokenBucket>>,
    shares_tx: mpsc::Sender<ShareMsg>,
}

impl GossipPump {
    /// Returns the pump and the bounded share ingress queue.
    pub fn new(self_id: PeerId) -> (Self, mpsc::Receiver<ShareMsg>) {
        let (shares_tx, shares_rx) = mpsc::channel(INCOMING_SHARE_BUFFER);
        (Self::with_sender(self_id, shares_tx), shares_rx)
    }

    /// Build a pump feeding an existing ingress queue, so sync responses
    /// and gossip can share one consumer.
    pub fn with_sender(self_id: PeerId, shares_tx: mpsc::Sender<ShareMsg>) -> Self {
        Self {
            self_id,
            limiters: Mutex::new(HashMap::new()),
            shares_tx,
        }
    }

    /// Handle one raw topic message from `source`.
    pub fn handle_message(&self, source: &PeerId, data: &[u8]) {
        if *source == self.self_id {
            return;
        }

        if !self.allow(source) {
            warn!(peer = %source, "peer rate limited");
            return;
        }

        let share = match decode_share_msg(data) {
            Ok(share) => share,
            Err(e) => {
                debug!(peer = %source, error = %e, "invalid share message");
                return;
            }
        };

        if self.shares_tx.try_send(share).is_err() {
            warn!("incoming share queue full, dropping share");
        }
    }

    fn allow(&self, source: &PeerId) -> bool {
        let mut limiters = self.limiters.lock().unwrap();

        if !limiters.contains_key(source) && limiters.len() >= MAX_LIMITERS {
            // Arbitrary eviction keeps the map bounded.
            if let Some(victim) = limiters.keys().next().cloned() {
                limiters.remove(&victim);
            }
        }

        limiters
            .entry(source.clone())
            .or_insert_with(TokenBucket::new)
            .allow()
    }
}

/// Encode a share for topic broadcast.
pub fn encode_share_for_broadcast(msg: &ShareMsg) -> Result<Vec<u8>, WireError> {
    encode_share_msg(msg)
}

/// Pushes newly connected peer ids toward the orchestrator without ever
/// blocking the transport's notification path.
pub struct PeerNotifier {
    tx: mpsc::Sender<PeerId>,
}

impl PeerNotifier {
    pub fn new() -> (Self, mpsc::Receiver<PeerId>) {
        let (tx, rx) = mpsc::channel(PEER_CONNECTED_BUFFER);
        (Self { tx }, rx)
    }

    /// Non-blocking; drops the event when the queue is full.
    pub fn on_connected(&self, peer: PeerId) {
        let _ = self.tx.try_send(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::encode_share_msg;

    fn sample_payload() -> Vec<u8> {
        let msg = ShareMsg {
            share_version: 1,
            miner_address: "tb1qtest1".to_string(),
            ..Default::default()
        };
        encode_share_msg(&msg).unwrap()
    }

    #[test]
    fn test_delivers_valid_share() {
        let (pump, mut rx) = GossipPump::new(PeerId("self".into()));
        pump.handle_message(&PeerId("peer1".into()), &sample_payload());

        let share = rx.try_recv().unwrap();
        assert_eq!(share.miner_address, "tb1qtest1");
    }

    #[test]
    fn test_ignores_own_messages() {
        let (pump, mut rx) = GossipPump::new(PeerId("self".into()));
        pump.handle_message(&PeerId("self".into()), &sample_payload());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_drops_garbage() {
        let (pump, mut rx) = GossipPump::new(PeerId("self".into()));
        pump.handle_message(&PeerId("peer1".into()), &[0xde, 0xad]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_rate_limiter_kicks_in() {
        let (pump, mut rx) = GossipPump::new(PeerId("self".into()));
        let peer = PeerId("flooder".into());
        let payload = sample_payload();

        // Burst of 20 is admitted, the rest of an instant flood is not.
        for _ in 0..40 {
            pump.handle_message(&peer, &payload);
        }

        let mut delivered = 0;
        while rx.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, 20);
    }

    #[test]
    fn test_limiter_map_bounded() {
        let (pump, _rx) = GossipPump::new(PeerId("self".into()));
        for i in 0..(MAX_LIMITERS + 50) {
            pump.allow(&PeerId(format!("peer{i}")));
        }
        assert!(pump.limiters.lock().unwrap().len() <= MAX_LIMITERS);
    }

    #[test]
    fn test_ingress_queue_drops_on_full() {
        let (pump, mut rx) = GossipPump::new(PeerId("self".into()));
        let payload = sample_payload();

        // Far more messages than the queue holds, from distinct peers so
        // the rate limiter stays out of the way.
        for i in 0..(INCOMING_SHARE_BUFFER + 100) {
            pump.handle_message(&PeerId(format!("peer{i}")), &payload);
        }

        let mut delivered = 0;
        while rx.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, INCOMING_SHARE_BUFFER);
    }

    #[test]
    fn test_peer_notifier_never_blocks() {
        let (notifier, mut rx) = PeerNotifier::new();
        for i in 0..(PEER_CONNECTED_BUFFER + 10) {
            notifier.on_connected(PeerId(format!("peer{i}")));
        }
        let mut seen = 0;
        while rx.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, PEER_CONNECTED_BUFFER);
    }
}
