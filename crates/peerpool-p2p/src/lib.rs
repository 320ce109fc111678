//! Peer-to-peer core: the CBOR wire codec, share gossip admission, the
//! locator-based sync protocol, coinbase compression, and the persistent
//! node identity.
//!
//! Transport, encryption, multiplexing, and peer discovery live outside
//! this crate; everything here speaks either raw message bytes or generic
//! async streams so it can ride on any transport.

pub mod compress;
pub mod gossip;
pub mod identity;
pub mod messages;
pub mod sync;

pub use gossip::{GossipPump, PeerId, PeerNotifier, SHARE_TOPIC};
pub use messages::{
    MessageType, ShareLocatorReq, ShareLocatorResp, ShareMsg, ShareRequest, ShareResponse,
    TipAnnounce, WireError,
};
pub use sync::{request_locator, serve_sync_stream, SyncError, SyncHandler, SYNC_PROTOCOL_ID};
