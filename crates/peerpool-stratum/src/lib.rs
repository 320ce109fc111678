//! Stratum v1 server: newline-delimited JSON-RPC over TCP, session and
//! extranonce management, job broadcast, and single-port HTTP multiplexing.

pub mod mux;
pub mod protocol;
pub mod server;

pub use mux::{sniff_first_byte, PrefixStream};
pub use protocol::{Notification, ProtocolError, Request, Response};
pub use server::{JobNotification, ShareSubmission, StratumServer, StratumServerConfig};
