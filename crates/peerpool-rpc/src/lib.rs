//! Bitcoin Core JSON-RPC client.
//!
//! The pool trusts the upstream node for block templates and final block
//! acceptance; this crate covers exactly the four methods the pool calls
//! plus a mock implementation for tests.

pub mod client;
pub mod error;
pub mod mock;
pub mod types;

pub use client::{RpcClient, RpcConfig};
pub use error::RpcError;
pub use mock::MockRpc;
pub use types::{BlockTemplate, TemplateTransaction};

/// The interface to bitcoind. The work generator and orchestrator are
/// generic over this so tests can swap in [`MockRpc`].
pub trait BitcoinRpc: Send + Sync {
    fn get_block_template(
        &self,
    ) -> impl std::future::Future<Output = Result<BlockTemplate, RpcError>> + Send;

    /// Submit a serialized block (hex). A rejection by the node surfaces as
    /// [`RpcError::BlockRejected`] and must never be retried.
    fn submit_block(
        &self,
        block_hex: &str,
    ) -> impl std::future::Future<Output = Result<(), RpcError>> + Send;

    fn get_block_count(&self) -> impl std::future::Future<Output = Result<i64, RpcError>> + Send;

    fn get_best_block_hash(
        &self,
    ) -> impl std::future::Future<Output = Result<String, RpcError>> + Send;
}
