//! In-memory Bitcoin RPC used by generator and orchestrator tests.

use std::sync::Mutex;

use crate::error::RpcError;
use crate::types::BlockTemplate;
use crate::BitcoinRpc;

/// Deterministic [`BitcoinRpc`] double. Templates are swapped with
/// [`MockRpc::set_template`]; submitted blocks accumulate for inspection.
#[derive(Default)]
pub struct MockRpc {
    template: Mutex<BlockTemplate>,
    submitted: Mutex<Vec<String>>,
    fail_templates: Mutex<bool>,
    reject_blocks: Mutex<Option<String>>,
}

impl MockRpc {
    pub fn new(template: BlockTemplate) -> Self {
        Self {
            template: Mutex::new(template),
            ..Default::default()
        }
    }

    pub fn set_template(&self, template: BlockTemplate) {
        *self.template.lock().unwrap() = template;
    }

    /// Make `get_block_template` fail until called with `false` again.
    pub fn set_fail_templates(&self, fail: bool) {
        *self.fail_templates.lock().unwrap() = fail;
    }

    /// Make `submit_block` reject with the given reason.
    pub fn set_reject_blocks(&self, reason: Option<&str>) {
        *self.reject_blocks.lock().unwrap() = reason.map(str::to_string);
    }

    /// Blocks submitted so far, in order.
    pub fn submitted_blocks(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }
}

impl BitcoinRpc for MockRpc {
    async fn get_block_template(&self) -> Result<BlockTemplate, RpcError> {
        if *self.fail_templates.lock().unwrap() {
            return Err(RpcError::Rpc {
                code: -9,
                message: "mock outage".into(),
                method: "getblocktemplate".into(),
            });
        }
        Ok(self.template.lock().unwrap().clone())
    }

    async fn submit_block(&self, block_hex: &str) -> Result<(), RpcError> {
        if let Some(reason) = self.reject_blocks.lock().unwrap().clone() {
            return Err(RpcError::BlockRejected { reason });
        }
        self.submitted.lock().unwrap().push(block_hex.to_string());
        Ok(())
    }

    async fn get_block_count(&self) -> Result<i64, RpcError> {
        Ok(self.template.lock().unwrap().height - 1)
    }

    async fn get_best_block_hash(&self) -> Result<String, RpcError> {
        Ok(self.template.lock().unwrap().previous_block_hash.clone())
    }
}
