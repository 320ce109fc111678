//! RPC error taxonomy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("HTTP error calling {method}: {source}")]
    Http {
        method: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP status {status} calling {method}: {body}")]
    HttpStatus {
        method: String,
        status: u16,
        body: String,
    },

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("RPC error {code} calling {method}: {message}")]
    Rpc {
        code: i64,
        message: String,
        method: String,
    },

    #[error("no result in response to {0}")]
    NoResult(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("block rejected: {reason}")]
    BlockRejected { reason: String },
}

impl RpcError {
    /// Transient failures are worth a retry with backoff; the rest are not.
    pub fn is_transient(&self) -> bool {
        match self {
            RpcError::Http { .. } | RpcError::HttpStatus { .. } => true,
            RpcError::Rpc { .. }
            | RpcError::Json(_)
            | RpcError::NoResult(_)
            | RpcError::AuthFailed
            | RpcError::BlockRejected { .. } => false,
        }
    }
}
