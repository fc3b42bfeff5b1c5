//! Error types shared across the indexing core.

use thiserror::Error;

/// Crate-wide result alias, mirroring the `CoreResult<T>` pattern used by the
/// chain core this indexer was grown alongside.
pub type Result<T> = std::result::Result<T, IndexerError>;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("no healthy RPC nodes available")]
    NoHealthyNodes,

    #[error("all RPC nodes failed for this call")]
    AllNodesFailed,

    #[error("rate limiter error: {0}")]
    RateLimiterError(String),

    #[error("upstream error from {node}: {cause}")]
    UpstreamError { node: String, cause: String },

    #[error("reorg detected at height {at}")]
    ReorgError { at: u64 },

    #[error("deep reorg: no common ancestor found within {scanned} blocks of {at}")]
    DeepReorgNotFound { at: u64, scanned: u64 },

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("store unreachable: {0}")]
    StoreUnreachable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("checkpoint file error: {0}")]
    Checkpoint(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IndexerError {
    /// Transient errors are the ones the RPC pool absorbs at its own boundary
    /// (retried against another node) rather than surfacing to the pipeline.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IndexerError::UpstreamError { .. }
                | IndexerError::NoHealthyNodes
                | IndexerError::AllNodesFailed
                | IndexerError::RateLimiterError(_)
        )
    }

    /// Fatal errors are never retried in place; they must surface to the
    /// supervisor / rollback protocol.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IndexerError::ReorgError { .. }
                | IndexerError::DeepReorgNotFound { .. }
                | IndexerError::SchemaViolation(_)
                | IndexerError::Cancelled
        )
    }

    pub fn classify_upstream(node: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        let cause = cause.to_string();
        let lower = cause.to_lowercase();
        if lower.contains("429") || lower.contains("too many request") || lower.contains("limit exceeded") {
            IndexerError::RateLimiterError(cause)
        } else {
            IndexerError::UpstreamError { node: node.into(), cause }
        }
    }
}
