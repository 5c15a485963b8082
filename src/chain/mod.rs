//! Chain-Data Collaborator
//!
//! The engine reads the chain through [`ChainClient`] only:
//! - `EsploraClient` - Esplora REST API (testnet/mainnet)
//! - `MemoryChain` - simulated chain for devnet and tests
//!
//! Any call may be slow or fail transiently. Wrap a client in
//! [`RetryingChainClient`] to get per-request timeouts and backoff.

pub mod esplora;
pub mod memory;
pub mod retry;

use async_trait::async_trait;
use bitcoin::TxMerkleNode;
use std::time::Duration;
use thiserror::Error;

use crate::types::{MerkleProof, TxRole};

pub use esplora::EsploraClient;
pub use memory::{random_txid, MemoryChain};
pub use retry::{with_retry, RetryPolicy, RetryingChainClient};

/// Chain client errors
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain backend unavailable: {0}")]
    Unavailable(String),

    #[error("chain request timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("not found on chain: {0}")]
    NotFound(String),

    #[error("parse error: {0}")]
    Parse(String),
}

impl ChainError {
    /// Worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Timeout(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::NotFound(_) | Self::Parse(_) => false,
        }
    }
}

/// Header fields the engine needs for a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeaderInfo {
    pub height: u32,
    pub merkle_root: TxMerkleNode,
    pub time: u32,
}

/// Read-only view of the chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn get_block_header(&self, height: u32) -> Result<BlockHeaderInfo, ChainError>;

    /// Depth of `tx_id` (display hex). `Some(0)` is mempool; `None` means the
    /// chain does not know the tx, which after a confirmation signals a reorg.
    async fn get_tx_confirmations(&self, tx_id: &str) -> Result<Option<u32>, ChainError>;

    async fn get_current_height(&self) -> Result<u32, ChainError>;

    /// Unverified inclusion proof for a mined tx, `None` while unconfirmed
    async fn get_merkle_proof(&self, tx_id: &str, role: TxRole) -> Result<Option<MerkleProof>, ChainError>;
}

/// Bitcoin's depth convention: a tx in the tip block has one confirmation
pub fn confirmation_depth(tip: u32, block_height: u32) -> u32 {
    if tip < block_height {
        0
    } else {
        tip - block_height + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmation_depth() {
        assert_eq!(confirmation_depth(100, 100), 1);
        assert_eq!(confirmation_depth(105, 100), 6);
        assert_eq!(confirmation_depth(99, 100), 0);
    }

    #[test]
    fn test_transient_classification() {
        assert!(ChainError::Unavailable("503".into()).is_transient());
        assert!(ChainError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!ChainError::Parse("bad hex".into()).is_transient());
    }
}
