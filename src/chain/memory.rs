//! Simulated Chain
//!
//! Blocks with real merkle roots over synthetic txids. Used on devnet and by
//! tests to mine confirmations, drop transactions (reorg) and take the
//! backend offline.

use async_trait::async_trait;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::Txid;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{confirmation_depth, BlockHeaderInfo, ChainClient, ChainError};
use crate::btc_spv::{build_proof_path, merkle_root};
use crate::types::{MerkleProof, ProofStatus, TxRole};

/// Base timestamp of the simulated genesis block
const GENESIS_TIME: u32 = 1_700_000_000;

#[derive(Debug, Clone)]
struct SimBlock {
    txids: Vec<Txid>,
    time: u32,
}

#[derive(Debug, Default)]
struct ChainState {
    blocks: Vec<SimBlock>,
    /// display txid -> height
    index: HashMap<String, u32>,
}

/// In-memory chain
#[derive(Clone)]
pub struct MemoryChain {
    state: Arc<RwLock<ChainState>>,
    offline: Arc<AtomicBool>,
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChain {
    /// New chain holding only a genesis block at height 0
    pub fn new() -> Self {
        let genesis = SimBlock {
            txids: vec![coinbase_txid(0)],
            time: GENESIS_TIME,
        };

        Self {
            state: Arc::new(RwLock::new(ChainState {
                blocks: vec![genesis],
                index: HashMap::new(),
            })),
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulate an outage: every query fails with `Unavailable`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), ChainError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(ChainError::Unavailable("simulated outage".to_string()))
        } else {
            Ok(())
        }
    }

    pub async fn tip(&self) -> u32 {
        let state = self.state.read().await;
        (state.blocks.len() - 1) as u32
    }

    /// Mine one block containing `tx_ids` (after a coinbase); returns its height
    pub async fn mine_block(&self, tx_ids: &[&str]) -> Result<u32, ChainError> {
        let mut state = self.state.write().await;
        let height = state.blocks.len() as u32;

        let mut txids = vec![coinbase_txid(height)];
        for tx_id in tx_ids {
            let txid = Txid::from_str(tx_id)
                .map_err(|e| ChainError::Parse(format!("invalid txid {}: {}", tx_id, e)))?;
            txids.push(txid);
        }

        for tx_id in tx_ids {
            state.index.insert(tx_id.to_string(), height);
        }
        state.blocks.push(SimBlock {
            txids,
            time: GENESIS_TIME + height * 600,
        });

        Ok(height)
    }

    /// Mine `count` empty blocks; returns the new tip
    pub async fn mine_empty(&self, count: u32) -> u32 {
        for _ in 0..count {
            // empty blocks cannot fail to parse
            let _ = self.mine_block(&[]).await;
        }
        self.tip().await
    }

    /// Drop `tx_id` from its block as if that block was reorged out and
    /// replaced by one without it
    pub async fn remove_tx(&self, tx_id: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(height) = state.index.remove(tx_id) else {
            return false;
        };

        if let Some(block) = state.blocks.get_mut(height as usize) {
            block.txids.retain(|t| t.to_string() != tx_id);
        }
        true
    }

    /// Inclusion proof for a mined tx, provisional and unverified
    pub async fn proof_for(&self, tx_id: &str, role: TxRole) -> Option<MerkleProof> {
        let state = self.state.read().await;
        let height = *state.index.get(tx_id)?;
        let block = state.blocks.get(height as usize)?;
        let position = block.txids.iter().position(|t| t.to_string() == tx_id)?;

        Some(MerkleProof {
            tx_id: tx_id.to_string(),
            contract_id: None,
            role,
            block_height: height,
            block_header_merkle_root: String::new(),
            proof_path: build_proof_path(&block.txids, position)?,
            status: ProofStatus::Provisional,
            confirmations: 0,
            verified_at: None,
            version: 0,
        })
    }
}

/// Deterministic coinbase txid per height
fn coinbase_txid(height: u32) -> Txid {
    let mut preimage = b"wishfund-coinbase".to_vec();
    preimage.extend_from_slice(&height.to_le_bytes());
    Txid::from_raw_hash(sha256d::Hash::hash(&preimage))
}

/// Random txid for simulated payments
pub fn random_txid() -> String {
    Txid::from_byte_array(rand::random::<[u8; 32]>()).to_string()
}

#[async_trait]
impl ChainClient for MemoryChain {
    async fn get_block_header(&self, height: u32) -> Result<BlockHeaderInfo, ChainError> {
        self.check_online()?;
        let state = self.state.read().await;
        let block = state
            .blocks
            .get(height as usize)
            .ok_or_else(|| ChainError::NotFound(format!("block at height {}", height)))?;

        let merkle_root = merkle_root(&block.txids)
            .ok_or_else(|| ChainError::Parse(format!("block {} has no transactions", height)))?;

        Ok(BlockHeaderInfo {
            height,
            merkle_root,
            time: block.time,
        })
    }

    async fn get_tx_confirmations(&self, tx_id: &str) -> Result<Option<u32>, ChainError> {
        self.check_online()?;
        let state = self.state.read().await;
        let tip = (state.blocks.len() - 1) as u32;
        Ok(state
            .index
            .get(tx_id)
            .map(|height| confirmation_depth(tip, *height)))
    }

    async fn get_current_height(&self) -> Result<u32, ChainError> {
        self.check_online()?;
        Ok(self.tip().await)
    }

    async fn get_merkle_proof(&self, tx_id: &str, role: TxRole) -> Result<Option<MerkleProof>, ChainError> {
        self.check_online()?;
        Ok(self.proof_for(tx_id, role).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btc_spv::MerkleProofVerifier;

    #[tokio::test]
    async fn test_mined_tx_gains_depth() {
        let chain = MemoryChain::new();
        let txid = random_txid();

        assert_eq!(chain.get_tx_confirmations(&txid).await.unwrap(), None);

        let height = chain.mine_block(&[txid.as_str()]).await.unwrap();
        assert_eq!(height, 1);
        assert_eq!(chain.get_tx_confirmations(&txid).await.unwrap(), Some(1));

        chain.mine_empty(2).await;
        assert_eq!(chain.get_tx_confirmations(&txid).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_generated_proof_verifies() {
        let chain = MemoryChain::new();
        let txids: Vec<String> = (0..5).map(|_| random_txid()).collect();
        let refs: Vec<&str> = txids.iter().map(String::as_str).collect();
        chain.mine_block(&refs).await.unwrap();
        chain.mine_empty(1).await;

        let verifier = MerkleProofVerifier::new(Arc::new(chain.clone()), 2);
        for txid in &txids {
            let proof = chain.proof_for(txid, TxRole::Funding).await.unwrap();
            let verified = verifier.verify(&proof).await.unwrap();
            assert_eq!(verified.status, ProofStatus::Confirmed);
        }
    }

    #[tokio::test]
    async fn test_removed_tx_disappears() {
        let chain = MemoryChain::new();
        let txid = random_txid();
        chain.mine_block(&[txid.as_str()]).await.unwrap();

        assert!(chain.remove_tx(&txid).await);
        assert_eq!(chain.get_tx_confirmations(&txid).await.unwrap(), None);
        assert!(chain.proof_for(&txid, TxRole::Funding).await.is_none());
    }

    #[tokio::test]
    async fn test_offline_chain_fails_transiently() {
        let chain = MemoryChain::new();
        chain.set_offline(true);
        let err = chain.get_current_height().await.unwrap_err();
        assert!(err.is_transient());
    }
}
