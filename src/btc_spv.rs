//! Merkle Inclusion Proof Verification
//!
//! A MerkleProof says "tx T is in the block at height H". Verification hashes
//! T up the proof path and compares the result with the merkle root the chain
//! reports for H. Only a chain query can advance a proof's status.

use bitcoin::hashes::Hash;
use bitcoin::{TxMerkleNode, Txid};
use chrono::Utc;
use futures_util::future::join_all;
use sha2::{Digest, Sha256};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::chain::{confirmation_depth, ChainClient, ChainError};
use crate::types::{MerkleProof, ProofStatus, ProofStep, SiblingPosition};

/// Deepest path a real block can produce (2^32 txs)
const MAX_PROOF_DEPTH: usize = 32;

/// Proof verification errors
#[derive(Debug, Error)]
pub enum ProofError {
    #[error("invalid hash {0}")]
    InvalidHash(String),

    #[error("proof path too long: {0} steps")]
    PathTooLong(usize),

    #[error("merkle root mismatch for {tx_id} at height {height}")]
    RootMismatch { tx_id: String, height: u32 },

    #[error("claimed header root {claimed} differs from chain root {actual} at height {height}")]
    HeaderMismatch {
        claimed: String,
        actual: String,
        height: u32,
    },

    #[error("chain unavailable: {0}")]
    Upstream(#[from] ChainError),
}

/// Double SHA256 (Bitcoin standard)
fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

/// Parent node of two children in internal byte order
fn merkle_parent(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut combined = [0u8; 64];
    combined[0..32].copy_from_slice(left);
    combined[32..64].copy_from_slice(right);
    double_sha256(&combined)
}

/// Hash one tree level into the next; an odd last node pairs with itself
fn next_level(level: &[[u8; 32]]) -> Vec<[u8; 32]> {
    level
        .chunks(2)
        .map(|pair| {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            merkle_parent(left, right)
        })
        .collect()
}

/// Display hex (as shown by explorers) to internal byte order
fn internal_bytes(display_hex: &str) -> Result<[u8; 32], ProofError> {
    Txid::from_str(display_hex)
        .map(|txid| txid.to_byte_array())
        .map_err(|_| ProofError::InvalidHash(display_hex.to_string()))
}

/// Hash `tx_id` up `path` to the root it implies
pub fn compute_root(tx_id: &str, path: &[ProofStep]) -> Result<TxMerkleNode, ProofError> {
    if path.len() > MAX_PROOF_DEPTH {
        return Err(ProofError::PathTooLong(path.len()));
    }

    let mut current = internal_bytes(tx_id)?;

    for step in path {
        let sibling = internal_bytes(&step.hash)?;
        current = match step.position {
            SiblingPosition::Left => merkle_parent(&sibling, &current),
            SiblingPosition::Right => merkle_parent(&current, &sibling),
        };
    }

    Ok(TxMerkleNode::from_byte_array(current))
}

/// Merkle root of a block's transactions, in block order
pub fn merkle_root(txids: &[Txid]) -> Option<TxMerkleNode> {
    if txids.is_empty() {
        return None;
    }

    let mut level: Vec<[u8; 32]> = txids.iter().map(|t| t.to_byte_array()).collect();

    while level.len() > 1 {
        level = next_level(&level);
    }

    Some(TxMerkleNode::from_byte_array(level[0]))
}

/// Proof path for the tx at `index` in a block's transaction list
pub fn build_proof_path(txids: &[Txid], index: usize) -> Option<Vec<ProofStep>> {
    if index >= txids.len() {
        return None;
    }

    let mut level: Vec<[u8; 32]> = txids.iter().map(|t| t.to_byte_array()).collect();
    let mut idx = index;
    let mut path = Vec::new();

    while level.len() > 1 {
        let sibling_idx = if idx % 2 == 0 {
            (idx + 1).min(level.len() - 1)
        } else {
            idx - 1
        };
        let position = if idx % 2 == 0 {
            SiblingPosition::Right
        } else {
            SiblingPosition::Left
        };

        path.push(ProofStep {
            hash: Txid::from_byte_array(level[sibling_idx]).to_string(),
            position,
        });

        level = next_level(&level);
        idx /= 2;
    }

    Some(path)
}

/// Verifies MerkleProofs against headers fetched from the chain
pub struct MerkleProofVerifier {
    chain: Arc<dyn ChainClient>,
    min_confirmations: u32,
}

impl MerkleProofVerifier {
    pub fn new(chain: Arc<dyn ChainClient>, min_confirmations: u32) -> Self {
        Self {
            chain,
            min_confirmations,
        }
    }

    pub fn min_confirmations(&self) -> u32 {
        self.min_confirmations
    }

    /// Check `proof` against the chain and return the updated record.
    ///
    /// The input is never modified; on any error the caller keeps its
    /// last known-good copy.
    pub async fn verify(&self, proof: &MerkleProof) -> Result<MerkleProof, ProofError> {
        let computed = compute_root(&proof.tx_id, &proof.proof_path)?;

        let header = self.chain.get_block_header(proof.block_height).await?;
        let actual = header.merkle_root.to_string();

        if !proof.block_header_merkle_root.is_empty() && proof.block_header_merkle_root != actual {
            warn!(
                tx_id = %proof.tx_id,
                height = proof.block_height,
                "Claimed header root does not match chain"
            );
            return Err(ProofError::HeaderMismatch {
                claimed: proof.block_header_merkle_root.clone(),
                actual,
                height: proof.block_height,
            });
        }

        if computed != header.merkle_root {
            warn!(tx_id = %proof.tx_id, height = proof.block_height, "Merkle root mismatch");
            return Err(ProofError::RootMismatch {
                tx_id: proof.tx_id.clone(),
                height: proof.block_height,
            });
        }

        let tip = self.chain.get_current_height().await?;
        let depth = confirmation_depth(tip, proof.block_height);

        let mut verified = proof.clone();
        verified.block_header_merkle_root = actual;
        verified.confirmations = depth;
        verified.verified_at = Some(Utc::now());
        verified.status = if depth >= self.min_confirmations {
            ProofStatus::Confirmed
        } else {
            ProofStatus::Provisional
        };

        debug!(
            tx_id = %proof.tx_id,
            depth,
            status = %verified.status,
            "Merkle proof verified"
        );

        Ok(verified)
    }

    /// Re-query the chain for an existing proof.
    ///
    /// A tx the chain no longer knows drops back to provisional with zero
    /// depth instead of failing, so callers can keep tracking it.
    pub async fn refresh(&self, proof: &MerkleProof) -> Result<MerkleProof, ProofError> {
        if self.chain.get_tx_confirmations(&proof.tx_id).await?.is_none() {
            info!(tx_id = %proof.tx_id, "Proof tx no longer on chain, reverting to provisional");
            let mut reverted = proof.clone();
            reverted.status = ProofStatus::Provisional;
            reverted.confirmations = 0;
            return Ok(reverted);
        }

        self.verify(proof).await
    }

    /// Verify proofs independently; one failure does not abort the rest
    pub async fn verify_batch(&self, proofs: &[MerkleProof]) -> Vec<Result<MerkleProof, ProofError>> {
        join_all(proofs.iter().map(|proof| self.verify(proof))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{BlockHeaderInfo, MockChainClient};
    use crate::types::TxRole;

    // Block 100,000
    const BLOCK_100K_ROOT: &str = "f3e94742aca4b5ef85488dc37c06c3282295ffec960994b2c0d5ac2a25a95766";
    const BLOCK_100K_TXIDS: [&str; 4] = [
        "8c14f0db3df150123e6f3dbbf30f8b955a8249b62ac1d1ff16284aefa3d06d87",
        "fff2525b8931402dd09222c50775608f75787bd2b87e56995a7bdd30f79702c4",
        "6359f0868171b1d194cbee1af2f16ea598ae8fad666d9b012c8ed2b79a236ec4",
        "e9a66845e05d5abc0ad04ec80f774a7e585c6e8db975962d069a522137b80c1d",
    ];

    fn block_100k() -> Vec<Txid> {
        BLOCK_100K_TXIDS
            .iter()
            .map(|t| Txid::from_str(t).unwrap())
            .collect()
    }

    fn proof_for(txids: &[Txid], index: usize, height: u32) -> MerkleProof {
        MerkleProof {
            tx_id: txids[index].to_string(),
            contract_id: Some("contract_1".into()),
            role: TxRole::Funding,
            block_height: height,
            block_header_merkle_root: String::new(),
            proof_path: build_proof_path(txids, index).unwrap(),
            status: ProofStatus::Provisional,
            confirmations: 0,
            verified_at: None,
            version: 0,
        }
    }

    fn chain_with(root: TxMerkleNode, tip: u32) -> MockChainClient {
        let mut mock = MockChainClient::new();
        mock.expect_get_block_header().returning(move |height| {
            Ok(BlockHeaderInfo {
                height,
                merkle_root: root,
                time: 1_293_623_863,
            })
        });
        mock.expect_get_current_height().returning(move || Ok(tip));
        mock
    }

    #[test]
    fn test_real_block_root() {
        let txids = block_100k();
        let root = merkle_root(&txids).unwrap();
        assert_eq!(root.to_string(), BLOCK_100K_ROOT);

        let reference = bitcoin::merkle_tree::calculate_root(txids.iter().copied()).unwrap();
        assert_eq!(reference.to_byte_array(), root.to_byte_array());
    }

    #[test]
    fn test_every_real_tx_proves_to_root() {
        let txids = block_100k();
        for index in 0..txids.len() {
            let path = build_proof_path(&txids, index).unwrap();
            assert_eq!(path.len(), 2);
            let root = compute_root(&txids[index].to_string(), &path).unwrap();
            assert_eq!(root.to_string(), BLOCK_100K_ROOT, "tx index {}", index);
        }
    }

    #[test]
    fn test_odd_tx_count_duplicates_last() {
        let txids: Vec<Txid> = (0u8..5)
            .map(|i| Txid::from_byte_array(double_sha256(&[i])))
            .collect();
        let root = merkle_root(&txids).unwrap();
        let reference = bitcoin::merkle_tree::calculate_root(txids.iter().copied()).unwrap();
        assert_eq!(reference.to_byte_array(), root.to_byte_array());

        let path = build_proof_path(&txids, 4).unwrap();
        assert_eq!(compute_root(&txids[4].to_string(), &path).unwrap(), root);
    }

    #[test]
    fn test_single_tx_block() {
        let txid = Txid::from_byte_array([7u8; 32]);
        let path = build_proof_path(&[txid], 0).unwrap();
        assert!(path.is_empty());
        assert_eq!(
            merkle_root(&[txid]).unwrap().to_byte_array(),
            txid.to_byte_array()
        );
    }

    #[test]
    fn test_malformed_hash_rejected() {
        let step = ProofStep {
            hash: "zz".into(),
            position: SiblingPosition::Left,
        };
        assert!(matches!(
            compute_root(BLOCK_100K_TXIDS[0], &[step]),
            Err(ProofError::InvalidHash(_))
        ));
    }

    #[tokio::test]
    async fn test_verify_depth_threshold() {
        let txids = block_100k();
        let root = merkle_root(&txids).unwrap();
        let proof = proof_for(&txids, 2, 100_000);

        // tip == height: one confirmation
        let verifier = MerkleProofVerifier::new(Arc::new(chain_with(root, 100_000)), 6);
        let shallow = verifier.verify(&proof).await.unwrap();
        assert_eq!(shallow.status, ProofStatus::Provisional);
        assert_eq!(shallow.confirmations, 1);
        assert_eq!(shallow.block_header_merkle_root, BLOCK_100K_ROOT);

        let verifier = MerkleProofVerifier::new(Arc::new(chain_with(root, 100_005)), 6);
        let deep = verifier.verify(&proof).await.unwrap();
        assert_eq!(deep.status, ProofStatus::Confirmed);
        assert_eq!(deep.confirmations, 6);
    }

    #[tokio::test]
    async fn test_verify_mismatch_leaves_input_untouched() {
        let txids = block_100k();
        let proof = proof_for(&txids, 1, 100_000);
        let wrong_root = TxMerkleNode::from_byte_array([9u8; 32]);

        let verifier = MerkleProofVerifier::new(Arc::new(chain_with(wrong_root, 100_010)), 1);
        let result = verifier.verify(&proof).await;

        assert!(matches!(result, Err(ProofError::RootMismatch { .. })));
        assert_eq!(proof.status, ProofStatus::Provisional);
        assert!(proof.verified_at.is_none());
    }

    #[tokio::test]
    async fn test_upstream_failure_is_not_confirmation() {
        let txids = block_100k();
        let proof = proof_for(&txids, 0, 100_000);

        let mut mock = MockChainClient::new();
        mock.expect_get_block_header()
            .returning(|_| Err(ChainError::Unavailable("rate limited".into())));

        let verifier = MerkleProofVerifier::new(Arc::new(mock), 1);
        assert!(matches!(
            verifier.verify(&proof).await,
            Err(ProofError::Upstream(_))
        ));
    }

    #[tokio::test]
    async fn test_batch_partial_failure() {
        let txids = block_100k();
        let root = merkle_root(&txids).unwrap();

        let good = proof_for(&txids, 0, 100_000);
        let mut bad = proof_for(&txids, 3, 100_000);
        bad.proof_path.reverse();

        let verifier = MerkleProofVerifier::new(Arc::new(chain_with(root, 100_001)), 2);
        let results = verifier.verify_batch(&[good, bad]).await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().status, ProofStatus::Confirmed);
        assert!(results[1].is_err());
    }

    #[tokio::test]
    async fn test_refresh_reverts_reorged_tx() {
        let txids = block_100k();
        let mut proof = proof_for(&txids, 0, 100_000);
        proof.status = ProofStatus::Confirmed;
        proof.confirmations = 6;

        let mut mock = MockChainClient::new();
        mock.expect_get_tx_confirmations().returning(|_| Ok(None));

        let verifier = MerkleProofVerifier::new(Arc::new(mock), 1);
        let refreshed = verifier.refresh(&proof).await.unwrap();
        assert_eq!(refreshed.status, ProofStatus::Provisional);
        assert_eq!(refreshed.confirmations, 0);
    }
}
