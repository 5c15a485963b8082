//! Esplora API Client
//!
//! Confirmation depth, headers and Merkle proofs from a Blockstream-style
//! Esplora REST endpoint. Rate limiting and caching are the endpoint's job.

use async_trait::async_trait;
use bitcoin::consensus::encode::deserialize;
use bitcoin::block::Header;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use super::{confirmation_depth, BlockHeaderInfo, ChainClient, ChainError};
use crate::types::{MerkleProof, ProofStatus, ProofStep, SiblingPosition, TxRole};

/// Esplora API endpoints
pub const MAINNET_URL: &str = "https://blockstream.info/api";
pub const TESTNET_URL: &str = "https://blockstream.info/testnet/api";

/// Esplora HTTP client
#[derive(Debug, Clone)]
pub struct EsploraClient {
    client: Client,
    base_url: String,
}

impl EsploraClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ChainError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_text(&self, path: &str) -> Result<Option<String>, ChainError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.get(&url).send().await?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => {
                Err(ChainError::Unavailable(format!("{} returned {}", path, status)))
            }
            status if !status.is_success() => Err(ChainError::Parse(format!(
                "{} returned {}",
                path, status
            ))),
            _ => Ok(Some(resp.text().await?)),
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<Option<T>, ChainError> {
        match self.get_text(path).await? {
            Some(body) => serde_json::from_str(&body)
                .map(Some)
                .map_err(|e| ChainError::Parse(format!("{}: {}", path, e))),
            None => Ok(None),
        }
    }

    /// Confirmation status of a transaction; `None` if unknown
    pub async fn get_tx_status(&self, txid: &str) -> Result<Option<EsploraTxStatus>, ChainError> {
        self.get_json(&format!("/tx/{}/status", txid)).await
    }

    /// Block hash at `height`
    pub async fn get_block_hash(&self, height: u32) -> Result<String, ChainError> {
        self.get_text(&format!("/block-height/{}", height))
            .await?
            .map(|hash| hash.trim().to_string())
            .ok_or_else(|| ChainError::NotFound(format!("block at height {}", height)))
    }

    /// Parse the raw 80-byte header for `block_hash`
    pub async fn get_raw_header(&self, block_hash: &str) -> Result<Header, ChainError> {
        let header_hex = self
            .get_text(&format!("/block/{}/header", block_hash))
            .await?
            .ok_or_else(|| ChainError::NotFound(format!("block {}", block_hash)))?;

        let bytes = hex::decode(header_hex.trim())
            .map_err(|e| ChainError::Parse(format!("invalid header hex: {}", e)))?;

        deserialize::<Header>(&bytes)
            .map_err(|e| ChainError::Parse(format!("invalid block header: {}", e)))
    }

    /// Build a MerkleProof record for a confirmed transaction.
    ///
    /// Esplora reports the tx position and the sibling hashes leaf to root;
    /// the position's low bit at each level says which side the tx is on.
    pub async fn fetch_merkle_proof(&self, txid: &str, role: TxRole) -> Result<MerkleProof, ChainError> {
        let proof: EsploraMerkleProof = self
            .get_json(&format!("/tx/{}/merkle-proof", txid))
            .await?
            .ok_or_else(|| ChainError::NotFound(format!("merkle proof for {}", txid)))?;

        let mut pos = proof.pos;
        let proof_path = proof
            .merkle
            .into_iter()
            .map(|hash| {
                let position = if pos % 2 == 1 {
                    SiblingPosition::Left
                } else {
                    SiblingPosition::Right
                };
                pos /= 2;
                ProofStep { hash, position }
            })
            .collect();

        Ok(MerkleProof {
            tx_id: txid.to_string(),
            contract_id: None,
            role,
            block_height: proof.block_height,
            block_header_merkle_root: String::new(),
            proof_path,
            status: ProofStatus::Provisional,
            confirmations: 0,
            verified_at: None,
            version: 0,
        })
    }

    /// Unspent outputs paying `address`
    pub async fn get_address_utxos(&self, address: &str) -> Result<Vec<EsploraUtxo>, ChainError> {
        Ok(self
            .get_json(&format!("/address/{}/utxo", address))
            .await?
            .unwrap_or_default())
    }
}

#[async_trait]
impl ChainClient for EsploraClient {
    async fn get_block_header(&self, height: u32) -> Result<BlockHeaderInfo, ChainError> {
        let hash = self.get_block_hash(height).await?;
        let header = self.get_raw_header(&hash).await?;

        Ok(BlockHeaderInfo {
            height,
            merkle_root: header.merkle_root,
            time: header.time,
        })
    }

    async fn get_tx_confirmations(&self, tx_id: &str) -> Result<Option<u32>, ChainError> {
        let status = match self.get_tx_status(tx_id).await? {
            Some(status) => status,
            None => return Ok(None),
        };

        match (status.confirmed, status.block_height) {
            (true, Some(height)) => {
                let tip = self.get_current_height().await?;
                Ok(Some(confirmation_depth(tip, height)))
            }
            _ => Ok(Some(0)),
        }
    }

    async fn get_current_height(&self) -> Result<u32, ChainError> {
        let body = self
            .get_text("/blocks/tip/height")
            .await?
            .ok_or_else(|| ChainError::Unavailable("tip height missing".to_string()))?;

        body.trim()
            .parse()
            .map_err(|_| ChainError::Parse(format!("invalid block height: {}", body)))
    }

    async fn get_merkle_proof(&self, tx_id: &str, role: TxRole) -> Result<Option<MerkleProof>, ChainError> {
        match self.fetch_merkle_proof(tx_id, role).await {
            Ok(proof) => Ok(Some(proof)),
            Err(ChainError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Transaction status
#[derive(Debug, Clone, Deserialize)]
pub struct EsploraTxStatus {
    pub confirmed: bool,
    pub block_height: Option<u32>,
    pub block_hash: Option<String>,
    pub block_time: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EsploraUtxo {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    pub status: EsploraTxStatus,
}

#[derive(Debug, Deserialize)]
struct EsploraMerkleProof {
    block_height: u32,
    merkle: Vec<String>,
    pos: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trimmed() {
        let client = EsploraClient::new("https://blockstream.info/testnet/api/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url(), TESTNET_URL);
    }

    #[test]
    fn test_status_parsing() {
        let json = r#"{"confirmed":true,"block_height":812345,"block_hash":"00ab","block_time":1700000000}"#;
        let status: EsploraTxStatus = serde_json::from_str(json).unwrap();
        assert!(status.confirmed);
        assert_eq!(status.block_height, Some(812_345));

        let mempool: EsploraTxStatus = serde_json::from_str(r#"{"confirmed":false}"#).unwrap();
        assert!(!mempool.confirmed);
        assert!(mempool.block_height.is_none());
    }
}
