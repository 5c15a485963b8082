//! Wish Ingestion
//!
//! A wish arrives as carrier content (an inscribed image) holding an embedded
//! message. The scanner that extracts the message is an external capability;
//! this module hashes the carrier, derives the visible pixel hash and checks
//! the message.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Upper bound on an embedded message
pub const MAX_MESSAGE_LEN: usize = 4096;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("carrier unreadable: {0}")]
    Unreadable(String),

    #[error("scanner unavailable: {0}")]
    Unavailable(String),
}

/// Extracts the embedded message from carrier content
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageScanner: Send + Sync {
    /// `None` when the carrier holds no message
    async fn scan(&self, carrier: &[u8]) -> Result<Option<String>, ScanError>;
}

/// Returns the same message for every carrier
#[derive(Debug, Clone)]
pub struct FixedMessageScanner {
    message: Option<String>,
}

impl FixedMessageScanner {
    pub fn new(message: Option<String>) -> Self {
        Self { message }
    }
}

#[async_trait]
impl ImageScanner for FixedMessageScanner {
    async fn scan(&self, _carrier: &[u8]) -> Result<Option<String>, ScanError> {
        Ok(self.message.clone())
    }
}

/// Treats a UTF-8 carrier as the message itself (text inscriptions)
#[derive(Debug, Default, Clone, Copy)]
pub struct TextCarrierScanner;

#[async_trait]
impl ImageScanner for TextCarrierScanner {
    async fn scan(&self, carrier: &[u8]) -> Result<Option<String>, ScanError> {
        match std::str::from_utf8(carrier) {
            Ok(text) if !text.trim().is_empty() => Ok(Some(text.to_string())),
            Ok(_) => Ok(None),
            Err(e) => Err(ScanError::Unreadable(e.to_string())),
        }
    }
}

/// sha256 of the carrier, hex
pub fn carrier_hash(carrier: &[u8]) -> String {
    hex::encode(Sha256::digest(carrier))
}

/// sha256(message || carrier_hash), hex
pub fn visible_pixel_hash(message: &str, carrier_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(message.as_bytes());
    hasher.update(carrier_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Reason a message cannot back a wish
pub fn validate_message(message: &str) -> Result<(), String> {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return Err("embedded message is empty".to_string());
    }
    if trimmed.len() > MAX_MESSAGE_LEN {
        return Err(format!(
            "embedded message is {} bytes, limit {}",
            trimmed.len(),
            MAX_MESSAGE_LEN
        ));
    }
    if trimmed.chars().any(|c| c.is_control() && c != '\n' && c != '\t') {
        return Err("embedded message contains control characters".to_string());
    }
    Ok(())
}
