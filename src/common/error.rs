//! Common Error Types for the Wishfund Engine
//!
//! Every leaf module owns a `thiserror` enum; all of them fold into
//! [`WishfundError`], which exposes the closed [`ErrorKind`] taxonomy that
//! callers (and the HTTP layer) branch on.

use serde::Serialize;
use thiserror::Error;

use crate::btc_spv::ProofError;
use crate::chain::ChainError;
use crate::dispute::DisputeError;
use crate::escrow::EscrowError;
use crate::lifecycle::ScanError;
use crate::psbt::BuilderError;
use crate::script::ScriptError;
use crate::storage::StorageError;

/// Error taxonomy visible to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Exclusivity violated (claim race, concurrent write)
    Conflict,
    /// Operation attempted from a non-permitted status
    InvalidState,
    InvalidScript,
    InvalidProof,
    InsufficientFunds,
    /// Publish attempted before every task was approved
    Incomplete,
    /// Chain client failure after retries
    UpstreamUnavailable,
    InvalidEscrowState,
    NotFound,
    Validation,
    Storage,
    Internal,
}

/// Root error type
#[derive(Debug, Error)]
pub enum WishfundError {
    #[error("conflict on {entity} {id}: current status is {current}")]
    Conflict {
        entity: &'static str,
        id: String,
        current: String,
    },

    #[error("cannot {action} {entity} {id} while it is {current}")]
    InvalidState {
        entity: &'static str,
        id: String,
        current: String,
        action: &'static str,
    },

    #[error("proposal {proposal_id} incomplete: tasks not approved: {pending:?}")]
    Incomplete {
        proposal_id: String,
        pending: Vec<String>,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Proof(#[from] ProofError),

    #[error(transparent)]
    Builder(#[from] BuilderError),

    #[error(transparent)]
    Escrow(#[from] EscrowError),

    #[error(transparent)]
    Dispute(#[from] DisputeError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("image scan failed: {0}")]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("configuration error: {0}")]
    Config(#[from] super::config::ConfigError),

    #[error("logging error: {0}")]
    Logging(#[from] super::logging::LoggingError),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WishfundError {
    pub fn conflict(entity: &'static str, id: impl Into<String>, current: impl ToString) -> Self {
        Self::Conflict {
            entity,
            id: id.into(),
            current: current.to_string(),
        }
    }

    pub fn invalid_state(
        entity: &'static str,
        id: impl Into<String>,
        current: impl ToString,
        action: &'static str,
    ) -> Self {
        Self::InvalidState {
            entity,
            id: id.into(),
            current: current.to_string(),
            action,
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Taxonomy kind for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::Incomplete { .. } => ErrorKind::Incomplete,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Validation(_) | Self::Config(_) => ErrorKind::Validation,
            Self::Script(_) => ErrorKind::InvalidScript,
            Self::Proof(ProofError::Upstream(_)) => ErrorKind::UpstreamUnavailable,
            Self::Proof(_) => ErrorKind::InvalidProof,
            Self::Builder(BuilderError::InsufficientFunds { .. }) => ErrorKind::InsufficientFunds,
            Self::Builder(BuilderError::Script(_)) => ErrorKind::InvalidScript,
            Self::Builder(BuilderError::Upstream(_)) => ErrorKind::UpstreamUnavailable,
            Self::Builder(_) => ErrorKind::Validation,
            Self::Escrow(e) => e.kind(),
            Self::Dispute(e) => e.kind(),
            Self::Chain(_) => ErrorKind::UpstreamUnavailable,
            Self::Scan(ScanError::Unavailable(_)) => ErrorKind::UpstreamUnavailable,
            Self::Scan(_) => ErrorKind::Validation,
            Self::Storage(StorageError::VersionConflict { .. }) => ErrorKind::Conflict,
            Self::Storage(StorageError::NotFound(_)) => ErrorKind::NotFound,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Logging(_) | Self::Internal(_) | Self::Io(_) => ErrorKind::Internal,
        }
    }

    /// The entity's actual status when a transition was rejected
    pub fn current_status(&self) -> Option<&str> {
        match self {
            Self::Conflict { current, .. } | Self::InvalidState { current, .. } => Some(current),
            Self::Escrow(EscrowError::InvalidEscrowState { status, .. }) => Some(status),
            Self::Dispute(DisputeError::InvalidState { status, .. }) => Some(status),
            _ => None,
        }
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Chain(e) => e.is_transient(),
            Self::Proof(ProofError::Upstream(_)) => true,
            Self::Scan(ScanError::Unavailable(_)) => true,
            Self::Builder(BuilderError::Upstream(e)) => e.is_transient(),
            Self::Storage(StorageError::Connection(_)) => true,
            Self::Io(_) => true,
            _ => false,
        }
    }

    /// Get error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::InvalidState => "INVALID_STATE",
            ErrorKind::InvalidScript => "INVALID_SCRIPT",
            ErrorKind::InvalidProof => "INVALID_PROOF",
            ErrorKind::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorKind::Incomplete => "INCOMPLETE",
            ErrorKind::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ErrorKind::InvalidEscrowState => "INVALID_ESCROW_STATE",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Storage => "STORAGE_ERROR",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }
}

/// Result type alias using WishfundError
pub type Result<T> = std::result::Result<T, WishfundError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_reports_current_status() {
        let err = WishfundError::conflict("task", "task_1", "claimed");
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.current_status(), Some("claimed"));
        assert_eq!(err.error_code(), "CONFLICT");
        assert!(err.to_string().contains("task_1"));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(WishfundError::Chain(ChainError::Unavailable("timeout".into())).is_retryable());
        assert!(!WishfundError::validation("invalid input").is_retryable());
        assert!(!WishfundError::invalid_state("claim", "c", "expired", "submit").is_retryable());
    }

    #[test]
    fn test_builder_kinds() {
        let err: WishfundError = BuilderError::InsufficientFunds {
            required: 50_000,
            available: 40_000,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
    }
}
