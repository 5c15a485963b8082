//! Wishfund Engine - Settlement Verification and Contract Lifecycle
//!
//! Turns an ingested wish into a funded, task-based contract and settles it
//! on Bitcoin.
//!
//! ## Components
//!
//! 1. **Lifecycle** - Proposals, tasks, claims, submissions and contracts
//! 2. **SPV** - Merkle inclusion proofs against chain-reported roots
//! 3. **Scripts** - Hash-lock, multisig and timelock output scripts
//! 4. **PSBT Builder** - Unsigned payout, fund-raise and refund transactions
//! 5. **Escrow / Disputes** - Escrow state machine and weighted arbitration
//! 6. **Monitor** - Confirmation tracking and reorg detection
//!
//! Signing happens outside the engine; every transaction it builds is an
//! unsigned PSBT.

pub mod api;
pub mod btc_spv;
pub mod chain;
pub mod common;
pub mod dispute;
pub mod escrow;
pub mod lifecycle;
pub mod monitor;
pub mod psbt;
pub mod script;
pub mod storage;
pub mod types;

// Re-exports: common infrastructure
pub use common::{ErrorKind, Result, WishfundConfig, WishfundError};

// Re-exports: lifecycle orchestration
pub use lifecycle::{ClaimSweeper, ContractLifecycle, LifecycleEvent, LifecycleSettings};

// Re-exports: Bitcoin SPV
pub use btc_spv::{MerkleProofVerifier, ProofError};

// Re-exports: PSBT building
pub use psbt::{BuiltPsbt, BuilderError, FundingProvider, PsbtBuilder, Utxo};

// Re-exports: chain access
pub use chain::{ChainClient, ChainError, EsploraClient, MemoryChain};

// Re-exports: storage
pub use storage::{open_store, ContractStore, MemoryContractStore, SqliteContractStore};

// Re-exports: monitor
pub use monitor::{TrackedTx, TransactionMonitor};
