//! Shared Types Module
//!
//! Status vocabulary, entity records and amount helpers used across the
//! lifecycle engine.

pub mod records;
pub mod status;
pub mod units;

// Re-exports for convenience
pub use records::{
    new_id, Claim, Contract, Dispute, DisputeOutcome, Entity, EntityKind, EscrowContract,
    EscrowType, FundingMode, Ingestion, MerkleProof, Payer, PendingPayout, ProofStep, Proposal,
    SiblingPosition, Submission, Task, TaskAllocation, TaskSpec, TxRole, Vote, VoteDecision,
};
pub use status::{
    ensure_transition, ClaimStatus, ContractStatus, DisputeStatus, EscrowStatus, IngestionStatus,
    ProofStatus, ProposalStatus, StatusMachine, SubmissionStatus, TaskStatus,
};
pub use units::{checked_total, parse_sats, sats_to_btc_string, sats_to_display, SATS_PER_BTC};
