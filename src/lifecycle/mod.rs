//! Contract Lifecycle Module
//!
//! - `service` - the orchestrator over proposals, tasks, claims and contracts
//! - `events` - channel the background loops report through
//! - `sweeper` - claim TTL and contract deadline sweep
//! - `ingest` - wish intake behind the `ImageScanner` capability
//! - `clock`, `locks` - time source and per-entity serialization

pub mod clock;
pub mod events;
pub mod ingest;
pub mod locks;
pub mod service;
pub mod sweeper;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use events::{event_channel, EventReceiver, EventSender, LifecycleEvent};
pub use ingest::{FixedMessageScanner, ImageScanner, ScanError, TextCarrierScanner};
pub use locks::EntityLocks;
pub use service::{
    derive_status, is_funded, ApprovalTerms, ContractLifecycle, EscrowTerms, FundingStatus,
    FundraisePsbtRequest, LifecycleSettings, NewProposal, PayoutPsbtRequest, RefundRequest,
    ReviewDecision, TaskPayout, WorkSubmission,
};
pub use sweeper::{ClaimSweeper, SweepReport};
