//! Lifecycle Events
//!
//! Background loops never touch entities directly. They report what they saw
//! on this channel and the orchestrator applies the state change.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::types::TxRole;

/// Channel depth between the background loops and the orchestrator
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Tracked tx reached its required depth
    TxConfirmed {
        tx_id: String,
        role: TxRole,
        owner_id: String,
        confirmations: u32,
    },
    /// A confirmed tx disappeared from the chain
    TxReorged {
        tx_id: String,
        role: TxRole,
        owner_id: String,
    },
    /// An active claim outlived its TTL
    ClaimExpired { claim_id: String, task_id: String },
    /// A contract passed its deadline
    ContractExpired { contract_id: String },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TxConfirmed { .. } => "tx_confirmed",
            Self::TxReorged { .. } => "tx_reorged",
            Self::ClaimExpired { .. } => "claim_expired",
            Self::ContractExpired { .. } => "contract_expired",
        }
    }
}

pub type EventSender = mpsc::Sender<LifecycleEvent>;
pub type EventReceiver = mpsc::Receiver<LifecycleEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}
