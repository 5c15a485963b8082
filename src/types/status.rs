//! Entity Status Vocabulary
//!
//! Every status field is a closed enum. Legal moves live in one table per
//! entity (`StatusMachine::TRANSITIONS`) so an illegal transition is a single
//! lookup instead of scattered checks.
//!
//! ```text
//! Ingestion   pending → verified | invalid
//! Proposal    pending → approved | rejected ; approved → published
//! Contract    created → active → funded → expired
//! Task        available → claimed → submitted → approved → published
//!             (claimed → available on expiry, submitted → available on reject)
//! Claim       active → submitted → complete | rejected ; active → expired
//! Submission  pending_review → reviewed | approved | rejected
//! MerkleProof provisional ⇄ confirmed (back only on reorg)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::common::WishfundError;

/// A status enum with an explicit allowed-transitions table
pub trait StatusMachine: Copy + Eq + fmt::Debug + fmt::Display + 'static {
    /// Every permitted `(from, to)` pair
    const TRANSITIONS: &'static [(Self, Self)];

    fn can_transition_to(self, next: Self) -> bool {
        Self::TRANSITIONS.contains(&(self, next))
    }

    /// No outgoing transitions
    fn is_terminal(self) -> bool {
        !Self::TRANSITIONS.iter().any(|(from, _)| *from == self)
    }
}

/// Reject `current → next` unless the table allows it
pub fn ensure_transition<S: StatusMachine>(
    entity: &'static str,
    id: &str,
    current: S,
    next: S,
    action: &'static str,
) -> Result<(), WishfundError> {
    if current.can_transition_to(next) {
        Ok(())
    } else {
        Err(WishfundError::invalid_state(entity, id, current, action))
    }
}

macro_rules! status_strings {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($name), other)),
                }
            }
        }
    };
}

/// Ingested wish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    #[default]
    Pending,
    Verified,
    Invalid,
}

status_strings!(IngestionStatus {
    Pending => "pending",
    Verified => "verified",
    Invalid => "invalid",
});

impl StatusMachine for IngestionStatus {
    const TRANSITIONS: &'static [(Self, Self)] = &[
        (Self::Pending, Self::Verified),
        (Self::Pending, Self::Invalid),
    ];
}

/// Plan of work against a wish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    Published,
}

status_strings!(ProposalStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
    Published => "published",
});

impl StatusMachine for ProposalStatus {
    const TRANSITIONS: &'static [(Self, Self)] = &[
        (Self::Pending, Self::Approved),
        (Self::Pending, Self::Rejected),
        (Self::Approved, Self::Published),
    ];
}

/// One unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Available,
    Claimed,
    Submitted,
    Approved,
    Published,
}

status_strings!(TaskStatus {
    Available => "available",
    Claimed => "claimed",
    Submitted => "submitted",
    Approved => "approved",
    Published => "published",
});

impl StatusMachine for TaskStatus {
    const TRANSITIONS: &'static [(Self, Self)] = &[
        (Self::Available, Self::Claimed),
        (Self::Claimed, Self::Submitted),
        // claim expired
        (Self::Claimed, Self::Available),
        (Self::Submitted, Self::Approved),
        // submission rejected
        (Self::Submitted, Self::Available),
        (Self::Approved, Self::Published),
    ];
}

/// Temporary lock on a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    #[default]
    Active,
    Submitted,
    Complete,
    Expired,
    Rejected,
}

status_strings!(ClaimStatus {
    Active => "active",
    Submitted => "submitted",
    Complete => "complete",
    Expired => "expired",
    Rejected => "rejected",
});

impl StatusMachine for ClaimStatus {
    const TRANSITIONS: &'static [(Self, Self)] = &[
        (Self::Active, Self::Submitted),
        (Self::Active, Self::Expired),
        (Self::Submitted, Self::Complete),
        (Self::Submitted, Self::Rejected),
    ];
}

/// Deliverable for a claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    #[default]
    PendingReview,
    Reviewed,
    Approved,
    Rejected,
}

status_strings!(SubmissionStatus {
    PendingReview => "pending_review",
    Reviewed => "reviewed",
    Approved => "approved",
    Rejected => "rejected",
});

impl StatusMachine for SubmissionStatus {
    const TRANSITIONS: &'static [(Self, Self)] = &[
        (Self::PendingReview, Self::Reviewed),
        (Self::PendingReview, Self::Approved),
        (Self::PendingReview, Self::Rejected),
        (Self::Reviewed, Self::Approved),
        (Self::Reviewed, Self::Rejected),
    ];
}

/// Escrow container for a proposal's tasks.
///
/// The stored status only moves forward. Whether a contract is funded right
/// now is derived from its MerkleProofs, so a reorg shows up on read without
/// walking the stored status back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    #[default]
    Created,
    Active,
    Funded,
    Expired,
}

status_strings!(ContractStatus {
    Created => "created",
    Active => "active",
    Funded => "funded",
    Expired => "expired",
});

impl StatusMachine for ContractStatus {
    const TRANSITIONS: &'static [(Self, Self)] = &[
        (Self::Created, Self::Active),
        (Self::Created, Self::Expired),
        (Self::Active, Self::Funded),
        (Self::Active, Self::Expired),
        (Self::Funded, Self::Expired),
    ];
}

impl ContractStatus {
    /// Claims are only accepted on live contracts
    pub fn accepts_claims(&self) -> bool {
        matches!(self, Self::Active | Self::Funded)
    }
}

/// Inclusion evidence for a funding/payout transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProofStatus {
    #[default]
    Provisional,
    Confirmed,
}

status_strings!(ProofStatus {
    Provisional => "provisional",
    Confirmed => "confirmed",
});

impl StatusMachine for ProofStatus {
    const TRANSITIONS: &'static [(Self, Self)] = &[
        (Self::Provisional, Self::Confirmed),
        // reorg
        (Self::Confirmed, Self::Provisional),
    ];
}

/// On-chain spending condition for a contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    #[default]
    Created,
    /// Funding tx attached, waiting for depth
    Active,
    Funded,
    PaidOut,
    Expired,
    Refunded,
}

status_strings!(EscrowStatus {
    Created => "created",
    Active => "active",
    Funded => "funded",
    PaidOut => "paid_out",
    Expired => "expired",
    Refunded => "refunded",
});

impl StatusMachine for EscrowStatus {
    const TRANSITIONS: &'static [(Self, Self)] = &[
        (Self::Created, Self::Active),
        (Self::Created, Self::Expired),
        (Self::Active, Self::Funded),
        (Self::Active, Self::Expired),
        // funding tx reorged out before settlement
        (Self::Funded, Self::Active),
        (Self::Funded, Self::PaidOut),
        (Self::Funded, Self::Expired),
        // mutual release
        (Self::Funded, Self::Refunded),
        (Self::Expired, Self::Refunded),
    ];
}

/// Contested submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    #[default]
    Open,
    Voting,
    Resolved,
    Appealed,
}

status_strings!(DisputeStatus {
    Open => "open",
    Voting => "voting",
    Resolved => "resolved",
    Appealed => "appealed",
});

impl StatusMachine for DisputeStatus {
    const TRANSITIONS: &'static [(Self, Self)] = &[
        (Self::Open, Self::Voting),
        (Self::Voting, Self::Resolved),
        (Self::Resolved, Self::Appealed),
        (Self::Appealed, Self::Voting),
    ];
}
