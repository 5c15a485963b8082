//! Entity Records
//!
//! Persisted shape of every lifecycle entity. Each record carries a `version`
//! the store bumps on every committed write; a stale version on commit is a
//! conflict.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::status::{
    ClaimStatus, ContractStatus, DisputeStatus, EscrowStatus, IngestionStatus, ProofStatus,
    ProposalStatus, SubmissionStatus, TaskStatus,
};

/// Entity tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Ingestion,
    Proposal,
    Task,
    Claim,
    Submission,
    Contract,
    Escrow,
    Proof,
    Dispute,
}

impl EntityKind {
    pub const ALL: [EntityKind; 9] = [
        Self::Ingestion,
        Self::Proposal,
        Self::Task,
        Self::Claim,
        Self::Submission,
        Self::Contract,
        Self::Escrow,
        Self::Proof,
        Self::Dispute,
    ];

    /// Table / entity name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingestion => "ingestion",
            Self::Proposal => "proposal",
            Self::Task => "task",
            Self::Claim => "claim",
            Self::Submission => "submission",
            Self::Contract => "contract",
            Self::Escrow => "escrow",
            Self::Proof => "merkle_proof",
            Self::Dispute => "dispute",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record the store can persist
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> &str;

    /// Owning entity, used for child lookups
    fn parent_id(&self) -> Option<&str>;

    fn status_label(&self) -> &'static str;

    fn version(&self) -> u64;

    fn set_version(&mut self, version: u64);
}

macro_rules! entity {
    ($ty:ty, $kind:ident, $id:ident, |$this:ident| $parent:expr) => {
        impl Entity for $ty {
            const KIND: EntityKind = EntityKind::$kind;

            fn id(&self) -> &str {
                &self.$id
            }

            fn parent_id(&self) -> Option<&str> {
                let $this = self;
                $parent
            }

            fn status_label(&self) -> &'static str {
                self.status.as_str()
            }

            fn version(&self) -> u64 {
                self.version
            }

            fn set_version(&mut self, version: u64) {
                self.version = version;
            }
        }
    };
}

/// How a contract is funded.
///
/// Escrow locks the budget in a script-controlled output; commitment pays a
/// hash-lock output embedding the visible pixel hash. A contract uses one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FundingMode {
    #[default]
    Escrow,
    Commitment,
}

impl fmt::Display for FundingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Escrow => write!(f, "escrow"),
            Self::Commitment => write!(f, "commitment"),
        }
    }
}

impl FromStr for FundingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "escrow" => Ok(Self::Escrow),
            "commitment" | "hashlock" => Ok(Self::Commitment),
            _ => Err(format!("unknown funding mode: {}", s)),
        }
    }
}

/// A funded request derived from an inscribed message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ingestion {
    pub id: String,
    pub message: String,
    /// sha256 of the carrier content (hex)
    pub carrier_hash: String,
    /// sha256(message || carrier_hash), hex; fixed once verified
    pub visible_pixel_hash: String,
    #[serde(default)]
    pub status: IngestionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

entity!(Ingestion, Ingestion, id, |_this| None);

/// Task as requested in a proposal, before it is published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub budget_sats: u64,
    #[serde(default)]
    pub skills: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub ingestion_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub budget_sats: u64,
    pub visible_pixel_hash: String,
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub status: ProposalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

entity!(Proposal, Proposal, id, |p| Some(p.ingestion_id.as_str()));

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub proposal_id: String,
    pub contract_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub budget_sats: u64,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub status: TaskStatus,
    /// The one non-terminal claim, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_claim_id: Option<String>,
    /// Paid out by confirmed payout transactions
    #[serde(default)]
    pub paid_sats: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

entity!(Task, Task, task_id, |t| Some(t.proposal_id.as_str()));

impl Task {
    /// Budget not yet paid out
    pub fn unpaid_sats(&self) -> u64 {
        self.budget_sats.saturating_sub(self.paid_sats)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub claim_id: String,
    pub task_id: String,
    pub agent_id: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub status: ClaimStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

entity!(Claim, Claim, claim_id, |c| Some(c.task_id.as_str()));

impl Claim {
    /// Active and past its TTL
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ClaimStatus::Active && now >= self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub submission_id: String,
    pub claim_id: String,
    pub task_id: String,
    #[serde(default)]
    pub deliverables: serde_json::Value,
    #[serde(default)]
    pub completion_proof: String,
    #[serde(default)]
    pub status: SubmissionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

entity!(Submission, Submission, submission_id, |s| Some(
    s.claim_id.as_str()
));

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub contract_id: String,
    pub proposal_id: String,
    pub visible_pixel_hash: String,
    pub total_budget_sats: u64,
    /// Stored status; `funded` is derived from proofs on read
    #[serde(default)]
    pub status: ContractStatus,
    #[serde(default)]
    pub funding_mode: FundingMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escrow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    /// Built but unconfirmed payout; settles when the monitor confirms it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_payout: Option<PendingPayout>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

/// Amount a payout releases against one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAllocation {
    pub task_id: String,
    pub amount_sats: u64,
}

/// An unsigned payout transaction awaiting confirmation. Building another
/// payout replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPayout {
    pub txid: String,
    pub allocations: Vec<TaskAllocation>,
    pub payouts_total: u64,
    /// Escrow change output, which holds the balance once confirmed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_vout: Option<u32>,
    #[serde(default)]
    pub change_sats: u64,
    pub built_at: DateTime<Utc>,
}

entity!(Contract, Contract, contract_id, |c| Some(
    c.proposal_id.as_str()
));

/// Spending-condition template of an escrow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EscrowType {
    #[serde(rename = "multisig_2of3")]
    Multisig2of3,
    #[serde(rename = "timelock")]
    Timelock,
    #[serde(rename = "taproot")]
    Taproot,
}

impl fmt::Display for EscrowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Multisig2of3 => write!(f, "multisig_2of3"),
            Self::Timelock => write!(f, "timelock"),
            Self::Taproot => write!(f, "taproot"),
        }
    }
}

impl FromStr for EscrowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "multisig_2of3" | "multisig" => Ok(Self::Multisig2of3),
            "timelock" => Ok(Self::Timelock),
            "taproot" => Ok(Self::Taproot),
            _ => Err(format!("unknown escrow type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowContract {
    pub escrow_id: String,
    pub contract_id: String,
    pub escrow_type: EscrowType,
    /// Compressed pubkeys (hex)
    pub participants: Vec<String>,
    pub required_signatures: u8,
    pub amount_sats: u64,
    /// Unreleased balance once funded
    pub remaining_sats: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timelock: Option<u32>,
    pub funding_address: String,
    pub script_pubkey_hex: String,
    /// Witness script (P2WSH) or refund leaf script (taproot)
    pub script_hex: String,
    pub descriptor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub funding_txid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub funding_vout: Option<u32>,
    /// Output currently holding the escrow balance, `txid:vout`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_outpoint: Option<String>,
    /// Wallets that funded the escrow; refunds go back to them pro rata
    #[serde(default)]
    pub payers: Vec<Payer>,
    /// Confirmed payout transactions
    #[serde(default)]
    pub payout_txids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_txid: Option<String>,
    #[serde(default)]
    pub status: EscrowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payer {
    pub address: String,
    pub amount_sats: u64,
}

entity!(EscrowContract, Escrow, escrow_id, |e| Some(
    e.contract_id.as_str()
));

/// What a tracked transaction does for its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TxRole {
    #[default]
    Funding,
    Payout,
    Refund,
}

impl fmt::Display for TxRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Funding => "funding",
            Self::Payout => "payout",
            Self::Refund => "refund",
        })
    }
}

/// Side the sibling hash sits on when hashing up one level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiblingPosition {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    /// Sibling hash, display (big-endian) hex like a txid
    pub hash: String,
    pub position: SiblingPosition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Display hex txid
    pub tx_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_id: Option<String>,
    #[serde(default)]
    pub role: TxRole,
    pub block_height: u32,
    /// Display hex root as reported by the chain for `block_height`
    #[serde(default)]
    pub block_header_merkle_root: String,
    pub proof_path: Vec<ProofStep>,
    #[serde(default, rename = "confirmation_status")]
    pub status: ProofStatus,
    #[serde(default)]
    pub confirmations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
}

entity!(MerkleProof, Proof, tx_id, |p| p.contract_id.as_deref());

/// Arbitrator ruling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteDecision {
    /// Reverse the payout
    Claimant,
    /// Keep the payout as is
    Respondent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub arbitrator: String,
    pub decision: VoteDecision,
    pub weight: u32,
    pub cast_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeOutcome {
    UpholdPayout,
    ReversePayout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispute {
    pub dispute_id: String,
    pub contract_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<String>,
    pub claimant: String,
    pub respondent: String,
    pub evidence: String,
    pub arbitrators: Vec<String>,
    pub quorum: usize,
    #[serde(default)]
    pub votes: Vec<Vote>,
    #[serde(default)]
    pub status: DisputeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<DisputeOutcome>,
    #[serde(default)]
    pub appealed: bool,
    /// Voting round, 1 before any appeal
    pub round: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

entity!(Dispute, Dispute, dispute_id, |d| Some(d.contract_id.as_str()));

/// Generate a prefixed record id
pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}
