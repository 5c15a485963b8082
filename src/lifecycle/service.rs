//! Contract Lifecycle Service
//!
//! The state machine over Ingestion, Proposal, Task, Claim, Submission and
//! Contract. Every operation loads what it needs, validates the whole
//! transition, then commits all touched records in one batch; a rejected
//! operation leaves nothing behind.
//!
//! Exclusivity comes from two layers: a per-entity async lock serializes
//! callers inside this process, and the store's version check rejects a
//! write based on a stale read from anywhere else.
//!
//! Background loops (monitor, sweeper) never touch records directly. They
//! send [`LifecycleEvent`]s which `run_events` applies here.

use bitcoin::Address;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::btc_spv::MerkleProofVerifier;
use crate::chain::ChainClient;
use crate::common::{log_lifecycle_event, Network, Result, WishfundConfig, WishfundError};
use crate::dispute::{DisputeResolution, OpenDispute};
use crate::escrow::{EscrowError, EscrowManager, RefundReason};
use crate::monitor::{TrackedTx, TransactionMonitor};
use crate::psbt::{
    BuiltPsbt, CoinSelection, Commitment, Contribution, FundingProvider,
    FundraiseRequest, Payout, PayoutRequest, PsbtBuilder, Utxo,
};
use crate::storage::{ContractStore, EntityStoreExt, StorageError, WriteBatch};
use crate::types::{
    checked_total, ensure_transition, new_id, Claim, ClaimStatus, Contract, ContractStatus,
    Dispute, DisputeOutcome, EscrowContract, EscrowStatus, EscrowType, FundingMode, Ingestion,
    IngestionStatus, MerkleProof, Payer, PendingPayout, ProofStatus, Proposal, ProposalStatus,
    StatusMachine, Submission, SubmissionStatus, Task, TaskAllocation, TaskSpec, TaskStatus,
    TxRole, VoteDecision,
};

use super::clock::Clock;
use super::events::{EventReceiver, LifecycleEvent};
use super::ingest::{carrier_hash, validate_message, visible_pixel_hash, ImageScanner};
use super::locks::EntityLocks;

/// Tunables the orchestrator needs
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub network: Network,
    pub claim_ttl: Duration,
    pub min_confirmations: u32,
    pub funding_mode: FundingMode,
    pub fee_rate: u64,
    pub dust_limit: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self::from_config(&WishfundConfig::default())
    }
}

impl LifecycleSettings {
    pub fn from_config(config: &WishfundConfig) -> Self {
        Self {
            network: config.network,
            claim_ttl: config.claim_ttl(),
            min_confirmations: config.min_confirmations,
            funding_mode: config.funding_mode,
            fee_rate: config.fee_rate_sat_vb,
            dust_limit: config.dust_limit_sats,
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProposal {
    pub ingestion_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub budget_sats: u64,
    pub tasks: Vec<TaskSpec>,
    /// When given, must equal the wish's hash
    #[serde(default)]
    pub visible_pixel_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowTerms {
    pub escrow_type: EscrowType,
    /// Compressed pubkeys (hex)
    pub participants: Vec<String>,
    #[serde(default)]
    pub timelock: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalTerms {
    /// Defaults to the configured mode
    #[serde(default)]
    pub funding_mode: Option<FundingMode>,
    /// Required for escrow funding, rejected for commitment funding
    #[serde(default)]
    pub escrow: Option<EscrowTerms>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkSubmission {
    #[serde(default)]
    pub deliverables: serde_json::Value,
    #[serde(default)]
    pub completion_proof: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Reject,
    /// Mark reviewed, decide later
    Defer,
}

/// One payout output, released against an approved task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayout {
    pub task_id: String,
    pub address: String,
    pub amount_sats: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutPsbtRequest {
    pub payouts: Vec<TaskPayout>,
    #[serde(default)]
    pub fee_rate: Option<u64>,
    /// Commitment mode: wallet or address paying the outputs
    #[serde(default)]
    pub funding_source: Option<String>,
    /// Commitment mode: defaults to `funding_source`
    #[serde(default)]
    pub change_address: Option<String>,
    /// Commitment mode: value of the hash-lock output, dust limit by default
    #[serde(default)]
    pub commitment_sats: Option<u64>,
    /// Commitment mode: without it the commitment amount goes to change
    #[serde(default = "default_true")]
    pub include_commitment: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundraisePsbtRequest {
    pub contributions: Vec<Contribution>,
    #[serde(default)]
    pub fee_rate: Option<u64>,
    #[serde(default)]
    pub split: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequest {
    /// When given, must be one of the recorded payers
    #[serde(default)]
    pub refund_address: Option<String>,
    /// Participant pubkeys agreeing to unwind; empty means refund after expiry
    #[serde(default)]
    pub approvals: Vec<String>,
    #[serde(default)]
    pub fee_rate: Option<u64>,
}

// ============================================================================
// Views
// ============================================================================

/// Funding state computed from proofs at read time
#[derive(Debug, Clone, Serialize)]
pub struct FundingStatus {
    pub contract_id: String,
    pub status: ContractStatus,
    pub stored_status: ContractStatus,
    pub funding_mode: FundingMode,
    pub funded: bool,
    pub visible_pixel_hash: String,
    pub proofs: Vec<MerkleProof>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escrow: Option<EscrowContract>,
}

/// Funded iff at least one funding proof exists and every one is confirmed
pub fn is_funded(proofs: &[MerkleProof]) -> bool {
    let mut funding = proofs.iter().filter(|p| p.role == TxRole::Funding).peekable();
    funding.peek().is_some() && funding.all(|p| p.status == ProofStatus::Confirmed)
}

/// Status a reader should see for `contract`
pub fn derive_status(contract: &Contract, proofs: &[MerkleProof]) -> ContractStatus {
    match contract.status {
        ContractStatus::Expired => ContractStatus::Expired,
        ContractStatus::Created => ContractStatus::Created,
        ContractStatus::Active | ContractStatus::Funded if is_funded(proofs) => ContractStatus::Funded,
        ContractStatus::Active | ContractStatus::Funded => ContractStatus::Active,
    }
}

// ============================================================================
// Service
// ============================================================================

pub struct ContractLifecycle {
    store: Arc<dyn ContractStore>,
    chain: Arc<dyn ChainClient>,
    verifier: MerkleProofVerifier,
    escrows: EscrowManager,
    disputes: DisputeResolution,
    monitor: Arc<TransactionMonitor>,
    builder: PsbtBuilder,
    funding: Arc<dyn FundingProvider>,
    scanner: Arc<dyn ImageScanner>,
    clock: Arc<dyn Clock>,
    locks: EntityLocks,
    settings: LifecycleSettings,
}

impl ContractLifecycle {
    pub fn new(
        store: Arc<dyn ContractStore>,
        chain: Arc<dyn ChainClient>,
        monitor: Arc<TransactionMonitor>,
        funding: Arc<dyn FundingProvider>,
        scanner: Arc<dyn ImageScanner>,
        clock: Arc<dyn Clock>,
        settings: LifecycleSettings,
    ) -> Self {
        let network = settings.network.bitcoin_network();
        Self {
            verifier: MerkleProofVerifier::new(chain.clone(), settings.min_confirmations),
            escrows: EscrowManager::new(store.clone(), monitor.clone(), network, settings.min_confirmations),
            disputes: DisputeResolution::new(store.clone()),
            builder: PsbtBuilder::new(network, settings.dust_limit),
            locks: EntityLocks::new(),
            store,
            chain,
            monitor,
            funding,
            scanner,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    pub fn monitor(&self) -> &Arc<TransactionMonitor> {
        &self.monitor
    }

    pub fn store(&self) -> &Arc<dyn ContractStore> {
        &self.store
    }

    /// Commit, turning a stale-version rejection into a `Conflict` that
    /// carries the record's current status
    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        match self.store.commit(batch).await {
            Ok(()) => Ok(()),
            Err(StorageError::VersionConflict { kind, id, .. }) => {
                let current = self
                    .store
                    .get(kind, &id)
                    .await?
                    .map(|r| r.status)
                    .unwrap_or_else(|| "missing".to_string());
                Err(WishfundError::conflict(kind.as_str(), id, current))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn require<E: crate::types::Entity>(&self, entity: &'static str, id: &str) -> Result<E> {
        self.store
            .load::<E>(id)
            .await?
            .ok_or_else(|| WishfundError::not_found(entity, id))
    }

    // ------------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------------

    /// Scan carrier content and record the wish, `verified` or `invalid`
    pub async fn ingest(&self, carrier: &[u8]) -> Result<Ingestion> {
        if carrier.is_empty() {
            return Err(WishfundError::validation("carrier content is empty"));
        }

        let carrier_hash = carrier_hash(carrier);
        let message = self.scanner.scan(carrier).await?;

        let now = self.clock.now();
        let mut ingestion = Ingestion {
            id: new_id("wish"),
            message: String::new(),
            carrier_hash,
            visible_pixel_hash: String::new(),
            status: IngestionStatus::Pending,
            error: None,
            created_at: now,
            version: 0,
        };

        let outcome = match message {
            None => Err("carrier holds no embedded message".to_string()),
            Some(message) => {
                let checked = validate_message(&message);
                ingestion.message = message.trim().to_string();
                checked
            }
        };

        let next = match outcome {
            Ok(()) => {
                ingestion.visible_pixel_hash =
                    visible_pixel_hash(&ingestion.message, &ingestion.carrier_hash);
                IngestionStatus::Verified
            }
            Err(reason) => {
                ingestion.error = Some(reason);
                IngestionStatus::Invalid
            }
        };
        ensure_transition("ingestion", &ingestion.id, ingestion.status, next, "verify")?;
        ingestion.status = next;

        self.store.save(&ingestion).await?;
        ingestion.version += 1;

        log_lifecycle_event(
            "wish_ingested",
            "ingestion",
            &ingestion.id,
            ingestion.status.as_str(),
            ingestion.error.as_deref(),
        );
        Ok(ingestion)
    }

    pub async fn get_ingestion(&self, id: &str) -> Result<Ingestion> {
        self.require("ingestion", id).await
    }

    // ------------------------------------------------------------------------
    // Proposals
    // ------------------------------------------------------------------------

    pub async fn create_proposal(&self, request: NewProposal) -> Result<Proposal> {
        let ingestion: Ingestion = self.require("ingestion", &request.ingestion_id).await?;
        if ingestion.status != IngestionStatus::Verified {
            return Err(WishfundError::invalid_state(
                "ingestion",
                &ingestion.id,
                ingestion.status,
                "propose against",
            ));
        }
        if let Some(vph) = &request.visible_pixel_hash {
            if *vph != ingestion.visible_pixel_hash {
                return Err(WishfundError::validation(
                    "visible_pixel_hash does not match the wish",
                ));
            }
        }

        if request.title.trim().is_empty() {
            return Err(WishfundError::validation("proposal title is required"));
        }
        if request.tasks.is_empty() {
            return Err(WishfundError::validation("a proposal needs at least one task"));
        }
        if let Some(task) = request.tasks.iter().find(|t| t.budget_sats == 0) {
            return Err(WishfundError::validation(format!(
                "task '{}' has no budget",
                task.title
            )));
        }
        let total = checked_total(request.tasks.iter().map(|t| t.budget_sats))?;
        if total > request.budget_sats {
            return Err(WishfundError::validation(format!(
                "tasks total {} sats exceeds budget {} sats",
                total, request.budget_sats
            )));
        }

        let now = self.clock.now();
        let mut proposal = Proposal {
            id: new_id("proposal"),
            ingestion_id: ingestion.id,
            title: request.title,
            description: request.description,
            budget_sats: request.budget_sats,
            visible_pixel_hash: ingestion.visible_pixel_hash,
            tasks: request.tasks,
            status: ProposalStatus::Pending,
            contract_id: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };
        self.store.save(&proposal).await?;
        proposal.version += 1;

        log_lifecycle_event("proposal_created", "proposal", &proposal.id, proposal.status.as_str(), None);
        Ok(proposal)
    }

    pub async fn get_proposal(&self, id: &str) -> Result<Proposal> {
        self.require("proposal", id).await
    }

    /// Approve a pending proposal: one batch creates the contract (already
    /// `active`), its tasks and its escrow. Approving again returns the
    /// existing contract.
    pub async fn approve_proposal(&self, proposal_id: &str, terms: ApprovalTerms) -> Result<Contract> {
        let _guard = self.locks.acquire("proposal", proposal_id).await;
        let mut proposal: Proposal = self.require("proposal", proposal_id).await?;

        if matches!(proposal.status, ProposalStatus::Approved | ProposalStatus::Published) {
            if let Some(contract_id) = &proposal.contract_id {
                debug!(proposal_id, contract_id = %contract_id, "Proposal already approved");
                return self.require("contract", contract_id).await;
            }
        }
        ensure_transition("proposal", proposal_id, proposal.status, ProposalStatus::Approved, "approve")?;

        let now = self.clock.now();
        if let Some(deadline) = terms.deadline {
            if deadline <= now {
                return Err(WishfundError::validation("contract deadline is in the past"));
            }
        }

        let funding_mode = terms.funding_mode.unwrap_or(self.settings.funding_mode);
        let contract_id = new_id("contract");
        let total = checked_total(proposal.tasks.iter().map(|t| t.budget_sats))?;

        let escrow = match (funding_mode, &terms.escrow) {
            (FundingMode::Escrow, Some(escrow)) => Some(self.escrows.prepare(
                &contract_id,
                escrow.escrow_type,
                &escrow.participants,
                total,
                escrow.timelock,
            )?),
            (FundingMode::Escrow, None) => {
                return Err(WishfundError::validation("escrow funding requires escrow terms"))
            }
            (FundingMode::Commitment, Some(_)) => {
                return Err(WishfundError::validation(
                    "commitment-funded contracts do not take escrow terms",
                ))
            }
            (FundingMode::Commitment, None) => None,
        };

        let mut contract = Contract {
            contract_id: contract_id.clone(),
            proposal_id: proposal.id.clone(),
            visible_pixel_hash: proposal.visible_pixel_hash.clone(),
            total_budget_sats: total,
            status: ContractStatus::Created,
            funding_mode,
            escrow_id: escrow.as_ref().map(|e| e.escrow_id.clone()),
            deadline: terms.deadline,
            pending_payout: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };
        ensure_transition("contract", &contract_id, contract.status, ContractStatus::Active, "activate")?;
        contract.status = ContractStatus::Active;

        let tasks: Vec<Task> = proposal
            .tasks
            .iter()
            .map(|draft| Task {
                task_id: new_id("task"),
                proposal_id: proposal.id.clone(),
                contract_id: contract_id.clone(),
                title: draft.title.clone(),
                description: draft.description.clone(),
                budget_sats: draft.budget_sats,
                skills: draft.skills.clone(),
                status: TaskStatus::Available,
                active_claim_id: None,
                paid_sats: 0,
                updated_at: now,
                version: 0,
            })
            .collect();

        proposal.status = ProposalStatus::Approved;
        proposal.contract_id = Some(contract_id.clone());
        proposal.updated_at = now;

        let mut batch = WriteBatch::new();
        batch.put(&proposal)?;
        batch.put(&contract)?;
        for task in &tasks {
            batch.put(task)?;
        }
        if let Some(escrow) = &escrow {
            batch.put(escrow)?;
        }
        self.commit(batch).await?;
        contract.version += 1;

        info!(
            proposal_id,
            contract_id = %contract.contract_id,
            tasks = tasks.len(),
            funding_mode = %funding_mode,
            budget = total,
            "Proposal approved"
        );
        log_lifecycle_event("proposal_approved", "proposal", proposal_id, ProposalStatus::Approved.as_str(), None);
        log_lifecycle_event("contract_active", "contract", &contract.contract_id, contract.status.as_str(), None);
        Ok(contract)
    }

    pub async fn reject_proposal(&self, proposal_id: &str) -> Result<Proposal> {
        let _guard = self.locks.acquire("proposal", proposal_id).await;
        let mut proposal: Proposal = self.require("proposal", proposal_id).await?;
        ensure_transition("proposal", proposal_id, proposal.status, ProposalStatus::Rejected, "reject")?;

        proposal.status = ProposalStatus::Rejected;
        proposal.updated_at = self.clock.now();
        let mut batch = WriteBatch::new();
        batch.put(&proposal)?;
        self.commit(batch).await?;
        proposal.version += 1;

        log_lifecycle_event("proposal_rejected", "proposal", proposal_id, proposal.status.as_str(), None);
        Ok(proposal)
    }

    /// Publish once every task is approved
    pub async fn publish_proposal(&self, proposal_id: &str) -> Result<Proposal> {
        let _guard = self.locks.acquire("proposal", proposal_id).await;
        let mut proposal: Proposal = self.require("proposal", proposal_id).await?;
        ensure_transition("proposal", proposal_id, proposal.status, ProposalStatus::Published, "publish")?;

        let tasks = self.store.children_of::<Task>(proposal_id).await?;
        let pending: Vec<String> = tasks
            .iter()
            .filter(|t| t.status != TaskStatus::Approved)
            .map(|t| t.task_id.clone())
            .collect();
        if !pending.is_empty() {
            log_lifecycle_event(
                "publish_rejected",
                "proposal",
                proposal_id,
                proposal.status.as_str(),
                Some("tasks not approved"),
            );
            return Err(WishfundError::Incomplete {
                proposal_id: proposal_id.to_string(),
                pending,
            });
        }

        let now = self.clock.now();
        let mut batch = WriteBatch::new();
        for mut task in tasks {
            for mut claim in self.store.children_of::<Claim>(&task.task_id).await? {
                if claim.status.can_transition_to(ClaimStatus::Complete) {
                    claim.status = ClaimStatus::Complete;
                    claim.updated_at = now;
                    batch.put(&claim)?;
                }
            }
            task.status = TaskStatus::Published;
            task.active_claim_id = None;
            task.updated_at = now;
            batch.put(&task)?;
        }
        proposal.status = ProposalStatus::Published;
        proposal.updated_at = now;
        batch.put(&proposal)?;

        self.commit(batch).await?;
        proposal.version += 1;

        log_lifecycle_event("proposal_published", "proposal", proposal_id, proposal.status.as_str(), None);
        Ok(proposal)
    }

    // ------------------------------------------------------------------------
    // Tasks and claims
    // ------------------------------------------------------------------------

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        let task: Task = self.require("task", task_id).await?;
        if let Some(claim_id) = task.active_claim_id.clone() {
            if self.expire_if_due(&claim_id).await? {
                return self.require("task", task_id).await;
            }
        }
        Ok(task)
    }

    pub async fn tasks_for_proposal(&self, proposal_id: &str) -> Result<Vec<Task>> {
        let _: Proposal = self.require("proposal", proposal_id).await?;
        Ok(self.store.children_of::<Task>(proposal_id).await?)
    }

    pub async fn get_claim(&self, claim_id: &str) -> Result<Claim> {
        if self.expire_if_due(claim_id).await? {
            debug!(claim_id, "Claim expired on read");
        }
        self.require("claim", claim_id).await
    }

    /// Lock `task_id` for `agent_id`. Exactly one of any number of concurrent
    /// callers succeeds; the rest get `Conflict`.
    pub async fn claim_task(&self, task_id: &str, agent_id: &str) -> Result<Claim> {
        if agent_id.trim().is_empty() {
            return Err(WishfundError::validation("agent_id is required"));
        }

        let _guard = self.locks.acquire("task", task_id).await;
        let now = self.clock.now();
        let mut task: Task = self.require("task", task_id).await?;

        if let Some(claim_id) = task.active_claim_id.clone() {
            let claim: Claim = self.require("claim", &claim_id).await?;
            if claim.is_expired_at(now) {
                self.expire_claim_locked(claim, task).await?;
                task = self.require("task", task_id).await?;
            }
        }

        if task.status != TaskStatus::Available || task.active_claim_id.is_some() {
            log_lifecycle_event("claim_conflict", "task", task_id, task.status.as_str(), Some("task not available"));
            return Err(WishfundError::conflict("task", task_id, task.status));
        }

        let contract: Contract = self.require("contract", &task.contract_id).await?;
        if !contract.status.accepts_claims() {
            return Err(WishfundError::invalid_state(
                "contract",
                &contract.contract_id,
                contract.status,
                "claim tasks on",
            ));
        }
        if contract.deadline.is_some_and(|d| d <= now) {
            return Err(WishfundError::invalid_state(
                "contract",
                &contract.contract_id,
                ContractStatus::Expired,
                "claim tasks on",
            ));
        }

        let mut claim = Claim {
            claim_id: new_id("claim"),
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            expires_at: now + self.settings.claim_ttl,
            status: ClaimStatus::Active,
            created_at: now,
            updated_at: now,
            version: 0,
        };
        ensure_transition("task", task_id, task.status, TaskStatus::Claimed, "claim")?;
        task.status = TaskStatus::Claimed;
        task.active_claim_id = Some(claim.claim_id.clone());
        task.updated_at = now;

        let mut batch = WriteBatch::new();
        batch.put(&task)?;
        batch.put(&claim)?;
        self.commit(batch).await?;
        claim.version += 1;

        info!(task_id, claim_id = %claim.claim_id, agent_id, expires_at = %claim.expires_at, "Task claimed");
        log_lifecycle_event("task_claimed", "task", task_id, TaskStatus::Claimed.as_str(), None);
        Ok(claim)
    }

    pub async fn submit_claim(&self, claim_id: &str, agent_id: &str, work: WorkSubmission) -> Result<Submission> {
        let claim: Claim = self.require("claim", claim_id).await?;
        let _guard = self.locks.acquire("task", &claim.task_id).await;

        let now = self.clock.now();
        let mut claim: Claim = self.require("claim", claim_id).await?;
        if claim.agent_id != agent_id {
            return Err(WishfundError::validation(format!(
                "claim {} is held by another agent",
                claim_id
            )));
        }

        let mut task: Task = self.require("task", &claim.task_id).await?;
        if claim.is_expired_at(now) {
            self.expire_claim_locked(claim, task).await?;
            return Err(WishfundError::invalid_state("claim", claim_id, ClaimStatus::Expired, "submit"));
        }

        ensure_transition("claim", claim_id, claim.status, ClaimStatus::Submitted, "submit")?;
        ensure_transition("task", &task.task_id, task.status, TaskStatus::Submitted, "submit")?;

        let mut submission = Submission {
            submission_id: new_id("submission"),
            claim_id: claim_id.to_string(),
            task_id: task.task_id.clone(),
            deliverables: work.deliverables,
            completion_proof: work.completion_proof,
            status: SubmissionStatus::PendingReview,
            review_notes: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };
        claim.status = ClaimStatus::Submitted;
        claim.updated_at = now;
        task.status = TaskStatus::Submitted;
        task.updated_at = now;

        let mut batch = WriteBatch::new();
        batch.put(&submission)?;
        batch.put(&claim)?;
        batch.put(&task)?;
        self.commit(batch).await?;
        submission.version += 1;

        log_lifecycle_event(
            "claim_submitted",
            "submission",
            &submission.submission_id,
            submission.status.as_str(),
            None,
        );
        Ok(submission)
    }

    pub async fn get_submission(&self, submission_id: &str) -> Result<Submission> {
        self.require("submission", submission_id).await
    }

    /// Approve, reject (task reopens) or defer a submission
    pub async fn review_submission(
        &self,
        submission_id: &str,
        decision: ReviewDecision,
        notes: Option<String>,
    ) -> Result<Submission> {
        let submission: Submission = self.require("submission", submission_id).await?;
        let _guard = self.locks.acquire("task", &submission.task_id).await;

        let mut submission: Submission = self.require("submission", submission_id).await?;
        if submission.status.is_terminal() {
            return Err(WishfundError::conflict("submission", submission_id, submission.status));
        }
        let mut claim: Claim = self.require("claim", &submission.claim_id).await?;
        let mut task: Task = self.require("task", &submission.task_id).await?;

        let (next_submission, next_claim, next_task) = match decision {
            ReviewDecision::Approve => (
                SubmissionStatus::Approved,
                Some(ClaimStatus::Complete),
                Some(TaskStatus::Approved),
            ),
            ReviewDecision::Reject => (
                SubmissionStatus::Rejected,
                Some(ClaimStatus::Rejected),
                Some(TaskStatus::Available),
            ),
            ReviewDecision::Defer => (SubmissionStatus::Reviewed, None, None),
        };

        ensure_transition("submission", submission_id, submission.status, next_submission, "review")?;
        if let Some(next) = next_claim {
            ensure_transition("claim", &claim.claim_id, claim.status, next, "review")?;
        }
        if let Some(next) = next_task {
            ensure_transition("task", &task.task_id, task.status, next, "review")?;
        }

        let now = self.clock.now();
        submission.status = next_submission;
        submission.review_notes = notes.or(submission.review_notes);
        submission.updated_at = now;

        let mut batch = WriteBatch::new();
        batch.put(&submission)?;
        if let (Some(claim_status), Some(task_status)) = (next_claim, next_task) {
            claim.status = claim_status;
            claim.updated_at = now;
            task.status = task_status;
            task.active_claim_id = None;
            task.updated_at = now;
            batch.put(&claim)?;
            batch.put(&task)?;
        }
        self.commit(batch).await?;
        submission.version += 1;

        info!(submission_id, task_id = %task.task_id, decision = ?decision, "Submission reviewed");
        log_lifecycle_event("submission_reviewed", "submission", submission_id, submission.status.as_str(), None);
        Ok(submission)
    }

    /// Expire `claim_id` if it is active and past its TTL. Returns whether
    /// anything changed.
    async fn expire_if_due(&self, claim_id: &str) -> Result<bool> {
        let claim: Claim = self.require("claim", claim_id).await?;
        if !claim.is_expired_at(self.clock.now()) {
            return Ok(false);
        }

        let _guard = self.locks.acquire("task", &claim.task_id).await;
        let claim: Claim = self.require("claim", claim_id).await?;
        if !claim.is_expired_at(self.clock.now()) {
            return Ok(false);
        }
        let task: Task = self.require("task", &claim.task_id).await?;
        self.expire_claim_locked(claim, task).await?;
        Ok(true)
    }

    /// Caller holds the task lock
    async fn expire_claim_locked(&self, mut claim: Claim, mut task: Task) -> Result<Claim> {
        let now = self.clock.now();
        ensure_transition("claim", &claim.claim_id, claim.status, ClaimStatus::Expired, "expire")?;
        claim.status = ClaimStatus::Expired;
        claim.updated_at = now;

        let mut batch = WriteBatch::new();
        batch.put(&claim)?;
        if task.active_claim_id.as_deref() == Some(claim.claim_id.as_str()) {
            ensure_transition("task", &task.task_id, task.status, TaskStatus::Available, "release")?;
            task.status = TaskStatus::Available;
            task.active_claim_id = None;
            task.updated_at = now;
            batch.put(&task)?;
        }
        self.commit(batch).await?;
        claim.version += 1;

        info!(claim_id = %claim.claim_id, task_id = %task.task_id, "Claim expired, task available again");
        log_lifecycle_event("claim_expired", "claim", &claim.claim_id, claim.status.as_str(), None);
        Ok(claim)
    }

    /// Expire an active claim whose TTL has elapsed. Already expired claims
    /// are returned unchanged.
    pub async fn expire_claim(&self, claim_id: &str) -> Result<Claim> {
        let claim: Claim = self.require("claim", claim_id).await?;
        let _guard = self.locks.acquire("task", &claim.task_id).await;

        let claim: Claim = self.require("claim", claim_id).await?;
        if claim.status == ClaimStatus::Expired {
            return Ok(claim);
        }
        if !claim.is_expired_at(self.clock.now()) {
            return Err(WishfundError::invalid_state("claim", claim_id, claim.status, "expire"));
        }
        let task: Task = self.require("task", &claim.task_id).await?;
        self.expire_claim_locked(claim, task).await
    }

    // ------------------------------------------------------------------------
    // Contracts and funding
    // ------------------------------------------------------------------------

    pub async fn get_contract(&self, contract_id: &str) -> Result<Contract> {
        self.require("contract", contract_id).await
    }

    pub async fn get_escrow(&self, contract_id: &str) -> Result<EscrowContract> {
        let contract = self.get_contract(contract_id).await?;
        let escrow_id = contract
            .escrow_id
            .ok_or_else(|| WishfundError::not_found("escrow", contract_id))?;
        Ok(self.escrows.get(&escrow_id).await?)
    }

    /// Funding state derived from the stored proofs; no chain query
    pub async fn get_funding_status(&self, contract_id: &str) -> Result<FundingStatus> {
        let contract = self.get_contract(contract_id).await?;
        let proofs = self.store.children_of::<MerkleProof>(contract_id).await?;
        let escrow = match &contract.escrow_id {
            Some(id) => Some(self.escrows.get(id).await?),
            None => None,
        };

        Ok(FundingStatus {
            contract_id: contract.contract_id.clone(),
            status: derive_status(&contract, &proofs),
            stored_status: contract.status,
            funding_mode: contract.funding_mode,
            funded: is_funded(&proofs),
            visible_pixel_hash: contract.visible_pixel_hash,
            proofs,
            escrow,
        })
    }

    /// Verify a funding proof, store it, attach it to the escrow and start
    /// watching the tx. `vout` is the output paying the escrow; `payer`, for
    /// escrow contracts, is the address a refund returns to.
    pub async fn submit_funding_proof(
        &self,
        contract_id: &str,
        mut proof: MerkleProof,
        vout: u32,
        payer: Option<&str>,
    ) -> Result<MerkleProof> {
        let contract = self.get_contract(contract_id).await?;
        if contract.status == ContractStatus::Expired {
            return Err(WishfundError::invalid_state("contract", contract_id, contract.status, "fund"));
        }
        if payer.is_some() && contract.escrow_id.is_none() {
            return Err(WishfundError::validation("a payer applies to escrow funding only"));
        }

        let existing = self.store.load::<MerkleProof>(&proof.tx_id).await?;
        if let Some(existing) = &existing {
            if existing.contract_id.as_deref() != Some(contract_id) {
                return Err(WishfundError::conflict("merkle_proof", &proof.tx_id, existing.status));
            }
        }
        proof.contract_id = Some(contract_id.to_string());
        proof.role = TxRole::Funding;

        // Chain reads happen before any lock is taken
        let mut verified = self.verifier.verify(&proof).await?;

        let guard = self.locks.acquire("contract", contract_id).await;
        let escrow = match &contract.escrow_id {
            Some(id) => {
                let escrow = self.escrows.get(id).await?;
                let attachable = escrow.status == EscrowStatus::Created
                    || escrow.funding_txid.as_deref() == Some(verified.tx_id.as_str());
                if !attachable {
                    return Err(WishfundError::Escrow(EscrowError::InvalidEscrowState {
                        escrow_id: escrow.escrow_id.clone(),
                        status: escrow.status.to_string(),
                        action: "attach another funding tx to",
                    }));
                }
                Some(escrow)
            }
            None => None,
        };

        if let (Some(escrow), Some(address)) = (&escrow, payer) {
            if escrow.status == EscrowStatus::Created {
                let payer = Payer {
                    address: address.to_string(),
                    amount_sats: escrow.amount_sats,
                };
                self.escrows.record_payers(&escrow.escrow_id, vec![payer]).await?;
            }
        }

        verified.version = self
            .store
            .load::<MerkleProof>(&verified.tx_id)
            .await?
            .map(|p| p.version)
            .unwrap_or(0);
        let mut batch = WriteBatch::new();
        batch.put(&verified)?;
        self.commit(batch).await?;
        verified.version += 1;

        match escrow {
            Some(escrow) if escrow.status == EscrowStatus::Created => {
                self.escrows.fund(&escrow.escrow_id, &verified.tx_id, vout).await?;
            }
            Some(_) => {}
            None => {
                self.monitor
                    .track(TrackedTx::new(
                        &verified.tx_id,
                        self.settings.min_confirmations,
                        TxRole::Funding,
                        contract_id,
                    ))
                    .await;
            }
        }
        drop(guard);

        info!(
            contract_id,
            tx_id = %verified.tx_id,
            status = %verified.status,
            confirmations = verified.confirmations,
            "Funding proof accepted"
        );
        log_lifecycle_event("funding_proof", "merkle_proof", &verified.tx_id, verified.status.as_str(), None);

        if verified.status == ProofStatus::Confirmed {
            self.apply_funding(contract_id).await?;
        }
        Ok(verified)
    }

    /// Fetch the inclusion proof for `tx_id` from the chain and submit it
    pub async fn fetch_funding_proof(
        &self,
        contract_id: &str,
        tx_id: &str,
        vout: u32,
        payer: Option<&str>,
    ) -> Result<MerkleProof> {
        let proof = self
            .chain
            .get_merkle_proof(tx_id, TxRole::Funding)
            .await?
            .ok_or_else(|| WishfundError::invalid_state("transaction", tx_id, "unconfirmed", "prove"))?;
        self.submit_funding_proof(contract_id, proof, vout, payer).await
    }

    /// Re-query the chain for every proof of a contract and apply the result
    pub async fn refresh_funding(&self, contract_id: &str) -> Result<FundingStatus> {
        let proofs = self.store.children_of::<MerkleProof>(contract_id).await?;
        for proof in proofs {
            self.refresh_proof(&proof.tx_id).await?;
        }
        self.apply_funding(contract_id).await?;
        self.get_funding_status(contract_id).await
    }

    /// Refresh a stored proof against the chain. Returns `None` when no proof
    /// is on file.
    async fn refresh_proof(&self, tx_id: &str) -> Result<Option<MerkleProof>> {
        let Some(proof) = self.store.load::<MerkleProof>(tx_id).await? else {
            return Ok(None);
        };
        let refreshed = self.verifier.refresh(&proof).await?;
        if refreshed.status == proof.status && refreshed.confirmations == proof.confirmations {
            return Ok(Some(proof));
        }
        self.save_proof(proof, refreshed).await.map(Some)
    }

    async fn save_proof(&self, current: MerkleProof, mut next: MerkleProof) -> Result<MerkleProof> {
        ensure_transition("merkle_proof", &current.tx_id, current.status, next.status, "update")
            .or_else(|e| if current.status == next.status { Ok(()) } else { Err(e) })?;
        next.version = current.version;
        let mut batch = WriteBatch::new();
        batch.put(&next)?;
        self.commit(batch).await?;
        next.version += 1;
        log_lifecycle_event("proof_updated", "merkle_proof", &next.tx_id, next.status.as_str(), None);
        Ok(next)
    }

    /// Move the contract and its escrow forward once the proofs say funded
    async fn apply_funding(&self, contract_id: &str) -> Result<()> {
        let _guard = self.locks.acquire("contract", contract_id).await;
        let mut contract = self.get_contract(contract_id).await?;
        let proofs = self.store.children_of::<MerkleProof>(contract_id).await?;
        if !is_funded(&proofs) {
            return Ok(());
        }

        if let Some(escrow_id) = &contract.escrow_id {
            let escrow = self.escrows.get(escrow_id).await?;
            if escrow.status == EscrowStatus::Active {
                self.escrows.mark_funded(escrow_id).await?;
            }
        }

        if contract.status == ContractStatus::Active {
            ensure_transition("contract", contract_id, contract.status, ContractStatus::Funded, "fund")?;
            contract.status = ContractStatus::Funded;
            contract.updated_at = self.clock.now();
            let mut batch = WriteBatch::new();
            batch.put(&contract)?;
            self.commit(batch).await?;

            info!(contract_id, "Contract funded");
            log_lifecycle_event("contract_funded", "contract", contract_id, contract.status.as_str(), None);
        }
        Ok(())
    }

    /// Close a contract to new claims and expire its escrow
    pub async fn expire_contract(&self, contract_id: &str) -> Result<Contract> {
        let _guard = self.locks.acquire("contract", contract_id).await;
        let mut contract = self.get_contract(contract_id).await?;
        if contract.status == ContractStatus::Expired {
            return Ok(contract);
        }
        ensure_transition("contract", contract_id, contract.status, ContractStatus::Expired, "expire")?;

        contract.status = ContractStatus::Expired;
        contract.updated_at = self.clock.now();
        let mut batch = WriteBatch::new();
        batch.put(&contract)?;
        self.commit(batch).await?;
        contract.version += 1;

        if let Some(escrow_id) = &contract.escrow_id {
            let escrow = self.escrows.get(escrow_id).await?;
            if escrow.status.can_transition_to(EscrowStatus::Expired) {
                self.escrows.expire(escrow_id).await?;
            }
        }

        info!(contract_id, "Contract expired");
        log_lifecycle_event("contract_expired", "contract", contract_id, contract.status.as_str(), None);
        Ok(contract)
    }

    // ------------------------------------------------------------------------
    // PSBTs
    // ------------------------------------------------------------------------

    /// Build the unsigned payout transaction for a contract.
    ///
    /// Every output names an approved or published task and stays within
    /// that task's unpaid budget. Escrow contracts spend the escrow output
    /// and return the rest to the escrow address. Commitment contracts must
    /// be funded; they spend the funding source's UTXOs and add the hash-lock
    /// output for the contract's visible pixel hash.
    ///
    /// The result is held as the contract's pending payout, replacing any
    /// earlier one. Task and escrow balances move only when the monitor
    /// confirms the tx.
    pub async fn build_payout_psbt(&self, contract_id: &str, request: PayoutPsbtRequest) -> Result<BuiltPsbt> {
        // Funding source UTXOs are read before any lock is taken
        let utxos = match self.get_contract(contract_id).await?.funding_mode {
            FundingMode::Escrow => Vec::new(),
            FundingMode::Commitment => {
                let source = request
                    .funding_source
                    .as_deref()
                    .ok_or_else(|| WishfundError::validation("funding_source is required for commitment payouts"))?;
                self.funding.utxos_for(source).await?
            }
        };

        let _guard = self.locks.acquire("contract", contract_id).await;
        let contract = self.get_contract(contract_id).await?;
        let fee_rate = request.fee_rate.unwrap_or(self.settings.fee_rate);

        let allocations = self.payable_allocations(&contract, &request.payouts).await?;
        let payouts: Vec<Payout> = request
            .payouts
            .iter()
            .map(|p| Payout {
                address: p.address.clone(),
                amount_sats: p.amount_sats,
            })
            .collect();

        let built = match contract.funding_mode {
            FundingMode::Escrow => self.build_escrow_payout(&contract, payouts, fee_rate).await?,
            FundingMode::Commitment => {
                self.build_commitment_payout(&contract, &request, payouts, &utxos, fee_rate).await?
            }
        };
        self.hold_pending_payout(contract, allocations, &built).await?;
        Ok(built)
    }

    /// Per-task totals of `payouts`, each checked against its task
    async fn payable_allocations(&self, contract: &Contract, payouts: &[TaskPayout]) -> Result<Vec<TaskAllocation>> {
        if payouts.is_empty() {
            return Err(WishfundError::validation("no payouts requested"));
        }

        let mut allocations: Vec<TaskAllocation> = Vec::new();
        for payout in payouts {
            match allocations.iter_mut().find(|a| a.task_id == payout.task_id) {
                Some(allocation) => {
                    allocation.amount_sats = allocation
                        .amount_sats
                        .checked_add(payout.amount_sats)
                        .ok_or_else(|| WishfundError::validation("payout total overflows"))?;
                }
                None => allocations.push(TaskAllocation {
                    task_id: payout.task_id.clone(),
                    amount_sats: payout.amount_sats,
                }),
            }
        }

        for allocation in &allocations {
            let task: Task = self.require("task", &allocation.task_id).await?;
            if task.contract_id != contract.contract_id {
                return Err(WishfundError::validation(format!(
                    "task {} does not belong to contract {}",
                    task.task_id, contract.contract_id
                )));
            }
            if !matches!(task.status, TaskStatus::Approved | TaskStatus::Published) {
                return Err(WishfundError::invalid_state("task", &task.task_id, task.status, "pay out"));
            }
            if allocation.amount_sats > task.unpaid_sats() {
                return Err(WishfundError::validation(format!(
                    "payout of {} sats for task {} exceeds its unpaid budget of {} sats",
                    allocation.amount_sats,
                    task.task_id,
                    task.unpaid_sats()
                )));
            }
        }
        Ok(allocations)
    }

    /// Caller holds the contract lock
    async fn build_escrow_payout(&self, contract: &Contract, payouts: Vec<Payout>, fee_rate: u64) -> Result<BuiltPsbt> {
        let escrow_id = contract
            .escrow_id
            .as_deref()
            .ok_or_else(|| WishfundError::not_found("escrow", &contract.contract_id))?;

        let plan = self.escrows.payout(escrow_id, payouts).await?;
        let request = PayoutRequest {
            contract_id: contract.contract_id.clone(),
            payouts: plan.outputs.clone(),
            budget_sats: plan.input.value,
            fee_rate,
            commitment: None,
            change_address: plan.change_address.clone(),
            selection: CoinSelection::Provided,
        };
        let built = self.builder.build(&request, std::slice::from_ref(&plan.input))?;

        info!(
            contract_id = %contract.contract_id,
            txid = %built.txid,
            payouts = built.payouts_total,
            fee = built.fee_sats,
            "Escrow payout PSBT built"
        );
        Ok(built)
    }

    async fn build_commitment_payout(
        &self,
        contract: &Contract,
        request: &PayoutPsbtRequest,
        payouts: Vec<Payout>,
        utxos: &[Utxo],
        fee_rate: u64,
    ) -> Result<BuiltPsbt> {
        let proofs = self.store.children_of::<MerkleProof>(&contract.contract_id).await?;
        let status = derive_status(contract, &proofs);
        if status != ContractStatus::Funded {
            return Err(WishfundError::invalid_state("contract", &contract.contract_id, status, "pay out"));
        }
        let change_address = request
            .change_address
            .clone()
            .or_else(|| request.funding_source.clone())
            .ok_or_else(|| WishfundError::validation("change_address is required for commitment payouts"))?;

        let commitment = Commitment {
            amount_sats: request.commitment_sats.unwrap_or(self.builder.dust_limit()),
            visible_pixel_hash: request
                .include_commitment
                .then(|| contract.visible_pixel_hash.clone()),
        };
        let payout = PayoutRequest {
            contract_id: contract.contract_id.clone(),
            payouts,
            budget_sats: contract.total_budget_sats,
            fee_rate,
            commitment: Some(commitment),
            change_address,
            selection: CoinSelection::LargestFirst,
        };
        let built = self.builder.build(&payout, utxos)?;

        if request.include_commitment
            && !PsbtBuilder::commitment_matches(&built.psbt_base64, &contract.visible_pixel_hash)?
        {
            error!(contract_id = %contract.contract_id, "Built PSBT lost its commitment output");
            return Err(WishfundError::internal("commitment output does not match the contract"));
        }

        info!(
            contract_id = %contract.contract_id,
            txid = %built.txid,
            commitment = built.commitment_sats,
            fee = built.fee_sats,
            "Commitment payout PSBT built"
        );
        Ok(built)
    }

    /// Store `built` as the pending payout and watch its txid. Caller holds
    /// the contract lock.
    async fn hold_pending_payout(
        &self,
        mut contract: Contract,
        allocations: Vec<TaskAllocation>,
        built: &BuiltPsbt,
    ) -> Result<()> {
        let now = self.clock.now();
        let replaced = contract
            .pending_payout
            .take()
            .map(|p| p.txid)
            .filter(|txid| *txid != built.txid);
        contract.pending_payout = Some(PendingPayout {
            txid: built.txid.clone(),
            allocations,
            payouts_total: built.payouts_total,
            change_vout: built.change_vout,
            change_sats: built.change_sats,
            built_at: now,
        });
        contract.updated_at = now;

        let mut batch = WriteBatch::new();
        batch.put(&contract)?;
        self.commit(batch).await?;

        if let Some(old) = replaced {
            self.monitor.untrack(&old).await;
            info!(contract_id = %contract.contract_id, replaced = %old, txid = %built.txid, "Pending payout replaced");
        }
        self.monitor
            .track(TrackedTx::new(
                &built.txid,
                self.settings.min_confirmations,
                TxRole::Payout,
                &contract.contract_id,
            ))
            .await;
        log_lifecycle_event("payout_pending", "contract", &contract.contract_id, contract.status.as_str(), None);
        Ok(())
    }

    /// Apply a confirmed payout: its tasks record what they were paid and
    /// the escrow balance moves to the change output, in one batch
    async fn settle_payout(&self, contract_id: &str, tx_id: &str) -> Result<()> {
        let _guard = self.locks.acquire("contract", contract_id).await;
        let mut contract = self.get_contract(contract_id).await?;
        let Some(pending) = contract.pending_payout.clone() else {
            debug!(contract_id, tx_id, "No pending payout");
            return Ok(());
        };
        if pending.txid != tx_id {
            warn!(contract_id, tx_id, pending = %pending.txid, "Confirmed payout is not the pending one");
            return Ok(());
        }

        let now = self.clock.now();
        let mut batch = WriteBatch::new();
        for allocation in &pending.allocations {
            let mut task: Task = self.require("task", &allocation.task_id).await?;
            task.paid_sats = task.paid_sats.saturating_add(allocation.amount_sats);
            task.updated_at = now;
            batch.put(&task)?;
        }
        if let Some(escrow_id) = &contract.escrow_id {
            let escrow = self.escrows.get(escrow_id).await?;
            let change = pending.change_vout.map(|vout| (vout, pending.change_sats));
            if let Some(next) = EscrowManager::settle_payout(&escrow, tx_id, change)? {
                batch.put(&next)?;
            }
        }
        contract.pending_payout = None;
        contract.updated_at = now;
        batch.put(&contract)?;
        self.commit(batch).await?;

        info!(contract_id, tx_id, paid = pending.payouts_total, "Payout confirmed");
        log_lifecycle_event("payout_settled", "contract", contract_id, contract.status.as_str(), None);
        Ok(())
    }

    /// Build contributor PSBTs paying the contract's funding target: the
    /// escrow address, or the hash-lock commitment address.
    /// Escrow contracts record the contributors' change addresses as the
    /// payers a refund returns to.
    pub async fn build_fundraise_psbts(&self, contract_id: &str, request: FundraisePsbtRequest) -> Result<Vec<BuiltPsbt>> {
        let _guard = self.locks.acquire("contract", contract_id).await;
        let contract = self.get_contract(contract_id).await?;
        if contract.status == ContractStatus::Expired {
            return Err(WishfundError::invalid_state("contract", contract_id, contract.status, "raise funds for"));
        }

        let total = checked_total(request.contributions.iter().map(|c| c.amount_sats))?;
        let target_address = match contract.funding_mode {
            FundingMode::Escrow => {
                let escrow = self.get_escrow(contract_id).await?;
                if escrow.status != EscrowStatus::Created {
                    return Err(EscrowError::InvalidEscrowState {
                        escrow_id: escrow.escrow_id,
                        status: escrow.status.to_string(),
                        action: "raise funds for",
                    }
                    .into());
                }
                // The escrow tracks one funding output
                if request.split && request.contributions.len() > 1 {
                    return Err(WishfundError::validation(
                        "split fund-raising cannot fund a single escrow output",
                    ));
                }
                if total != escrow.amount_sats {
                    return Err(WishfundError::validation(format!(
                        "contributions total {} sats, escrow expects {} sats",
                        total, escrow.amount_sats
                    )));
                }
                escrow.funding_address
            }
            FundingMode::Commitment => {
                let (_, script_pubkey) = PsbtBuilder::commitment_script(&contract.visible_pixel_hash)?;
                Address::from_script(&script_pubkey, self.settings.network.bitcoin_network())
                    .map_err(|e| WishfundError::internal(format!("commitment address: {}", e)))?
                    .to_string()
            }
        };

        let payers: Vec<Payer> = request
            .contributions
            .iter()
            .map(|c| Payer {
                address: c.change_address.clone(),
                amount_sats: c.amount_sats,
            })
            .collect();
        let built = self.builder.build_fundraise(&FundraiseRequest {
            contract_id: contract_id.to_string(),
            target_address,
            contributions: request.contributions,
            fee_rate: request.fee_rate.unwrap_or(self.settings.fee_rate),
            split: request.split,
        })?;
        if let Some(escrow_id) = &contract.escrow_id {
            self.escrows.record_payers(escrow_id, payers).await?;
        }

        info!(contract_id, psbts = built.len(), total, split = request.split, "Fund-raising PSBTs built");
        Ok(built)
    }

    /// Build the refund PSBT for an escrow, after expiry or by mutual release.
    /// The balance returns to the recorded payers, less the fee, in
    /// proportion to what each paid in.
    pub async fn refund_escrow(&self, contract_id: &str, request: RefundRequest) -> Result<BuiltPsbt> {
        let contract = self.get_contract(contract_id).await?;
        let escrow_id = contract
            .escrow_id
            .ok_or_else(|| WishfundError::not_found("escrow", contract_id))?;

        let reason = if request.approvals.is_empty() {
            RefundReason::Expired {
                tip_height: self.chain.get_current_height().await?,
            }
        } else {
            RefundReason::MutualRelease {
                approvals: request.approvals,
            }
        };

        let _guard = self.locks.acquire("contract", contract_id).await;
        let escrow = self.escrows.get(&escrow_id).await?;
        if let Some(address) = &request.refund_address {
            if !escrow.payers.iter().any(|p| p.address == *address) {
                return Err(WishfundError::validation(format!(
                    "refund destination {} is not a payer of escrow {}",
                    address, escrow_id
                )));
            }
        }
        let (plan, _) = self.escrows.plan_refund(&escrow, &reason)?;
        let built = self.builder.build_sweep(
            contract_id,
            std::slice::from_ref(&plan.input),
            &plan.outputs,
            request.fee_rate.unwrap_or(self.settings.fee_rate),
        )?;

        self.escrows.refund(&escrow_id, reason).await?;
        self.escrows.record_refund(&escrow_id, &built.txid).await?;

        info!(contract_id, txid = %built.txid, amount = built.payouts_total, payers = plan.outputs.len(), "Escrow refund PSBT built");
        Ok(built)
    }

    // ------------------------------------------------------------------------
    // Disputes
    // ------------------------------------------------------------------------

    pub async fn open_dispute(&self, request: OpenDispute) -> Result<Dispute> {
        let contract = self.get_contract(&request.contract_id).await?;
        if let Some(submission_id) = &request.submission_id {
            let submission = self.get_submission(submission_id).await?;
            let task: Task = self.require("task", &submission.task_id).await?;
            if task.contract_id != contract.contract_id {
                return Err(WishfundError::validation(format!(
                    "submission {} does not belong to contract {}",
                    submission_id, contract.contract_id
                )));
            }
        }
        Ok(self.disputes.open(request).await?)
    }

    pub async fn get_dispute(&self, dispute_id: &str) -> Result<Dispute> {
        Ok(self.disputes.get(dispute_id).await?)
    }

    pub async fn vote_dispute(
        &self,
        dispute_id: &str,
        arbitrator: &str,
        decision: VoteDecision,
        weight: u32,
    ) -> Result<Dispute> {
        Ok(self.disputes.vote(dispute_id, arbitrator, decision, weight).await?)
    }

    /// Resolve a dispute. A reversal of a submission still under review
    /// rejects it, reopening the task; otherwise payouts stay as they are.
    pub async fn resolve_dispute(&self, dispute_id: &str) -> Result<Dispute> {
        let dispute = self.disputes.resolve(dispute_id).await?;

        if dispute.outcome == Some(DisputeOutcome::ReversePayout) {
            if let Some(submission_id) = &dispute.submission_id {
                let submission = self.get_submission(submission_id).await?;
                if matches!(
                    submission.status,
                    SubmissionStatus::PendingReview | SubmissionStatus::Reviewed
                ) {
                    self.review_submission(
                        submission_id,
                        ReviewDecision::Reject,
                        Some(format!("reversed by dispute {}", dispute_id)),
                    )
                    .await?;
                } else {
                    warn!(
                        dispute_id,
                        submission_id = %submission_id,
                        status = %submission.status,
                        "Dispute reversed a settled submission; payout needs manual handling"
                    );
                }
            }
        }
        Ok(dispute)
    }

    pub async fn appeal_dispute(&self, dispute_id: &str, arbitrators: Vec<String>, quorum: usize) -> Result<Dispute> {
        Ok(self.disputes.appeal(dispute_id, arbitrators, quorum).await?)
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    /// Apply one event from the monitor or sweeper
    pub async fn handle_event(&self, event: LifecycleEvent) -> Result<()> {
        debug!(event = event.name(), "Handling lifecycle event");
        match event {
            LifecycleEvent::TxConfirmed { tx_id, role, owner_id, .. } => {
                if self.refresh_proof(&tx_id).await?.is_none() {
                    debug!(tx_id = %tx_id, role = %role, "No proof on file for confirmed tx");
                }
                match role {
                    TxRole::Funding => self.apply_funding(&owner_id).await?,
                    TxRole::Payout => self.settle_payout(&owner_id, &tx_id).await?,
                    TxRole::Refund => info!(tx_id = %tx_id, contract_id = %owner_id, "Refund confirmed"),
                }
            }
            LifecycleEvent::TxReorged { tx_id, role, owner_id } => {
                if let Some(proof) = self.store.load::<MerkleProof>(&tx_id).await? {
                    let mut reverted = proof.clone();
                    reverted.status = ProofStatus::Provisional;
                    reverted.confirmations = 0;
                    self.save_proof(proof, reverted).await?;
                }
                if role == TxRole::Funding {
                    let contract = self.get_contract(&owner_id).await?;
                    if let Some(escrow_id) = &contract.escrow_id {
                        self.escrows.revert_funding(escrow_id).await?;
                    }
                }
                warn!(tx_id = %tx_id, role = %role, contract_id = %owner_id, "Transaction reverted by reorg");
            }
            LifecycleEvent::ClaimExpired { claim_id, .. } => {
                self.expire_if_due(&claim_id).await?;
            }
            LifecycleEvent::ContractExpired { contract_id } => {
                let contract = self.get_contract(&contract_id).await?;
                if contract.deadline.is_some_and(|d| d <= self.clock.now()) {
                    self.expire_contract(&contract_id).await?;
                }
            }
        }
        Ok(())
    }

    /// Consume events until the channel closes or `shutdown` flips
    pub async fn run_events(self: Arc<Self>, mut events: EventReceiver, mut shutdown: watch::Receiver<bool>) {
        info!("Lifecycle event loop started");
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let name = event.name();
                    if let Err(e) = self.handle_event(event).await {
                        if e.is_retryable() {
                            warn!(event = name, error = %e, "Event handling failed, state left as is");
                        } else {
                            error!(event = name, error = %e, "Event handling failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Lifecycle event loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use crate::common::ErrorKind;
    use crate::lifecycle::clock::ManualClock;
    use crate::lifecycle::events::event_channel;
    use crate::lifecycle::ingest::{FixedMessageScanner, MockImageScanner};
    use crate::psbt::StaticFundingProvider;
    use crate::storage::MemoryContractStore;

    fn service_with(scanner: Arc<dyn ImageScanner>) -> ContractLifecycle {
        let chain = Arc::new(MemoryChain::new());
        let (tx, _rx) = event_channel();
        let monitor = Arc::new(TransactionMonitor::new(chain.clone(), tx, 0));
        ContractLifecycle::new(
            Arc::new(MemoryContractStore::new()),
            chain,
            monitor,
            Arc::new(StaticFundingProvider::new()),
            scanner,
            Arc::new(ManualClock::default()),
            LifecycleSettings {
                funding_mode: FundingMode::Commitment,
                ..LifecycleSettings::default()
            },
        )
    }

    fn task(title: &str, budget: u64) -> TaskSpec {
        TaskSpec {
            title: title.into(),
            description: String::new(),
            budget_sats: budget,
            skills: vec![],
        }
    }

    #[tokio::test]
    async fn test_ingest_without_message_is_invalid() {
        let mut scanner = MockImageScanner::new();
        scanner.expect_scan().returning(|_| Ok(None));
        let service = service_with(Arc::new(scanner));

        let wish = service.ingest(b"plain pixels").await.unwrap();
        assert_eq!(wish.status, IngestionStatus::Invalid);
        assert!(wish.visible_pixel_hash.is_empty());

        let err = service
            .create_proposal(NewProposal {
                ingestion_id: wish.id,
                title: "p".into(),
                description: String::new(),
                budget_sats: 10_000,
                tasks: vec![task("t", 10_000)],
                visible_pixel_hash: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(err.current_status(), Some("invalid"));
    }

    #[tokio::test]
    async fn test_proposal_tasks_must_fit_budget() {
        let service = service_with(Arc::new(FixedMessageScanner::new(Some("wish".into()))));
        let wish = service.ingest(b"img").await.unwrap();

        let err = service
            .create_proposal(NewProposal {
                ingestion_id: wish.id.clone(),
                title: "p".into(),
                description: String::new(),
                budget_sats: 10_000,
                tasks: vec![task("a", 6_000), task("b", 6_000)],
                visible_pixel_hash: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = service
            .create_proposal(NewProposal {
                ingestion_id: wish.id,
                title: "p".into(),
                description: String::new(),
                budget_sats: 10_000,
                tasks: vec![task("a", 6_000)],
                visible_pixel_hash: Some("00".repeat(32)),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_commitment_contract_rejects_escrow_terms() {
        let service = service_with(Arc::new(FixedMessageScanner::new(Some("wish".into()))));
        let wish = service.ingest(b"img").await.unwrap();
        let proposal = service
            .create_proposal(NewProposal {
                ingestion_id: wish.id,
                title: "p".into(),
                description: String::new(),
                budget_sats: 10_000,
                tasks: vec![task("a", 10_000)],
                visible_pixel_hash: None,
            })
            .await
            .unwrap();

        let err = service
            .approve_proposal(
                &proposal.id,
                ApprovalTerms {
                    funding_mode: Some(FundingMode::Commitment),
                    escrow: Some(EscrowTerms {
                        escrow_type: EscrowType::Taproot,
                        participants: vec![],
                        timelock: None,
                    }),
                    deadline: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(service.get_proposal(&proposal.id).await.unwrap().status, ProposalStatus::Pending);
    }

    #[test]
    fn test_funded_needs_every_funding_proof_confirmed() {
        let proof = |status| MerkleProof {
            tx_id: "ab".repeat(32),
            contract_id: Some("c".into()),
            role: TxRole::Funding,
            block_height: 1,
            block_header_merkle_root: String::new(),
            proof_path: vec![],
            status,
            confirmations: 0,
            verified_at: None,
            version: 1,
        };
        assert!(!is_funded(&[]));
        assert!(is_funded(&[proof(ProofStatus::Confirmed)]));
        assert!(!is_funded(&[proof(ProofStatus::Confirmed), proof(ProofStatus::Provisional)]));
    }
}
