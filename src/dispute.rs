//! Dispute Resolution
//!
//! Weighted arbitrator voting over a contested submission.
//!
//! - one live vote per arbitrator; re-voting replaces the earlier vote
//! - `resolve` needs `quorum` distinct voters
//! - the claimant wins only with strictly more weight; a tie upholds the payout
//! - one appeal per dispute, voted on by a fresh arbitrator set

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::common::{log_lifecycle_event, ErrorKind};
use crate::storage::{ContractStore, EntityStoreExt, StorageError};
use crate::types::{
    new_id, Dispute, DisputeOutcome, DisputeStatus, StatusMachine, Vote, VoteDecision,
};

#[derive(Debug, Error)]
pub enum DisputeError {
    #[error("cannot {action} dispute {dispute_id} while it is {status}")]
    InvalidState {
        dispute_id: String,
        status: String,
        action: &'static str,
    },

    #[error("{arbitrator} is not an arbitrator on dispute {dispute_id}")]
    NotArbitrator { dispute_id: String, arbitrator: String },

    #[error("quorum not reached: {voters} of {quorum} arbitrators voted")]
    QuorumNotReached { voters: usize, quorum: usize },

    #[error("dispute {0} was already appealed")]
    AlreadyAppealed(String),

    #[error("invalid dispute request: {0}")]
    Validation(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl DisputeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidState { .. } | Self::QuorumNotReached { .. } | Self::AlreadyAppealed(_) => {
                ErrorKind::InvalidState
            }
            Self::NotArbitrator { .. } | Self::Validation(_) => ErrorKind::Validation,
            Self::Storage(StorageError::VersionConflict { .. }) => ErrorKind::Conflict,
            Self::Storage(StorageError::NotFound(_)) => ErrorKind::NotFound,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }
}

pub type DisputeResult<T> = Result<T, DisputeError>;

/// Weighted vote totals for the current round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub claimant: u64,
    pub respondent: u64,
    pub voters: usize,
}

impl Tally {
    pub fn of(dispute: &Dispute) -> Self {
        dispute.votes.iter().fold(Self::default(), |mut t, v| {
            match v.decision {
                VoteDecision::Claimant => t.claimant += v.weight as u64,
                VoteDecision::Respondent => t.respondent += v.weight as u64,
            }
            t.voters += 1;
            t
        })
    }

    /// Strict majority for the claimant reverses; anything else upholds
    pub fn outcome(&self) -> DisputeOutcome {
        if self.claimant > self.respondent {
            DisputeOutcome::ReversePayout
        } else {
            DisputeOutcome::UpholdPayout
        }
    }
}

/// Parameters for a new dispute
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenDispute {
    pub contract_id: String,
    #[serde(default)]
    pub submission_id: Option<String>,
    pub claimant: String,
    pub respondent: String,
    pub evidence: String,
    pub arbitrators: Vec<String>,
    pub quorum: usize,
}

fn check_panel(arbitrators: &[String], quorum: usize, parties: &[&str]) -> DisputeResult<()> {
    if arbitrators.is_empty() {
        return Err(DisputeError::Validation("at least one arbitrator required".into()));
    }
    let unique: HashSet<&String> = arbitrators.iter().collect();
    if unique.len() != arbitrators.len() {
        return Err(DisputeError::Validation("duplicate arbitrator".into()));
    }
    if arbitrators.iter().any(|a| parties.contains(&a.as_str())) {
        return Err(DisputeError::Validation("a party cannot arbitrate its own dispute".into()));
    }
    if quorum == 0 || quorum > arbitrators.len() {
        return Err(DisputeError::Validation(format!(
            "quorum {} invalid for {} arbitrators",
            quorum,
            arbitrators.len()
        )));
    }
    Ok(())
}

fn transition(dispute: &mut Dispute, next: DisputeStatus, action: &'static str) -> DisputeResult<()> {
    if !dispute.status.can_transition_to(next) {
        return Err(DisputeError::InvalidState {
            dispute_id: dispute.dispute_id.clone(),
            status: dispute.status.to_string(),
            action,
        });
    }
    dispute.status = next;
    Ok(())
}

pub struct DisputeResolution {
    store: Arc<dyn ContractStore>,
}

impl DisputeResolution {
    pub fn new(store: Arc<dyn ContractStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, dispute_id: &str) -> DisputeResult<Dispute> {
        Ok(self.store.require::<Dispute>(dispute_id).await?)
    }

    async fn commit(&self, mut dispute: Dispute, event: &str) -> DisputeResult<Dispute> {
        dispute.updated_at = Utc::now();
        self.store.save(&dispute).await?;
        dispute.version += 1;
        log_lifecycle_event(event, "dispute", &dispute.dispute_id, dispute.status.as_str(), None);
        Ok(dispute)
    }

    pub async fn open(&self, request: OpenDispute) -> DisputeResult<Dispute> {
        if request.claimant == request.respondent {
            return Err(DisputeError::Validation("claimant and respondent must differ".into()));
        }
        check_panel(
            &request.arbitrators,
            request.quorum,
            &[&request.claimant, &request.respondent],
        )?;

        let now = Utc::now();
        let dispute = Dispute {
            dispute_id: new_id("dispute"),
            contract_id: request.contract_id,
            submission_id: request.submission_id,
            claimant: request.claimant,
            respondent: request.respondent,
            evidence: request.evidence,
            arbitrators: request.arbitrators,
            quorum: request.quorum,
            votes: Vec::new(),
            status: DisputeStatus::Open,
            outcome: None,
            appealed: false,
            round: 1,
            created_at: now,
            updated_at: now,
            version: 0,
        };

        info!(
            dispute_id = %dispute.dispute_id,
            contract_id = %dispute.contract_id,
            arbitrators = dispute.arbitrators.len(),
            quorum = dispute.quorum,
            "Dispute opened"
        );
        self.commit(dispute, "dispute_opened").await
    }

    /// Cast or replace `arbitrator`'s vote
    pub async fn vote(
        &self,
        dispute_id: &str,
        arbitrator: &str,
        decision: VoteDecision,
        weight: u32,
    ) -> DisputeResult<Dispute> {
        let mut dispute = self.get(dispute_id).await?;

        match dispute.status {
            DisputeStatus::Voting => {}
            DisputeStatus::Open | DisputeStatus::Appealed => transition(&mut dispute, DisputeStatus::Voting, "vote on")?,
            _ => {
                return Err(DisputeError::InvalidState {
                    dispute_id: dispute_id.to_string(),
                    status: dispute.status.to_string(),
                    action: "vote on",
                })
            }
        }
        if !dispute.arbitrators.iter().any(|a| a == arbitrator) {
            return Err(DisputeError::NotArbitrator {
                dispute_id: dispute_id.to_string(),
                arbitrator: arbitrator.to_string(),
            });
        }
        if weight == 0 {
            return Err(DisputeError::Validation("vote weight must be positive".into()));
        }

        dispute.votes.retain(|v| v.arbitrator != arbitrator);
        dispute.votes.push(Vote {
            arbitrator: arbitrator.to_string(),
            decision,
            weight,
            cast_at: Utc::now(),
        });

        self.commit(dispute, "dispute_vote").await
    }

    /// Close voting and record the outcome
    pub async fn resolve(&self, dispute_id: &str) -> DisputeResult<Dispute> {
        let mut dispute = self.get(dispute_id).await?;
        if dispute.status != DisputeStatus::Voting {
            return Err(DisputeError::InvalidState {
                dispute_id: dispute_id.to_string(),
                status: dispute.status.to_string(),
                action: "resolve",
            });
        }

        let tally = Tally::of(&dispute);
        if tally.voters < dispute.quorum {
            return Err(DisputeError::QuorumNotReached {
                voters: tally.voters,
                quorum: dispute.quorum,
            });
        }

        transition(&mut dispute, DisputeStatus::Resolved, "resolve")?;
        let outcome = tally.outcome();
        dispute.outcome = Some(outcome);

        info!(
            dispute_id,
            claimant = tally.claimant,
            respondent = tally.respondent,
            outcome = ?outcome,
            round = dispute.round,
            "Dispute resolved"
        );
        self.commit(dispute, "dispute_resolved").await
    }

    /// Reopen a resolved dispute once, with a disjoint arbitrator panel
    pub async fn appeal(
        &self,
        dispute_id: &str,
        arbitrators: Vec<String>,
        quorum: usize,
    ) -> DisputeResult<Dispute> {
        let mut dispute = self.get(dispute_id).await?;
        if dispute.appealed {
            return Err(DisputeError::AlreadyAppealed(dispute_id.to_string()));
        }
        check_panel(&arbitrators, quorum, &[&dispute.claimant, &dispute.respondent])?;
        if arbitrators.iter().any(|a| dispute.arbitrators.contains(a)) {
            return Err(DisputeError::Validation("appeal panel must not reuse arbitrators".into()));
        }

        transition(&mut dispute, DisputeStatus::Appealed, "appeal")?;
        dispute.appealed = true;
        dispute.round += 1;
        dispute.arbitrators = arbitrators;
        dispute.quorum = quorum;
        dispute.votes.clear();
        dispute.outcome = None;

        info!(dispute_id, round = dispute.round, "Dispute appealed");
        self.commit(dispute, "dispute_appealed").await
    }
}
