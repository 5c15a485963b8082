//! End-to-end lifecycle tests
//!
//! Everything runs against the in-memory chain, store and a manual clock, so
//! no network or database is needed.

use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::PublicKey;
use chrono::{Duration, Utc};
use std::str::FromStr;
use std::sync::Arc;

use wishfund::chain::{random_txid, MemoryChain};
use wishfund::dispute::OpenDispute;
use wishfund::lifecycle::{
    event_channel, ApprovalTerms, ClaimSweeper, Clock, ContractLifecycle, EscrowTerms, EventReceiver,
    EventSender, FixedMessageScanner, LifecycleSettings, ManualClock, NewProposal,
    PayoutPsbtRequest, RefundRequest, ReviewDecision, TaskPayout, WorkSubmission,
};
use wishfund::monitor::TransactionMonitor;
use wishfund::psbt::{decode_psbt, StaticFundingProvider, Utxo};
use wishfund::storage::MemoryContractStore;
use wishfund::types::{
    ClaimStatus, ContractStatus, DisputeOutcome, DisputeStatus, EntityKind, EscrowStatus,
    EscrowType, FundingMode, ProofStatus, ProposalStatus, SubmissionStatus, TaskSpec, TaskStatus,
    TxRole, VoteDecision,
};
use wishfund::ErrorKind;

/// BIP-173 testnet P2WPKH vector
const PAYEE: &str = "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx";
const PAYEE_SPK: &str = "0014751e76e8199196d454941c45d1b3a323f1433bd6";
/// BIP-173 testnet P2WSH vector
const STRANGER: &str = "tb1qrp33g0q5c5txsp9arysrx4k6zdkfs4nce4xj0gdcccefvpysxf3q0sl5k7";

struct Harness {
    service: Arc<ContractLifecycle>,
    chain: Arc<MemoryChain>,
    clock: Arc<ManualClock>,
    store: Arc<MemoryContractStore>,
    funding: Arc<StaticFundingProvider>,
    monitor: Arc<TransactionMonitor>,
    events_tx: EventSender,
    events: EventReceiver,
}

impl Harness {
    fn new(funding_mode: FundingMode, min_confirmations: u32) -> Self {
        let chain = Arc::new(MemoryChain::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryContractStore::new());
        let funding = Arc::new(StaticFundingProvider::new());
        let (events_tx, events) = event_channel();
        let monitor = Arc::new(TransactionMonitor::new(chain.clone(), events_tx.clone(), 6));

        let service = ContractLifecycle::new(
            store.clone(),
            chain.clone(),
            monitor.clone(),
            funding.clone(),
            Arc::new(FixedMessageScanner::new(Some("a roof for the library".into()))),
            clock.clone(),
            LifecycleSettings {
                claim_ttl: Duration::hours(1),
                min_confirmations,
                funding_mode,
                fee_rate: 1,
                ..LifecycleSettings::default()
            },
        );

        Self {
            service: Arc::new(service),
            chain,
            clock,
            store,
            funding,
            monitor,
            events_tx,
            events,
        }
    }

    /// Apply every queued monitor/sweeper event
    async fn drain_events(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.events.try_recv() {
            self.service.handle_event(event).await.unwrap();
            applied += 1;
        }
        applied
    }

    async fn proposal(&self, budget: u64, tasks: &[u64]) -> String {
        let wish = self.service.ingest(b"carrier image").await.unwrap();
        let proposal = self
            .service
            .create_proposal(NewProposal {
                ingestion_id: wish.id,
                title: "library roof".into(),
                description: "fix the leak".into(),
                budget_sats: budget,
                tasks: tasks
                    .iter()
                    .enumerate()
                    .map(|(i, b)| TaskSpec {
                        title: format!("task {}", i),
                        description: String::new(),
                        budget_sats: *b,
                        skills: vec![],
                    })
                    .collect(),
                visible_pixel_hash: None,
            })
            .await
            .unwrap();
        proposal.id
    }

    /// Approved proposal; returns (proposal_id, contract_id, first task id)
    async fn contract(&self, budget: u64, terms: ApprovalTerms) -> (String, String, String) {
        let proposal_id = self.proposal(budget, &[budget]).await;
        let contract = self.service.approve_proposal(&proposal_id, terms).await.unwrap();
        let tasks = self.service.tasks_for_proposal(&proposal_id).await.unwrap();
        (proposal_id, contract.contract_id, tasks[0].task_id.clone())
    }

    /// Claim and submit; returns (claim_id, submission_id)
    async fn submit(&self, task_id: &str, agent: &str) -> (String, String) {
        let claim = self.service.claim_task(task_id, agent).await.unwrap();
        let submission = self
            .service
            .submit_claim(
                &claim.claim_id,
                agent,
                WorkSubmission {
                    deliverables: serde_json::json!({ "photos": 3 }),
                    completion_proof: "ipfs://roof".into(),
                },
            )
            .await
            .unwrap();
        (claim.claim_id, submission.submission_id)
    }

    /// Claim, submit and approve the work on `task_id`
    async fn approve(&self, task_id: &str, agent: &str) {
        let (_, submission_id) = self.submit(task_id, agent).await;
        self.service
            .review_submission(&submission_id, ReviewDecision::Approve, None)
            .await
            .unwrap();
    }

    /// Confirmed commitment funding for `contract_id`
    async fn fund(&mut self, contract_id: &str) {
        let funding_txid = random_txid();
        self.chain.mine_block(&[funding_txid.as_str()]).await.unwrap();
        let proof = self.chain.proof_for(&funding_txid, TxRole::Funding).await.unwrap();
        let stored = self.service.submit_funding_proof(contract_id, proof, 0, None).await.unwrap();
        assert_eq!(stored.status, ProofStatus::Confirmed);
        self.drain_events().await;
    }

    /// 2-of-3 escrow contract funded by `PAYEE`; returns (contract_id, task_id)
    async fn escrow_contract(&mut self, budget: u64) -> (String, String) {
        let (_, contract_id, task_id) = self
            .contract(
                budget,
                ApprovalTerms {
                    funding_mode: Some(FundingMode::Escrow),
                    escrow: Some(EscrowTerms {
                        escrow_type: EscrowType::Multisig2of3,
                        participants: vec![key(1), key(2), key(3)],
                        timelock: None,
                    }),
                    deadline: None,
                },
            )
            .await;
        assert_eq!(self.service.get_escrow(&contract_id).await.unwrap().status, EscrowStatus::Created);

        // Unmined txs have no proof to fetch
        let funding_txid = random_txid();
        let err = self
            .service
            .fetch_funding_proof(&contract_id, &funding_txid, 0, Some(PAYEE))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        self.chain.mine_block(&[funding_txid.as_str()]).await.unwrap();
        self.service
            .fetch_funding_proof(&contract_id, &funding_txid, 0, Some(PAYEE))
            .await
            .unwrap();
        self.drain_events().await;
        (contract_id, task_id)
    }
}

fn escrow_payout(task_id: &str, amount_sats: u64) -> PayoutPsbtRequest {
    PayoutPsbtRequest {
        payouts: vec![TaskPayout {
            task_id: task_id.into(),
            address: PAYEE.into(),
            amount_sats,
        }],
        fee_rate: Some(2),
        funding_source: None,
        change_address: None,
        commitment_sats: None,
        include_commitment: false,
    }
}

fn commitment_payout(task_id: &str, amount_sats: u64) -> PayoutPsbtRequest {
    PayoutPsbtRequest {
        payouts: vec![TaskPayout {
            task_id: task_id.into(),
            address: PAYEE.into(),
            amount_sats,
        }],
        fee_rate: Some(1),
        funding_source: Some("treasury".into()),
        change_address: Some(PAYEE.into()),
        commitment_sats: None,
        include_commitment: true,
    }
}

fn key(seed: u8) -> String {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
    PublicKey::new(bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &sk)).to_string()
}

fn utxo(value: u64) -> Utxo {
    Utxo {
        txid: random_txid(),
        vout: 0,
        value,
        script_pubkey: PAYEE_SPK.into(),
        witness_script: None,
    }
}

#[tokio::test]
async fn test_full_flow_ends_published_and_funded() {
    let mut h = Harness::new(FundingMode::Commitment, 3);
    let (proposal_id, contract_id, task_id) = h.contract(100_000, ApprovalTerms::default()).await;

    let (_, submission_id) = h.submit(&task_id, "agent-1").await;
    h.service
        .review_submission(&submission_id, ReviewDecision::Approve, None)
        .await
        .unwrap();

    let proposal = h.service.publish_proposal(&proposal_id).await.unwrap();
    assert_eq!(proposal.status, ProposalStatus::Published);
    assert_eq!(h.service.get_task(&task_id).await.unwrap().status, TaskStatus::Published);
    assert_eq!(h.service.get_contract(&contract_id).await.unwrap().status, ContractStatus::Active);

    // Funding tx mined but shallow
    let funding_txid = random_txid();
    h.chain.mine_block(&[funding_txid.as_str()]).await.unwrap();
    let proof = h.chain.proof_for(&funding_txid, TxRole::Funding).await.unwrap();
    let stored = h.service.submit_funding_proof(&contract_id, proof, 0, None).await.unwrap();
    assert_eq!(stored.status, ProofStatus::Provisional);
    assert!(h.monitor.is_tracked(&funding_txid).await);

    let status = h.service.get_funding_status(&contract_id).await.unwrap();
    assert!(!status.funded);
    assert_eq!(status.status, ContractStatus::Active);

    // Required depth reached
    h.chain.mine_empty(2).await;
    let report = h.monitor.poll_once().await;
    assert_eq!(report.confirmed, vec![funding_txid.clone()]);
    assert_eq!(h.drain_events().await, 1);

    let status = h.service.get_funding_status(&contract_id).await.unwrap();
    assert!(status.funded);
    assert_eq!(status.status, ContractStatus::Funded);
    assert_eq!(status.proofs[0].status, ProofStatus::Confirmed);
    assert_eq!(h.service.get_contract(&contract_id).await.unwrap().status, ContractStatus::Funded);
}

#[tokio::test]
async fn test_reorg_reverts_derived_funding() {
    let mut h = Harness::new(FundingMode::Commitment, 1);
    let (_, contract_id, _) = h.contract(30_000, ApprovalTerms::default()).await;

    let funding_txid = random_txid();
    h.chain.mine_block(&[funding_txid.as_str()]).await.unwrap();
    let proof = h.chain.proof_for(&funding_txid, TxRole::Funding).await.unwrap();
    h.service.submit_funding_proof(&contract_id, proof, 0, None).await.unwrap();

    h.monitor.poll_once().await;
    h.drain_events().await;
    assert!(h.service.get_funding_status(&contract_id).await.unwrap().funded);
    assert!(h.monitor.is_watching(&funding_txid).await);

    h.chain.remove_tx(&funding_txid).await;
    let report = h.monitor.poll_once().await;
    assert_eq!(report.reorged, vec![funding_txid.clone()]);
    h.drain_events().await;

    let status = h.service.get_funding_status(&contract_id).await.unwrap();
    assert!(!status.funded);
    assert_eq!(status.status, ContractStatus::Active);
    assert_eq!(status.stored_status, ContractStatus::Funded);
    assert_eq!(status.proofs[0].status, ProofStatus::Provisional);
    assert!(h.monitor.is_tracked(&funding_txid).await);
}

#[tokio::test]
async fn test_concurrent_claims_exactly_one_wins() {
    let h = Harness::new(FundingMode::Commitment, 1);
    let (_, _, task_id) = h.contract(10_000, ApprovalTerms::default()).await;

    let attempts = (0..8).map(|i| {
        let service = h.service.clone();
        let task_id = task_id.clone();
        tokio::spawn(async move { service.claim_task(&task_id, &format!("agent-{}", i)).await })
    });
    let results: Vec<_> = futures_util::future::join_all(attempts)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.current_status(), Some("claimed"));
    }

    let task = h.service.get_task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Claimed);
    assert_eq!(task.active_claim_id.as_deref(), Some(winners[0].claim_id.as_str()));
}

#[tokio::test]
async fn test_sweeper_expires_claim_after_ttl() {
    let mut h = Harness::new(FundingMode::Commitment, 1);
    let (_, _, task_id) = h.contract(10_000, ApprovalTerms::default()).await;
    let claim = h.service.claim_task(&task_id, "slow-agent").await.unwrap();
    assert_eq!(claim.expires_at, h.clock.now() + Duration::hours(1));

    let sweeper = ClaimSweeper::new(h.store.clone(), h.clock.clone(), h.events_tx.clone());
    assert!(sweeper.sweep_once().await.unwrap().expired_claims.is_empty());

    h.clock.advance(Duration::minutes(61));
    let report = sweeper.sweep_once().await.unwrap();
    assert_eq!(report.expired_claims, vec![claim.claim_id.clone()]);
    h.drain_events().await;

    assert_eq!(h.service.get_claim(&claim.claim_id).await.unwrap().status, ClaimStatus::Expired);
    let task = h.service.get_task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Available);
    assert!(task.active_claim_id.is_none());

    // Late submission is refused, the task is open again
    let err = h
        .service
        .submit_claim(&claim.claim_id, "slow-agent", WorkSubmission::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    h.service.claim_task(&task_id, "fast-agent").await.unwrap();
}

#[tokio::test]
async fn test_stale_claim_expires_without_sweeper() {
    let h = Harness::new(FundingMode::Commitment, 1);
    let proposal_id = h.proposal(20_000, &[10_000, 10_000]).await;
    h.service.approve_proposal(&proposal_id, ApprovalTerms::default()).await.unwrap();
    let tasks = h.service.tasks_for_proposal(&proposal_id).await.unwrap();
    let (first, second) = (tasks[0].task_id.clone(), tasks[1].task_id.clone());

    let stale = h.service.claim_task(&first, "slow-agent").await.unwrap();
    let err = h.service.claim_task(&first, "fast-agent").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let idle = h.service.claim_task(&second, "slow-agent").await.unwrap();

    h.clock.advance(Duration::minutes(61));

    // A new claim takes over the expired one
    let fresh = h.service.claim_task(&first, "fast-agent").await.unwrap();
    assert_eq!(h.service.get_claim(&stale.claim_id).await.unwrap().status, ClaimStatus::Expired);
    let task = h.service.get_task(&first).await.unwrap();
    assert_eq!(task.status, TaskStatus::Claimed);
    assert_eq!(task.active_claim_id.as_deref(), Some(fresh.claim_id.as_str()));

    // Reads alone release the task
    let task = h.service.get_task(&second).await.unwrap();
    assert_eq!(task.status, TaskStatus::Available);
    assert!(task.active_claim_id.is_none());
    assert_eq!(h.service.get_claim(&idle.claim_id).await.unwrap().status, ClaimStatus::Expired);
}

#[tokio::test]
async fn test_sweeper_expires_contract_past_deadline() {
    let mut h = Harness::new(FundingMode::Commitment, 1);
    let deadline = Utc::now() + Duration::days(1);
    let (_, contract_id, task_id) = h
        .contract(
            10_000,
            ApprovalTerms {
                deadline: Some(deadline),
                ..ApprovalTerms::default()
            },
        )
        .await;

    h.clock.advance(Duration::days(2));
    let sweeper = ClaimSweeper::new(h.store.clone(), h.clock.clone(), h.events_tx.clone());
    let report = sweeper.sweep_once().await.unwrap();
    assert_eq!(report.expired_contracts, vec![contract_id.clone()]);
    h.drain_events().await;

    assert_eq!(h.service.get_contract(&contract_id).await.unwrap().status, ContractStatus::Expired);
    let err = h.service.claim_task(&task_id, "late").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_approve_twice_is_idempotent() {
    let h = Harness::new(FundingMode::Commitment, 1);
    let proposal_id = h.proposal(20_000, &[12_000, 8_000]).await;

    let first = h.service.approve_proposal(&proposal_id, ApprovalTerms::default()).await.unwrap();
    let second = h.service.approve_proposal(&proposal_id, ApprovalTerms::default()).await.unwrap();
    assert_eq!(first.contract_id, second.contract_id);
    assert_eq!(first.total_budget_sats, 20_000);

    let counts = h.store.counts().await;
    assert_eq!(counts.get(&EntityKind::Contract), Some(&1));
    assert_eq!(counts.get(&EntityKind::Task), Some(&2));
    assert_eq!(h.service.tasks_for_proposal(&proposal_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_rejection_reopens_task() {
    let h = Harness::new(FundingMode::Commitment, 1);
    let (proposal_id, _, task_id) = h.contract(10_000, ApprovalTerms::default()).await;
    let (claim_id, submission_id) = h.submit(&task_id, "agent-1").await;
    assert_eq!(h.service.get_task(&task_id).await.unwrap().status, TaskStatus::Submitted);

    let submission = h
        .service
        .review_submission(&submission_id, ReviewDecision::Reject, Some("blurry photos".into()))
        .await
        .unwrap();
    assert_eq!(submission.status, SubmissionStatus::Rejected);
    assert_eq!(h.service.get_claim(&claim_id).await.unwrap().status, ClaimStatus::Rejected);
    assert_eq!(h.service.get_task(&task_id).await.unwrap().status, TaskStatus::Available);

    // A second review of a terminal submission conflicts
    let err = h
        .service
        .review_submission(&submission_id, ReviewDecision::Approve, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let err = h.service.publish_proposal(&proposal_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Incomplete);

    h.service.claim_task(&task_id, "agent-2").await.unwrap();
}

#[tokio::test]
async fn test_payout_psbt_insufficient_funds() {
    let mut h = Harness::new(FundingMode::Commitment, 1);
    let (_, contract_id, task_id) = h.contract(50_000, ApprovalTerms::default()).await;
    h.fund(&contract_id).await;
    h.approve(&task_id, "agent-1").await;
    h.funding.add("treasury", utxo(25_000)).await;
    h.funding.add("treasury", utxo(15_000)).await;

    let err = h
        .service
        .build_payout_psbt(&contract_id, commitment_payout(&task_id, 50_000))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
    assert!(h.service.get_contract(&contract_id).await.unwrap().pending_payout.is_none());
}

#[tokio::test]
async fn test_commitment_payout_balances_and_settles() {
    let mut h = Harness::new(FundingMode::Commitment, 1);
    let (_, contract_id, task_id) = h.contract(50_000, ApprovalTerms::default()).await;
    h.fund(&contract_id).await;
    h.approve(&task_id, "agent-1").await;
    h.funding.add("treasury", utxo(80_000)).await;

    let built = h
        .service
        .build_payout_psbt(&contract_id, commitment_payout(&task_id, 50_000))
        .await
        .unwrap();

    assert!(built.balances());
    assert_eq!(built.selected_sats, 80_000);
    assert_eq!(built.payouts_total, 50_000);
    assert_eq!(built.commitment_sats, 546);
    assert!(built.commitment_vout.is_some());
    assert_eq!(h.service.get_task(&task_id).await.unwrap().paid_sats, 0);

    h.chain.mine_block(&[built.txid.as_str()]).await.unwrap();
    h.monitor.poll_once().await;
    h.drain_events().await;

    assert_eq!(h.service.get_task(&task_id).await.unwrap().paid_sats, 50_000);
    assert!(h.service.get_contract(&contract_id).await.unwrap().pending_payout.is_none());

    // The task's budget is spent
    let err = h
        .service
        .build_payout_psbt(&contract_id, commitment_payout(&task_id, 1_000))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_commitment_payout_requires_funding() {
    let h = Harness::new(FundingMode::Commitment, 1);
    let (_, contract_id, task_id) = h.contract(50_000, ApprovalTerms::default()).await;
    h.approve(&task_id, "agent-1").await;
    h.funding.add("treasury", utxo(80_000)).await;

    let err = h
        .service
        .build_payout_psbt(&contract_id, commitment_payout(&task_id, 50_000))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(err.current_status(), Some("active"));
}

#[tokio::test]
async fn test_payout_only_for_approved_tasks_of_the_contract() {
    let mut h = Harness::new(FundingMode::Escrow, 1);
    let (contract_id, task_id) = h.escrow_contract(100_000).await;

    // Nobody has delivered the task yet
    let err = h
        .service
        .build_payout_psbt(&contract_id, escrow_payout(&task_id, 90_000))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(err.current_status(), Some("available"));

    // An approved task from another contract cannot draw on this escrow
    let (_, _, other_task) = h
        .contract(
            10_000,
            ApprovalTerms {
                funding_mode: Some(FundingMode::Commitment),
                ..ApprovalTerms::default()
            },
        )
        .await;
    h.approve(&other_task, "agent-2").await;
    let err = h
        .service
        .build_payout_psbt(&contract_id, escrow_payout(&other_task, 10_000))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let escrow = h.service.get_escrow(&contract_id).await.unwrap();
    assert_eq!(escrow.remaining_sats, 100_000);
    assert!(escrow.payout_txids.is_empty());
}

#[tokio::test]
async fn test_escrow_payout_settles_on_confirmation() {
    let mut h = Harness::new(FundingMode::Escrow, 1);
    let (contract_id, task_id) = h.escrow_contract(100_000).await;
    let escrow = h.service.get_escrow(&contract_id).await.unwrap();
    assert_eq!(escrow.status, EscrowStatus::Funded);
    assert_eq!(h.service.get_contract(&contract_id).await.unwrap().status, ContractStatus::Funded);
    h.approve(&task_id, "agent-1").await;

    let first = h
        .service
        .build_payout_psbt(&contract_id, escrow_payout(&task_id, 60_000))
        .await
        .unwrap();
    assert!(first.balances());
    assert_eq!(first.selected_sats, 100_000);
    assert!(first.change_vout.is_some());

    // Nothing moves until the payout confirms
    let escrow = h.service.get_escrow(&contract_id).await.unwrap();
    assert_eq!(escrow.remaining_sats, 100_000);
    assert!(escrow.payout_txids.is_empty());
    assert_eq!(h.service.get_task(&task_id).await.unwrap().paid_sats, 0);
    let pending = h.service.get_contract(&contract_id).await.unwrap().pending_payout.unwrap();
    assert_eq!(pending.txid, first.txid);
    assert!(h.monitor.is_tracked(&first.txid).await);

    // A rebuild spends the same escrow output and replaces the pending payout
    let second = h
        .service
        .build_payout_psbt(&contract_id, escrow_payout(&task_id, 30_000))
        .await
        .unwrap();
    assert_eq!(second.inputs[0].txid, first.inputs[0].txid);
    assert_eq!(second.inputs[0].vout, first.inputs[0].vout);
    assert_ne!(second.txid, first.txid);
    assert!(!h.monitor.is_tracked(&first.txid).await);
    assert!(h.monitor.is_tracked(&second.txid).await);
    let pending = h.service.get_contract(&contract_id).await.unwrap().pending_payout.unwrap();
    assert_eq!(pending.txid, second.txid);
    assert_eq!(pending.allocations[0].amount_sats, 30_000);

    h.chain.mine_block(&[second.txid.as_str()]).await.unwrap();
    h.monitor.poll_once().await;
    h.drain_events().await;

    let escrow = h.service.get_escrow(&contract_id).await.unwrap();
    assert_eq!(escrow.status, EscrowStatus::Funded);
    assert_eq!(escrow.remaining_sats, second.change_sats);
    assert_eq!(escrow.payout_txids, vec![second.txid.clone()]);
    assert_eq!(h.service.get_task(&task_id).await.unwrap().paid_sats, 30_000);
    assert!(h.service.get_contract(&contract_id).await.unwrap().pending_payout.is_none());

    // More than the task has left
    let err = h
        .service
        .build_payout_psbt(&contract_id, escrow_payout(&task_id, 80_000))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    // Within the task's budget but more than the escrow holds
    let err = h
        .service
        .build_payout_psbt(&contract_id, escrow_payout(&task_id, 70_000))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
}

#[tokio::test]
async fn test_refund_returns_to_recorded_payer() {
    let mut h = Harness::new(FundingMode::Escrow, 1);
    let (contract_id, _) = h.escrow_contract(50_000).await;
    let escrow = h.service.get_escrow(&contract_id).await.unwrap();
    assert_eq!(escrow.payers[0].address, PAYEE);

    // Approvals may be compressed or x-only keys
    let x_only = PublicKey::from_str(&key(2)).unwrap().inner.x_only_public_key().0.to_string();
    let approvals = vec![key(1), x_only];

    let err = h
        .service
        .refund_escrow(
            &contract_id,
            RefundRequest {
                refund_address: Some(STRANGER.into()),
                approvals: approvals.clone(),
                fee_rate: Some(1),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(h.service.get_escrow(&contract_id).await.unwrap().status, EscrowStatus::Funded);

    let built = h
        .service
        .refund_escrow(
            &contract_id,
            RefundRequest {
                refund_address: None,
                approvals,
                fee_rate: Some(1),
            },
        )
        .await
        .unwrap();
    assert_eq!(built.payouts_total + built.fee_sats, 50_000);

    let psbt = decode_psbt(&built.psbt_base64).unwrap();
    assert!(!psbt.unsigned_tx.output.is_empty());
    for output in &psbt.unsigned_tx.output {
        assert_eq!(output.script_pubkey.to_hex_string(), PAYEE_SPK);
    }

    let escrow = h.service.get_escrow(&contract_id).await.unwrap();
    assert_eq!(escrow.status, EscrowStatus::Refunded);
    assert_eq!(escrow.refund_txid.as_deref(), Some(built.txid.as_str()));
}

#[tokio::test]
async fn test_dispute_majority_and_tie_favor_respondent() {
    let h = Harness::new(FundingMode::Commitment, 1);
    let (_, contract_id, task_id) = h.contract(10_000, ApprovalTerms::default()).await;
    let (_, submission_id) = h.submit(&task_id, "agent-1").await;
    h.service
        .review_submission(&submission_id, ReviewDecision::Approve, None)
        .await
        .unwrap();

    let dispute = h
        .service
        .open_dispute(OpenDispute {
            contract_id: contract_id.clone(),
            submission_id: Some(submission_id.clone()),
            claimant: "funder".into(),
            respondent: "agent-1".into(),
            evidence: "roof still leaks".into(),
            arbitrators: vec!["arb-1".into(), "arb-2".into(), "arb-3".into()],
            quorum: 3,
        })
        .await
        .unwrap();

    let id = dispute.dispute_id;
    h.service.vote_dispute(&id, "arb-1", VoteDecision::Claimant, 1).await.unwrap();
    h.service.vote_dispute(&id, "arb-2", VoteDecision::Respondent, 1).await.unwrap();
    h.service.vote_dispute(&id, "arb-3", VoteDecision::Respondent, 1).await.unwrap();

    let resolved = h.service.resolve_dispute(&id).await.unwrap();
    assert_eq!(resolved.status, DisputeStatus::Resolved);
    assert_eq!(resolved.outcome, Some(DisputeOutcome::UpholdPayout));
    assert_eq!(
        h.service.get_submission(&submission_id).await.unwrap().status,
        SubmissionStatus::Approved
    );

    // Appeal with a fresh panel that splits 1-1
    h.service
        .appeal_dispute(&id, vec!["arb-4".into(), "arb-5".into()], 2)
        .await
        .unwrap();
    h.service.vote_dispute(&id, "arb-4", VoteDecision::Claimant, 1).await.unwrap();
    h.service.vote_dispute(&id, "arb-5", VoteDecision::Respondent, 1).await.unwrap();

    let resolved = h.service.resolve_dispute(&id).await.unwrap();
    assert_eq!(resolved.outcome, Some(DisputeOutcome::UpholdPayout));
    assert_eq!(resolved.round, 2);
}

#[tokio::test]
async fn test_dispute_reversal_rejects_pending_submission() {
    let h = Harness::new(FundingMode::Commitment, 1);
    let (_, contract_id, task_id) = h.contract(10_000, ApprovalTerms::default()).await;
    let (claim_id, submission_id) = h.submit(&task_id, "agent-1").await;

    let dispute = h
        .service
        .open_dispute(OpenDispute {
            contract_id,
            submission_id: Some(submission_id.clone()),
            claimant: "funder".into(),
            respondent: "agent-1".into(),
            evidence: "copied work".into(),
            arbitrators: vec!["arb-1".into(), "arb-2".into(), "arb-3".into()],
            quorum: 2,
        })
        .await
        .unwrap();
    let id = dispute.dispute_id;
    h.service.vote_dispute(&id, "arb-1", VoteDecision::Claimant, 1).await.unwrap();
    h.service.vote_dispute(&id, "arb-2", VoteDecision::Claimant, 1).await.unwrap();

    let resolved = h.service.resolve_dispute(&id).await.unwrap();
    assert_eq!(resolved.outcome, Some(DisputeOutcome::ReversePayout));
    assert_eq!(
        h.service.get_submission(&submission_id).await.unwrap().status,
        SubmissionStatus::Rejected
    );
    assert_eq!(h.service.get_claim(&claim_id).await.unwrap().status, ClaimStatus::Rejected);
    assert_eq!(h.service.get_task(&task_id).await.unwrap().status, TaskStatus::Available);
}
