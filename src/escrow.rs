//! Escrow Manager
//!
//! Derives the funding address for a contract's escrow and walks it through
//! `created → active → funded → paid_out`, or `expired → refunded`.
//!
//! Payout and refund never sign anything. They hand back the escrow outpoint
//! and the outputs to create, which the PSBT builder turns into an unsigned
//! transaction.

use bitcoin::{Address, Network, OutPoint, PublicKey, XOnlyPublicKey};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::common::{log_lifecycle_event, ErrorKind};
use crate::monitor::{TrackedTx, TransactionMonitor};
use crate::psbt::{pro_rata, Payout, Utxo};
use crate::script::{interpret, ScriptError, ScriptParams};
use crate::storage::{ContractStore, EntityStoreExt, StorageError};
use crate::types::{new_id, EscrowContract, EscrowStatus, EscrowType, Payer, StatusMachine, TxRole};

/// Escrow errors
#[derive(Debug, Error)]
pub enum EscrowError {
    #[error("cannot {action} escrow {escrow_id} while it is {status}")]
    InvalidEscrowState {
        escrow_id: String,
        status: String,
        action: &'static str,
    },

    #[error("escrow script: {0}")]
    Script(#[from] ScriptError),

    #[error("requested {requested} sats but escrow holds {remaining} sats")]
    ExceedsBalance { requested: u64, remaining: u64 },

    #[error("timelock {timelock} not reached at height {tip}")]
    TimelockNotElapsed { timelock: u32, tip: u32 },

    #[error("mutual release needs {required} participant approvals, got {provided}")]
    InsufficientApprovals { required: u8, provided: usize },

    #[error("invalid escrow request: {0}")]
    Validation(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl EscrowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidEscrowState { .. } | Self::TimelockNotElapsed { .. } => ErrorKind::InvalidEscrowState,
            Self::Script(_) => ErrorKind::InvalidScript,
            Self::ExceedsBalance { .. } => ErrorKind::InsufficientFunds,
            Self::InsufficientApprovals { .. } | Self::Validation(_) => ErrorKind::Validation,
            Self::Storage(StorageError::VersionConflict { .. }) => ErrorKind::Conflict,
            Self::Storage(StorageError::NotFound(_)) => ErrorKind::NotFound,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }
}

pub type EscrowResult<T> = Result<T, EscrowError>;

/// Why a refund is allowed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundReason {
    /// Escrow expired and its timelock (if any) has passed
    Expired { tip_height: u32 },
    /// Participants agreed to unwind a funded escrow
    MutualRelease { approvals: Vec<String> },
}

/// Spend instructions for the PSBT builder
#[derive(Debug, Clone, Serialize)]
pub struct SpendPlan {
    pub escrow_id: String,
    pub contract_id: String,
    /// Escrow output being spent
    pub input: Utxo,
    pub outputs: Vec<Payout>,
    /// Balance left in escrow; returned to the funding address as change
    pub remaining_sats: u64,
    pub change_address: String,
    pub required_signatures: u8,
}

pub struct EscrowManager {
    store: Arc<dyn ContractStore>,
    monitor: Arc<TransactionMonitor>,
    network: Network,
    min_confirmations: u32,
}

fn template_for(escrow_type: EscrowType) -> &'static str {
    match escrow_type {
        EscrowType::Multisig2of3 => "multisig_2of3",
        EscrowType::Timelock => "timelock",
        EscrowType::Taproot => "taproot",
    }
}

fn transition(escrow: &mut EscrowContract, next: EscrowStatus, action: &'static str) -> EscrowResult<()> {
    if !escrow.status.can_transition_to(next) {
        return Err(EscrowError::InvalidEscrowState {
            escrow_id: escrow.escrow_id.clone(),
            status: escrow.status.to_string(),
            action,
        });
    }
    escrow.status = next;
    escrow.updated_at = Utc::now();
    Ok(())
}

fn require_status(escrow: &EscrowContract, allowed: &[EscrowStatus], action: &'static str) -> EscrowResult<()> {
    if allowed.contains(&escrow.status) {
        Ok(())
    } else {
        Err(EscrowError::InvalidEscrowState {
            escrow_id: escrow.escrow_id.clone(),
            status: escrow.status.to_string(),
            action,
        })
    }
}

/// Participant keys compare as x-only: taproot escrows store them that way
/// while callers pass compressed keys
fn x_only_hex(key: &str) -> Option<String> {
    if let Ok(pk) = PublicKey::from_str(key) {
        return Some(XOnlyPublicKey::from(pk.inner).to_string());
    }
    XOnlyPublicKey::from_str(key).ok().map(|k| k.to_string())
}

fn payer_shares(total: u64, payers: &[Payer]) -> Option<Vec<Payout>> {
    let weights: Vec<Payout> = payers
        .iter()
        .map(|p| Payout {
            address: p.address.clone(),
            amount_sats: p.amount_sats,
        })
        .collect();
    pro_rata(total, &weights)
}

impl EscrowManager {
    pub fn new(
        store: Arc<dyn ContractStore>,
        monitor: Arc<TransactionMonitor>,
        network: Network,
        min_confirmations: u32,
    ) -> Self {
        Self {
            store,
            monitor,
            network,
            min_confirmations,
        }
    }

    /// Build an escrow record for `contract_id`. Not persisted; the caller
    /// commits it with the contract so both appear together.
    pub fn prepare(
        &self,
        contract_id: &str,
        escrow_type: EscrowType,
        participants: &[String],
        amount_sats: u64,
        timelock: Option<u32>,
    ) -> EscrowResult<EscrowContract> {
        if amount_sats == 0 {
            return Err(EscrowError::Validation("escrow amount must be positive".into()));
        }

        let params = ScriptParams {
            pubkeys: participants.to_vec(),
            threshold: None,
            locktime: timelock,
            hash: None,
        };
        let descriptor = interpret(template_for(escrow_type), &params, self.network)?;

        let now = Utc::now();
        Ok(EscrowContract {
            escrow_id: new_id("escrow"),
            contract_id: contract_id.to_string(),
            escrow_type,
            participants: descriptor.participants,
            required_signatures: descriptor.required_signatures,
            amount_sats,
            remaining_sats: amount_sats,
            timelock: descriptor.locktime,
            funding_address: descriptor.address,
            script_pubkey_hex: descriptor.script_pubkey.to_hex_string(),
            script_hex: descriptor.script.to_hex_string(),
            descriptor: descriptor.descriptor,
            funding_txid: None,
            funding_vout: None,
            live_outpoint: None,
            payers: Vec::new(),
            payout_txids: Vec::new(),
            refund_txid: None,
            status: EscrowStatus::Created,
            created_at: now,
            updated_at: now,
            version: 0,
        })
    }

    /// Derive and store a new escrow in `created`
    pub async fn create(
        &self,
        contract_id: &str,
        escrow_type: EscrowType,
        participants: &[String],
        amount_sats: u64,
        timelock: Option<u32>,
    ) -> EscrowResult<EscrowContract> {
        let mut escrow = self.prepare(contract_id, escrow_type, participants, amount_sats, timelock)?;
        self.store.save(&escrow).await?;
        escrow.version += 1;

        info!(
            escrow_id = %escrow.escrow_id,
            contract_id,
            escrow_type = %escrow_type,
            address = %escrow.funding_address,
            "Escrow created"
        );
        log_lifecycle_event("escrow_created", "escrow", &escrow.escrow_id, escrow.status.as_str(), None);
        Ok(escrow)
    }

    pub async fn get(&self, escrow_id: &str) -> EscrowResult<EscrowContract> {
        Ok(self.store.require::<EscrowContract>(escrow_id).await?)
    }

    async fn commit(&self, mut escrow: EscrowContract, event: &str) -> EscrowResult<EscrowContract> {
        self.store.save(&escrow).await?;
        escrow.version += 1;
        log_lifecycle_event(event, "escrow", &escrow.escrow_id, escrow.status.as_str(), None);
        Ok(escrow)
    }

    /// Attach an observed funding tx and start watching it
    pub async fn fund(&self, escrow_id: &str, funding_txid: &str, vout: u32) -> EscrowResult<EscrowContract> {
        let mut escrow = self.get(escrow_id).await?;

        if escrow.status == EscrowStatus::Active && escrow.funding_txid.as_deref() == Some(funding_txid) {
            return Ok(escrow);
        }
        bitcoin::Txid::from_str(funding_txid)
            .map_err(|e| EscrowError::Validation(format!("funding txid {}: {}", funding_txid, e)))?;

        transition(&mut escrow, EscrowStatus::Active, "fund")?;
        escrow.funding_txid = Some(funding_txid.to_string());
        escrow.funding_vout = Some(vout);
        escrow.live_outpoint = Some(format!("{}:{}", funding_txid, vout));

        let escrow = self.commit(escrow, "escrow_funding_attached").await?;
        self.monitor
            .track(TrackedTx::new(
                funding_txid,
                self.min_confirmations,
                TxRole::Funding,
                &escrow.contract_id,
            ))
            .await;
        Ok(escrow)
    }

    /// Funding tx reached depth
    pub async fn mark_funded(&self, escrow_id: &str) -> EscrowResult<EscrowContract> {
        let mut escrow = self.get(escrow_id).await?;
        if escrow.status == EscrowStatus::Funded {
            return Ok(escrow);
        }
        transition(&mut escrow, EscrowStatus::Funded, "mark funded")?;
        info!(escrow_id, amount = escrow.amount_sats, "Escrow funded");
        self.commit(escrow, "escrow_funded").await
    }

    /// Funding tx left the chain before any release
    pub async fn revert_funding(&self, escrow_id: &str) -> EscrowResult<EscrowContract> {
        let mut escrow = self.get(escrow_id).await?;
        if escrow.status != EscrowStatus::Funded {
            return Ok(escrow);
        }
        if escrow.remaining_sats != escrow.amount_sats {
            warn!(escrow_id, "Funding reorged after a release; leaving escrow funded");
            return Ok(escrow);
        }
        transition(&mut escrow, EscrowStatus::Active, "revert funding")?;
        warn!(escrow_id, "Escrow funding reverted by reorg");
        self.commit(escrow, "escrow_funding_reverted").await
    }

    fn live_input(escrow: &EscrowContract) -> EscrowResult<Utxo> {
        let outpoint = escrow
            .live_outpoint
            .as_deref()
            .ok_or_else(|| EscrowError::Validation(format!("escrow {} has no funding outpoint", escrow.escrow_id)))?;
        let outpoint = OutPoint::from_str(outpoint)
            .map_err(|e| EscrowError::Validation(format!("outpoint {}: {}", outpoint, e)))?;

        let witness_script = match escrow.escrow_type {
            EscrowType::Taproot => None,
            _ => Some(escrow.script_hex.clone()),
        };
        Ok(Utxo {
            txid: outpoint.txid.to_string(),
            vout: outpoint.vout,
            value: escrow.remaining_sats,
            script_pubkey: escrow.script_pubkey_hex.clone(),
            witness_script,
        })
    }

    /// Validate a release of `payouts` from the escrow's current output.
    /// Nothing is persisted; the balance only moves in `record_payout`.
    pub fn plan_payout(&self, escrow: &EscrowContract, payouts: Vec<Payout>) -> EscrowResult<SpendPlan> {
        require_status(escrow, &[EscrowStatus::Funded], "pay out")?;

        if payouts.is_empty() {
            return Err(EscrowError::Validation("no payouts requested".into()));
        }
        let requested = payouts
            .iter()
            .try_fold(0u64, |acc, p| acc.checked_add(p.amount_sats))
            .ok_or_else(|| EscrowError::Validation("payout total overflows".into()))?;
        if requested > escrow.remaining_sats {
            return Err(EscrowError::ExceedsBalance {
                requested,
                remaining: escrow.remaining_sats,
            });
        }

        Ok(SpendPlan {
            escrow_id: escrow.escrow_id.clone(),
            contract_id: escrow.contract_id.clone(),
            input: Self::live_input(escrow)?,
            outputs: payouts,
            remaining_sats: escrow.remaining_sats - requested,
            change_address: escrow.funding_address.clone(),
            required_signatures: escrow.required_signatures,
        })
    }

    /// Plan a release of `payouts` from a funded escrow
    pub async fn payout(&self, escrow_id: &str, payouts: Vec<Payout>) -> EscrowResult<SpendPlan> {
        let escrow = self.get(escrow_id).await?;
        let plan = self.plan_payout(&escrow, payouts)?;
        debug!(escrow_id, remaining = plan.remaining_sats, outputs = plan.outputs.len(), "Escrow payout planned");
        Ok(plan)
    }

    /// Plan a partial release of `amount_sats` to one destination
    pub async fn claim(&self, escrow_id: &str, destination: &str, amount_sats: u64) -> EscrowResult<SpendPlan> {
        self.payout(
            escrow_id,
            vec![Payout {
                address: destination.to_string(),
                amount_sats,
            }],
        )
        .await
    }

    /// The escrow after a confirmed payout tx. Its change output,
    /// `(vout, value)`, now holds the balance; without one the escrow is spent
    /// out. `None` when the tx is already recorded.
    pub fn settle_payout(
        escrow: &EscrowContract,
        txid: &str,
        change: Option<(u32, u64)>,
    ) -> EscrowResult<Option<EscrowContract>> {
        if escrow.payout_txids.iter().any(|t| t == txid) {
            return Ok(None);
        }
        require_status(escrow, &[EscrowStatus::Funded], "record payout for")?;

        let mut next = escrow.clone();
        next.payout_txids.push(txid.to_string());
        match change {
            Some((vout, value)) => {
                next.live_outpoint = Some(format!("{}:{}", txid, vout));
                next.remaining_sats = value;
            }
            None => {
                next.live_outpoint = None;
                next.remaining_sats = 0;
            }
        }
        if next.remaining_sats == 0 {
            transition(&mut next, EscrowStatus::PaidOut, "pay out")?;
        }
        next.updated_at = Utc::now();
        Ok(Some(next))
    }

    /// Apply a confirmed payout tx and persist the escrow
    pub async fn record_payout(
        &self,
        escrow_id: &str,
        txid: &str,
        change: Option<(u32, u64)>,
    ) -> EscrowResult<EscrowContract> {
        let escrow = self.get(escrow_id).await?;
        let Some(next) = Self::settle_payout(&escrow, txid, change)? else {
            return Ok(escrow);
        };
        info!(escrow_id, txid, remaining = next.remaining_sats, "Escrow payout confirmed");
        self.commit(next, "escrow_payout_recorded").await
    }

    /// Record who is paying into the escrow. Replaces any earlier record;
    /// only allowed before the escrow is funded.
    pub async fn record_payers(&self, escrow_id: &str, payers: Vec<Payer>) -> EscrowResult<EscrowContract> {
        let mut escrow = self.get(escrow_id).await?;
        require_status(&escrow, &[EscrowStatus::Created, EscrowStatus::Active], "record payers for")?;
        if payers.is_empty() {
            return Err(EscrowError::Validation("at least one payer is required".into()));
        }
        for payer in &payers {
            Address::from_str(&payer.address)
                .map_err(|e| EscrowError::Validation(format!("payer {}: {}", payer.address, e)))?
                .require_network(self.network)
                .map_err(|e| EscrowError::Validation(format!("payer {}: {}", payer.address, e)))?;
            if payer.amount_sats == 0 {
                return Err(EscrowError::Validation(format!("payer {} contributes nothing", payer.address)));
            }
        }
        if escrow.payers == payers {
            return Ok(escrow);
        }

        escrow.payers = payers;
        escrow.updated_at = Utc::now();
        self.commit(escrow, "escrow_payers_recorded").await
    }

    /// Contract deadline passed
    pub async fn expire(&self, escrow_id: &str) -> EscrowResult<EscrowContract> {
        let mut escrow = self.get(escrow_id).await?;
        if escrow.status == EscrowStatus::Expired {
            return Ok(escrow);
        }
        transition(&mut escrow, EscrowStatus::Expired, "expire")?;
        self.commit(escrow, "escrow_expired").await
    }

    /// Validate a refund without persisting anything. The balance goes back
    /// to the recorded payers in proportion to what each paid in.
    pub fn plan_refund(&self, escrow: &EscrowContract, reason: &RefundReason) -> EscrowResult<(SpendPlan, EscrowContract)> {
        match reason {
            RefundReason::Expired { tip_height } => {
                require_status(escrow, &[EscrowStatus::Expired], "refund")?;
                if let Some(timelock) = escrow.timelock {
                    if *tip_height < timelock {
                        return Err(EscrowError::TimelockNotElapsed {
                            timelock,
                            tip: *tip_height,
                        });
                    }
                }
            }
            RefundReason::MutualRelease { approvals } => {
                require_status(escrow, &[EscrowStatus::Funded, EscrowStatus::Expired], "release")?;
                let participants: HashSet<String> =
                    escrow.participants.iter().filter_map(|k| x_only_hex(k)).collect();
                let approved: HashSet<String> = approvals
                    .iter()
                    .filter_map(|k| x_only_hex(k))
                    .filter(|k| participants.contains(k))
                    .collect();
                if approved.len() < escrow.required_signatures as usize {
                    return Err(EscrowError::InsufficientApprovals {
                        required: escrow.required_signatures,
                        provided: approved.len(),
                    });
                }
            }
        }

        // Never funded: nothing on chain to return
        if escrow.live_outpoint.is_none() {
            return Err(EscrowError::InvalidEscrowState {
                escrow_id: escrow.escrow_id.clone(),
                status: escrow.status.to_string(),
                action: "refund unfunded",
            });
        }
        let Some(first) = escrow.payers.first() else {
            return Err(EscrowError::Validation(format!(
                "escrow {} has no recorded payer to refund",
                escrow.escrow_id
            )));
        };
        let input = Self::live_input(escrow)?;
        let outputs = payer_shares(escrow.remaining_sats, &escrow.payers)
            .ok_or_else(|| EscrowError::Validation("payer amounts overflow".into()))?;

        let mut next = escrow.clone();
        transition(&mut next, EscrowStatus::Refunded, "refund")?;
        next.remaining_sats = 0;

        let plan = SpendPlan {
            escrow_id: next.escrow_id.clone(),
            contract_id: next.contract_id.clone(),
            input,
            outputs,
            remaining_sats: 0,
            change_address: first.address.clone(),
            required_signatures: next.required_signatures,
        };
        Ok((plan, next))
    }

    /// Return the remaining balance to the payers
    pub async fn refund(&self, escrow_id: &str, reason: RefundReason) -> EscrowResult<SpendPlan> {
        let escrow = self.get(escrow_id).await?;
        let (plan, escrow) = self.plan_refund(&escrow, &reason)?;
        let amount = plan.input.value;
        self.commit(escrow, "escrow_refunded").await?;
        info!(escrow_id, amount, payers = plan.outputs.len(), "Escrow refund planned");
        Ok(plan)
    }

    pub async fn record_refund(&self, escrow_id: &str, txid: &str) -> EscrowResult<EscrowContract> {
        let mut escrow = self.get(escrow_id).await?;
        require_status(&escrow, &[EscrowStatus::Refunded], "record refund for")?;
        escrow.refund_txid = Some(txid.to_string());
        escrow.live_outpoint = None;
        escrow.updated_at = Utc::now();

        let escrow = self.commit(escrow, "escrow_refund_recorded").await?;
        self.monitor
            .track(TrackedTx::new(txid, self.min_confirmations, TxRole::Refund, &escrow.contract_id))
            .await;
        Ok(escrow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{random_txid, MemoryChain};
    use crate::lifecycle::events::event_channel;
    use crate::storage::MemoryContractStore;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use bitcoin::PublicKey;

    /// BIP-173 testnet vectors
    const PAYER_A: &str = "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx";
    const PAYER_B: &str = "tb1qrp33g0q5c5txsp9arysrx4k6zdkfs4nce4xj0gdcccefvpysxf3q0sl5k7";

    fn payer(address: &str, amount_sats: u64) -> Payer {
        Payer {
            address: address.to_string(),
            amount_sats,
        }
    }

    fn key(seed: u8) -> String {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
        PublicKey::new(bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &sk)).to_string()
    }

    fn manager() -> (EscrowManager, Arc<TransactionMonitor>) {
        let (tx, _rx) = event_channel();
        let monitor = Arc::new(TransactionMonitor::new(Arc::new(MemoryChain::new()), tx, 0));
        let store: Arc<dyn ContractStore> = Arc::new(MemoryContractStore::new());
        (
            EscrowManager::new(store, monitor.clone(), Network::Testnet, 1),
            monitor,
        )
    }

    async fn funded(manager: &EscrowManager) -> EscrowContract {
        let escrow = manager
            .create("contract_1", EscrowType::Multisig2of3, &[key(1), key(2), key(3)], 100_000, None)
            .await
            .unwrap();
        manager.fund(&escrow.escrow_id, &random_txid(), 0).await.unwrap();
        manager.mark_funded(&escrow.escrow_id).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_derives_address() {
        let (manager, _) = manager();
        let escrow = manager
            .create("contract_1", EscrowType::Multisig2of3, &[key(1), key(2), key(3)], 50_000, None)
            .await
            .unwrap();
        assert_eq!(escrow.status, EscrowStatus::Created);
        assert_eq!(escrow.required_signatures, 2);
        assert!(escrow.funding_address.starts_with("tb1q"));
        assert_eq!(manager.get(&escrow.escrow_id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_bad_participants_rejected() {
        let (manager, _) = manager();
        let err = manager
            .create("contract_1", EscrowType::Multisig2of3, &[key(1), key(2)], 50_000, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidScript);
    }

    #[tokio::test]
    async fn test_fund_tracks_and_activates() {
        let (manager, monitor) = manager();
        let escrow = manager
            .create("contract_1", EscrowType::Taproot, &[key(1)], 10_000, None)
            .await
            .unwrap();
        let txid = random_txid();

        let active = manager.fund(&escrow.escrow_id, &txid, 1).await.unwrap();
        assert_eq!(active.status, EscrowStatus::Active);
        assert!(monitor.is_tracked(&txid).await);

        // same tx again is a no-op
        manager.fund(&escrow.escrow_id, &txid, 1).await.unwrap();
        let err = manager.fund(&escrow.escrow_id, &random_txid(), 0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidEscrowState);
    }

    #[tokio::test]
    async fn test_payout_requires_funding() {
        let (manager, _) = manager();
        let escrow = manager
            .create("contract_1", EscrowType::Multisig2of3, &[key(1), key(2), key(3)], 10_000, None)
            .await
            .unwrap();
        let err = manager.claim(&escrow.escrow_id, "tb1qdest", 5_000).await.unwrap_err();
        assert!(matches!(err, EscrowError::InvalidEscrowState { ref status, .. } if status == "created"));
    }

    #[tokio::test]
    async fn test_planning_moves_nothing_until_confirmed() {
        let (manager, _) = manager();
        let escrow = funded(&manager).await;

        let first = manager.claim(&escrow.escrow_id, "tb1qdest", 40_000).await.unwrap();
        let second = manager.claim(&escrow.escrow_id, "tb1qdest", 40_000).await.unwrap();
        assert_eq!(first.remaining_sats, 60_000);
        assert_eq!(second.input, first.input);

        let stored = manager.get(&escrow.escrow_id).await.unwrap();
        assert_eq!(stored.remaining_sats, 100_000);
        assert_eq!(stored.live_outpoint, escrow.live_outpoint);
        assert!(stored.payout_txids.is_empty());
    }

    #[tokio::test]
    async fn test_partial_claims_then_paid_out() {
        let (manager, _) = manager();
        let escrow = funded(&manager).await;

        let plan = manager.claim(&escrow.escrow_id, "tb1qdest", 40_000).await.unwrap();
        assert_eq!(plan.input.value, 100_000);
        assert!(plan.input.witness_script.is_some());

        let payout_txid = random_txid();
        manager
            .record_payout(&escrow.escrow_id, &payout_txid, Some((1, 59_800)))
            .await
            .unwrap();
        // a repeated confirmation is ignored
        let again = manager
            .record_payout(&escrow.escrow_id, &payout_txid, Some((1, 59_800)))
            .await
            .unwrap();
        assert_eq!(again.remaining_sats, 59_800);
        assert_eq!(again.payout_txids.len(), 1);

        let err = manager.claim(&escrow.escrow_id, "tb1qdest", 70_000).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);

        let plan = manager.claim(&escrow.escrow_id, "tb1qdest", 59_000).await.unwrap();
        assert_eq!(plan.input.txid, payout_txid);
        assert_eq!(plan.input.vout, 1);

        let spent = manager.record_payout(&escrow.escrow_id, &random_txid(), None).await.unwrap();
        assert_eq!(spent.status, EscrowStatus::PaidOut);
        assert!(spent.live_outpoint.is_none());
    }

    #[tokio::test]
    async fn test_refund_after_expiry_respects_timelock() {
        let (manager, _) = manager();
        let escrow = manager
            .create("contract_1", EscrowType::Timelock, &[key(1), key(2)], 20_000, Some(500))
            .await
            .unwrap();
        manager.record_payers(&escrow.escrow_id, vec![payer(PAYER_A, 20_000)]).await.unwrap();
        manager.fund(&escrow.escrow_id, &random_txid(), 0).await.unwrap();
        manager.mark_funded(&escrow.escrow_id).await.unwrap();

        // not expired yet
        let err = manager
            .refund(&escrow.escrow_id, RefundReason::Expired { tip_height: 600 })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidEscrowState);

        manager.expire(&escrow.escrow_id).await.unwrap();
        let err = manager
            .refund(&escrow.escrow_id, RefundReason::Expired { tip_height: 499 })
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::TimelockNotElapsed { timelock: 500, tip: 499 }));

        let plan = manager
            .refund(&escrow.escrow_id, RefundReason::Expired { tip_height: 500 })
            .await
            .unwrap();
        assert_eq!(plan.outputs.len(), 1);
        assert_eq!(plan.outputs[0].address, PAYER_A);
        assert_eq!(plan.outputs[0].amount_sats, 20_000);
        assert_eq!(manager.get(&escrow.escrow_id).await.unwrap().status, EscrowStatus::Refunded);
    }

    #[tokio::test]
    async fn test_refund_needs_recorded_payer() {
        let (manager, _) = manager();
        let escrow = funded(&manager).await;
        let err = manager
            .refund(
                &escrow.escrow_id,
                RefundReason::MutualRelease {
                    approvals: vec![key(1), key(2)],
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(manager.get(&escrow.escrow_id).await.unwrap().status, EscrowStatus::Funded);

        // payers are fixed once funded
        let err = manager
            .record_payers(&escrow.escrow_id, vec![payer(PAYER_A, 100_000)])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidEscrowState);
    }

    #[tokio::test]
    async fn test_record_payers_checks_network() {
        let (manager, _) = manager();
        let escrow = manager
            .create("contract_1", EscrowType::Taproot, &[key(1)], 10_000, None)
            .await
            .unwrap();
        let err = manager
            .record_payers(
                &escrow.escrow_id,
                vec![payer("bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq", 10_000)],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_mutual_release_needs_threshold() {
        let (manager, _) = manager();
        let escrow = manager
            .create("contract_1", EscrowType::Multisig2of3, &[key(1), key(2), key(3)], 100_000, None)
            .await
            .unwrap();
        manager
            .record_payers(&escrow.escrow_id, vec![payer(PAYER_A, 70_000), payer(PAYER_B, 30_000)])
            .await
            .unwrap();
        manager.fund(&escrow.escrow_id, &random_txid(), 0).await.unwrap();
        manager.mark_funded(&escrow.escrow_id).await.unwrap();

        let err = manager
            .refund(
                &escrow.escrow_id,
                RefundReason::MutualRelease {
                    approvals: vec![key(1), "outsider".into()],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::InsufficientApprovals { required: 2, provided: 1 }));

        let plan = manager
            .refund(
                &escrow.escrow_id,
                RefundReason::MutualRelease {
                    approvals: vec![key(1), key(3)],
                },
            )
            .await
            .unwrap();
        assert_eq!(plan.outputs[0].address, PAYER_A);
        assert_eq!(plan.outputs[0].amount_sats, 70_000);
        assert_eq!(plan.outputs[1].amount_sats, 30_000);
    }

    #[tokio::test]
    async fn test_taproot_release_accepts_compressed_keys() {
        let (manager, _) = manager();
        let escrow = manager
            .create("contract_1", EscrowType::Taproot, &[key(1)], 10_000, None)
            .await
            .unwrap();
        assert_ne!(escrow.participants[0], key(1));
        manager.record_payers(&escrow.escrow_id, vec![payer(PAYER_A, 10_000)]).await.unwrap();
        manager.fund(&escrow.escrow_id, &random_txid(), 0).await.unwrap();
        manager.mark_funded(&escrow.escrow_id).await.unwrap();

        let plan = manager
            .refund(
                &escrow.escrow_id,
                RefundReason::MutualRelease {
                    approvals: vec![key(1)],
                },
            )
            .await
            .unwrap();
        assert_eq!(plan.outputs[0].amount_sats, 10_000);
    }

    #[tokio::test]
    async fn test_reorg_reverts_only_before_release() {
        let (manager, _) = manager();
        let escrow = funded(&manager).await;

        let reverted = manager.revert_funding(&escrow.escrow_id).await.unwrap();
        assert_eq!(reverted.status, EscrowStatus::Active);

        manager.mark_funded(&escrow.escrow_id).await.unwrap();
        manager
            .record_payout(&escrow.escrow_id, &random_txid(), Some((1, 98_000)))
            .await
            .unwrap();
        let kept = manager.revert_funding(&escrow.escrow_id).await.unwrap();
        assert_eq!(kept.status, EscrowStatus::Funded);
    }
}
