//! Claim Expiry Sweeper
//!
//! Periodically finds active claims past their TTL and live contracts past
//! their deadline, and reports them as events. The lifecycle service applies
//! the transitions; the sweeper only reads.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::common::Result;
use crate::storage::{ContractStore, EntityStoreExt};
use crate::types::{Claim, ClaimStatus, Contract, ContractStatus};

use super::clock::Clock;
use super::events::{EventSender, LifecycleEvent};

/// What one sweep found
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_claims: Vec<String>,
    pub expired_contracts: Vec<String>,
}

pub struct ClaimSweeper {
    store: Arc<dyn ContractStore>,
    clock: Arc<dyn Clock>,
    events: EventSender,
}

impl ClaimSweeper {
    pub fn new(store: Arc<dyn ContractStore>, clock: Arc<dyn Clock>, events: EventSender) -> Self {
        Self { store, clock, events }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport::default();
        let mut events = Vec::new();

        for claim in self
            .store
            .with_status::<Claim>(ClaimStatus::Active.as_str())
            .await?
        {
            if claim.is_expired_at(now) {
                report.expired_claims.push(claim.claim_id.clone());
                events.push(LifecycleEvent::ClaimExpired {
                    claim_id: claim.claim_id,
                    task_id: claim.task_id,
                });
            }
        }

        for status in [ContractStatus::Created, ContractStatus::Active, ContractStatus::Funded] {
            for contract in self.store.with_status::<Contract>(status.as_str()).await? {
                if contract.deadline.is_some_and(|d| d <= now) {
                    report.expired_contracts.push(contract.contract_id.clone());
                    events.push(LifecycleEvent::ContractExpired {
                        contract_id: contract.contract_id,
                    });
                }
            }
        }

        for event in events {
            if self.events.send(event).await.is_err() {
                warn!("Event receiver dropped, sweep results lost");
                break;
            }
        }

        debug!(
            claims = report.expired_claims.len(),
            contracts = report.expired_contracts.len(),
            "Sweep complete"
        );
        Ok(report)
    }

    /// Sweep every `period` until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(period_secs = period.as_secs(), "Claim sweeper started");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(report) if !report.expired_claims.is_empty() || !report.expired_contracts.is_empty() => {
                            info!(
                                claims = report.expired_claims.len(),
                                contracts = report.expired_contracts.len(),
                                "Sweep found expirations"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Claim sweeper stopped");
    }
}
