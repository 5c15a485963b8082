//! Transaction Monitor
//!
//! Polls the chain for the depth of every tracked transaction. A tx that
//! reaches its threshold leaves active tracking, emits `TxConfirmed`, and
//! sits in a short reorg watch list. A watched tx the chain forgets emits
//! `TxReorged` and goes back to active tracking.
//!
//! The tracked set is owned here. Each cycle snapshots it, queries the chain
//! with no lock held, then applies the results under a brief write lock.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::chain::{ChainClient, ChainError};
use crate::common::log_chain_event;
use crate::lifecycle::events::{EventSender, LifecycleEvent};
use crate::types::TxRole;

/// A transaction under observation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedTx {
    pub tx_id: String,
    pub required_confirmations: u32,
    pub role: TxRole,
    /// Contract the tx settles
    pub owner_id: String,
    /// Last depth seen, 0 before first sighting
    pub confirmations: u32,
}

impl TrackedTx {
    pub fn new(tx_id: &str, required_confirmations: u32, role: TxRole, owner_id: &str) -> Self {
        Self {
            tx_id: tx_id.to_string(),
            required_confirmations,
            role,
            owner_id: owner_id.to_string(),
            confirmations: 0,
        }
    }
}

/// Outcome of one poll cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub checked: usize,
    pub confirmed: Vec<String>,
    pub reorged: Vec<String>,
    pub released: Vec<String>,
    pub errors: usize,
}

#[derive(Debug, Default)]
struct MonitorState {
    active: HashMap<String, TrackedTx>,
    /// Confirmed txs still inside the reorg window
    watching: HashMap<String, TrackedTx>,
}

pub struct TransactionMonitor {
    chain: Arc<dyn ChainClient>,
    state: RwLock<MonitorState>,
    events: EventSender,
    reorg_watch_blocks: u32,
}

impl TransactionMonitor {
    pub fn new(chain: Arc<dyn ChainClient>, events: EventSender, reorg_watch_blocks: u32) -> Self {
        Self {
            chain,
            state: RwLock::new(MonitorState::default()),
            events,
            reorg_watch_blocks,
        }
    }

    /// Start tracking `tx`; re-tracking an id replaces the entry
    pub async fn track(&self, tx: TrackedTx) {
        debug!(tx_id = %tx.tx_id, role = %tx.role, owner = %tx.owner_id, "Tracking transaction");
        let mut state = self.state.write().await;
        state.watching.remove(&tx.tx_id);
        state.active.insert(tx.tx_id.clone(), tx);
    }

    pub async fn untrack(&self, tx_id: &str) -> bool {
        let mut state = self.state.write().await;
        let active = state.active.remove(tx_id).is_some();
        let watching = state.watching.remove(tx_id).is_some();
        active || watching
    }

    pub async fn is_tracked(&self, tx_id: &str) -> bool {
        self.state.read().await.active.contains_key(tx_id)
    }

    pub async fn is_watching(&self, tx_id: &str) -> bool {
        self.state.read().await.watching.contains_key(tx_id)
    }

    /// Actively tracked transactions
    pub async fn tracked(&self) -> Vec<TrackedTx> {
        self.state.read().await.active.values().cloned().collect()
    }

    /// Run one poll cycle
    pub async fn poll_once(&self) -> PollReport {
        let (active, watching): (Vec<TrackedTx>, Vec<TrackedTx>) = {
            let state = self.state.read().await;
            (
                state.active.values().cloned().collect(),
                state.watching.values().cloned().collect(),
            )
        };

        let mut results: Vec<(TrackedTx, bool, Result<Option<u32>, ChainError>)> =
            Vec::with_capacity(active.len() + watching.len());
        for tx in active {
            let depth = self.chain.get_tx_confirmations(&tx.tx_id).await;
            results.push((tx, false, depth));
        }
        for tx in watching {
            let depth = self.chain.get_tx_confirmations(&tx.tx_id).await;
            results.push((tx, true, depth));
        }

        let mut report = PollReport {
            checked: results.len(),
            ..Default::default()
        };
        let mut events = Vec::new();

        {
            let mut state = self.state.write().await;
            for (tx, was_watching, depth) in results {
                let depth = match depth {
                    Ok(depth) => depth,
                    Err(e) => {
                        warn!(tx_id = %tx.tx_id, error = %e, "Confirmation query failed, keeping last known state");
                        report.errors += 1;
                        continue;
                    }
                };

                if was_watching {
                    // Untracked or re-tracked while we were querying
                    if !state.watching.contains_key(&tx.tx_id) {
                        continue;
                    }
                    match depth {
                        None => {
                            state.watching.remove(&tx.tx_id);
                            let mut retracked = tx.clone();
                            retracked.confirmations = 0;
                            state.active.insert(tx.tx_id.clone(), retracked);
                            report.reorged.push(tx.tx_id.clone());
                            events.push(LifecycleEvent::TxReorged {
                                tx_id: tx.tx_id,
                                role: tx.role,
                                owner_id: tx.owner_id,
                            });
                        }
                        Some(d) if d >= tx.required_confirmations.saturating_add(self.reorg_watch_blocks) => {
                            state.watching.remove(&tx.tx_id);
                            report.released.push(tx.tx_id);
                        }
                        Some(d) => {
                            if let Some(entry) = state.watching.get_mut(&tx.tx_id) {
                                entry.confirmations = d;
                            }
                        }
                    }
                    continue;
                }

                let Some(entry) = state.active.get_mut(&tx.tx_id) else {
                    continue;
                };
                let depth = depth.unwrap_or(0);
                entry.confirmations = depth;

                if depth >= entry.required_confirmations {
                    if let Some(done) = state.active.remove(&tx.tx_id) {
                        report.confirmed.push(done.tx_id.clone());
                        events.push(LifecycleEvent::TxConfirmed {
                            tx_id: done.tx_id.clone(),
                            role: done.role,
                            owner_id: done.owner_id.clone(),
                            confirmations: depth,
                        });
                        if self.reorg_watch_blocks > 0 {
                            state.watching.insert(done.tx_id.clone(), done);
                        }
                    }
                }
            }
        }

        for event in events {
            match &event {
                LifecycleEvent::TxConfirmed { tx_id, confirmations, .. } => {
                    log_chain_event("tx_confirmed", tx_id, Some(*confirmations), true, None);
                }
                LifecycleEvent::TxReorged { tx_id, .. } => {
                    log_chain_event("tx_reorged", tx_id, None, false, Some("transaction left the chain"));
                }
                _ => {}
            }
            if self.events.send(event).await.is_err() {
                warn!("Event receiver dropped, monitor events lost");
                break;
            }
        }

        report
    }

    /// Poll every `period` until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(period_secs = period.as_secs(), "Transaction monitor started");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.poll_once().await;
                    if !report.confirmed.is_empty() || !report.reorged.is_empty() {
                        info!(
                            checked = report.checked,
                            confirmed = report.confirmed.len(),
                            reorged = report.reorged.len(),
                            "Monitor cycle"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Transaction monitor stopped");
    }
}
