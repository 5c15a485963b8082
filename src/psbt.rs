//! PSBT Builder
//!
//! Unsigned payout and fund-raising transactions, wrapped as PSBTs for an
//! external signer. Every build satisfies
//! `selected = payouts + fee + commitment + change`.
//!
//! Size estimation (vbytes):
//! - fixed overhead: 11
//! - output: 9 + scriptPubKey length
//! - input: by the spent output type, P2WSH inputs sized from their witness script

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bitcoin::{
    absolute::LockTime, psbt::Psbt, transaction::Version, Address, Amount, Network, OutPoint,
    ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::chain::{ChainError, EsploraClient};
use crate::script::{hash_lock_script, parse_script, ScriptError};

const TX_OVERHEAD_VBYTES: u64 = 11;

/// Builder errors
#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid txid: {0}")]
    InvalidTxid(String),

    #[error("invalid script: {0}")]
    Script(#[from] ScriptError),

    #[error("insufficient funds: need {required} sats, have {available} sats")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("payouts total {total} sats exceeds budget {budget} sats")]
    BudgetExceeded { total: u64, budget: u64 },

    #[error("no UTXOs provided")]
    NoUtxos,

    #[error("no payouts requested")]
    NoPayouts,

    #[error("amount {0} sats is below the dust limit")]
    AmountTooSmall(u64),

    #[error("fee rate must be at least 1 sat/vB")]
    InvalidFeeRate,

    #[error("amount overflow")]
    Overflow,

    #[error("invalid PSBT: {0}")]
    InvalidPsbt(String),

    #[error("funding provider: {0}")]
    Upstream(#[from] ChainError),
}

/// A spendable output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    /// Output script being spent, hex
    pub script_pubkey: String,
    /// Witness script for P2WSH outputs (escrow spends), hex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness_script: Option<String>,
}

impl Utxo {
    fn script_pubkey(&self) -> Result<ScriptBuf, BuilderError> {
        ScriptBuf::from_hex(&self.script_pubkey)
            .map_err(|e| BuilderError::InvalidAddress(format!("script_pubkey {}: {}", self.script_pubkey, e)))
    }

    fn witness_script(&self) -> Result<Option<ScriptBuf>, BuilderError> {
        self.witness_script
            .as_deref()
            .map(|hex| {
                ScriptBuf::from_hex(hex).map_err(|e| BuilderError::InvalidPsbt(format!("witness script: {}", e)))
            })
            .transpose()
    }

    /// Estimated vbytes to spend this output
    fn input_vbytes(&self) -> u64 {
        if let Ok(Some(ws)) = self.witness_script() {
            let sigs = parse_script(&ws)
                .ok()
                .and_then(|(_, p)| p.threshold)
                .unwrap_or(1) as u64;
            // count + multisig dummy + sigs + script push
            let witness = 1 + 1 + sigs * 73 + 3 + ws.len() as u64;
            return 41 + witness.div_ceil(4);
        }

        match self.script_pubkey() {
            Ok(spk) if spk.is_p2tr() => 58,
            Ok(spk) if spk.is_p2wpkh() => 68,
            Ok(spk) if spk.is_p2pkh() => 148,
            Ok(spk) if spk.is_p2sh() => 91,
            _ => 68,
        }
    }
}

/// One payout output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payout {
    pub address: String,
    pub amount_sats: u64,
}

/// Hash-lock output binding the spend to the agreement
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Commitment {
    pub amount_sats: u64,
    /// Without a hash the commitment amount is returned as change
    #[serde(default)]
    pub visible_pixel_hash: Option<String>,
}

/// Input selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoinSelection {
    #[default]
    LargestFirst,
    /// Spend exactly the UTXOs supplied
    Provided,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutRequest {
    pub contract_id: String,
    pub payouts: Vec<Payout>,
    pub budget_sats: u64,
    pub fee_rate: u64,
    #[serde(default)]
    pub commitment: Option<Commitment>,
    pub change_address: String,
    #[serde(default)]
    pub selection: CoinSelection,
}

/// A built, unsigned PSBT and its accounting
#[derive(Debug, Clone, Serialize)]
pub struct BuiltPsbt {
    pub contract_id: String,
    /// Contributor this PSBT belongs to in split fund-raising
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contributor: Option<String>,
    pub psbt_base64: String,
    pub txid: String,
    pub inputs: Vec<Utxo>,
    pub selected_sats: u64,
    pub payouts_total: u64,
    pub fee_sats: u64,
    pub commitment_sats: u64,
    pub change_sats: u64,
    pub vbytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commitment_vout: Option<u32>,
    /// Single change output; shared fund-raises report theirs in `contributor_change`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_vout: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub contributor_change: Vec<ContributorChange>,
}

/// A contributor's change output in a shared fund-raise
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContributorChange {
    pub contributor: String,
    pub vout: u32,
    pub amount_sats: u64,
}

impl BuiltPsbt {
    /// `selected == payouts + fee + commitment + change`
    pub fn balances(&self) -> bool {
        self.payouts_total
            .checked_add(self.fee_sats)
            .and_then(|s| s.checked_add(self.commitment_sats))
            .and_then(|s| s.checked_add(self.change_sats))
            == Some(self.selected_sats)
    }
}

/// One wallet contributing to a fund-raise
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contribution {
    pub contributor: String,
    pub amount_sats: u64,
    pub utxos: Vec<Utxo>,
    pub change_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundraiseRequest {
    pub contract_id: String,
    /// Escrow funding address
    pub target_address: String,
    pub contributions: Vec<Contribution>,
    pub fee_rate: u64,
    /// One PSBT per contributor instead of one shared transaction
    #[serde(default)]
    pub split: bool,
}

#[derive(Debug)]
struct Selection {
    inputs: Vec<Utxo>,
    selected: u64,
    fee: u64,
    change: u64,
}

/// Pick inputs covering `target` plus the fee of `fixed_vbytes` and the
/// inputs themselves. Change below `dust` is folded into the fee.
fn select(
    utxos: &[Utxo],
    strategy: CoinSelection,
    target: u64,
    fixed_vbytes: u64,
    change_vbytes: u64,
    fee_rate: u64,
    dust: u64,
) -> Result<Selection, BuilderError> {
    if utxos.is_empty() {
        return Err(BuilderError::NoUtxos);
    }

    let mut candidates = utxos.to_vec();
    if strategy == CoinSelection::LargestFirst {
        candidates.sort_by(|a, b| b.value.cmp(&a.value));
    }
    let available = candidates.iter().map(|u| u.value).sum::<u64>();

    let mut inputs = Vec::new();
    let mut selected = 0u64;
    let mut vbytes = fixed_vbytes;
    let mut required = target;

    for utxo in candidates {
        selected = selected.checked_add(utxo.value).ok_or(BuilderError::Overflow)?;
        vbytes += utxo.input_vbytes();
        inputs.push(utxo);
        required = vbytes
            .checked_mul(fee_rate)
            .and_then(|fee| fee.checked_add(target))
            .ok_or(BuilderError::Overflow)?;

        if strategy == CoinSelection::LargestFirst && selected >= required {
            break;
        }
    }

    if selected < required {
        return Err(BuilderError::InsufficientFunds {
            required,
            available,
        });
    }

    let spare = selected - target;
    let fee_with_change = (vbytes + change_vbytes)
        .checked_mul(fee_rate)
        .ok_or(BuilderError::Overflow)?;
    Ok(match spare.checked_sub(fee_with_change) {
        Some(change) if change >= dust => Selection {
            inputs,
            selected,
            fee: fee_with_change,
            change,
        },
        _ => Selection {
            inputs,
            selected,
            fee: spare,
            change: 0,
        },
    })
}

fn output_vbytes(script_pubkey: &ScriptBuf) -> u64 {
    9 + script_pubkey.len() as u64
}

fn to_txin(utxo: &Utxo) -> Result<TxIn, BuilderError> {
    let txid = Txid::from_str(&utxo.txid).map_err(|e| BuilderError::InvalidTxid(e.to_string()))?;
    Ok(TxIn {
        previous_output: OutPoint { txid, vout: utxo.vout },
        script_sig: ScriptBuf::new(),
        sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
        witness: Witness::new(),
    })
}

/// Builds unsigned payout and fund-raising PSBTs
#[derive(Debug, Clone)]
pub struct PsbtBuilder {
    network: Network,
    dust_limit: u64,
}

impl PsbtBuilder {
    pub fn new(network: Network, dust_limit: u64) -> Self {
        Self { network, dust_limit }
    }

    pub fn dust_limit(&self) -> u64 {
        self.dust_limit
    }

    /// Validate a Bitcoin address for this network
    pub fn validate_address(&self, address: &str) -> Result<Address, BuilderError> {
        Address::from_str(address)
            .map_err(|e| BuilderError::InvalidAddress(format!("{}: {}", address, e)))?
            .require_network(self.network)
            .map_err(|e| BuilderError::InvalidAddress(format!("{}: {}", address, e)))
    }

    /// Output script of the commitment for `visible_pixel_hash`
    pub fn commitment_script(visible_pixel_hash: &str) -> Result<(ScriptBuf, ScriptBuf), BuilderError> {
        let bytes = hex::decode(visible_pixel_hash)
            .ok()
            .and_then(|b| <[u8; 32]>::try_from(b).ok())
            .ok_or_else(|| ScriptError::InvalidHash(visible_pixel_hash.to_string()))?;
        let witness_script = hash_lock_script(&bytes);
        let script_pubkey = ScriptBuf::new_p2wsh(&witness_script.wscript_hash());
        Ok((witness_script, script_pubkey))
    }

    /// Build a payout PSBT
    pub fn build(&self, request: &PayoutRequest, utxos: &[Utxo]) -> Result<BuiltPsbt, BuilderError> {
        if request.fee_rate == 0 {
            return Err(BuilderError::InvalidFeeRate);
        }
        if request.payouts.is_empty() {
            return Err(BuilderError::NoPayouts);
        }

        let mut outputs = Vec::with_capacity(request.payouts.len() + 2);
        let mut payouts_total = 0u64;
        for payout in &request.payouts {
            if payout.amount_sats < self.dust_limit {
                return Err(BuilderError::AmountTooSmall(payout.amount_sats));
            }
            let address = self.validate_address(&payout.address)?;
            payouts_total = payouts_total
                .checked_add(payout.amount_sats)
                .ok_or(BuilderError::Overflow)?;
            outputs.push(TxOut {
                value: Amount::from_sat(payout.amount_sats),
                script_pubkey: address.script_pubkey(),
            });
        }
        if payouts_total > request.budget_sats {
            return Err(BuilderError::BudgetExceeded {
                total: payouts_total,
                budget: request.budget_sats,
            });
        }

        // Commitment without a hash: amount stays with the payer as change
        let mut commitment_sats = 0;
        let mut commitment_ws = None;
        if let Some(commitment) = &request.commitment {
            if let Some(vph) = &commitment.visible_pixel_hash {
                if commitment.amount_sats < self.dust_limit {
                    return Err(BuilderError::AmountTooSmall(commitment.amount_sats));
                }
                let (ws, spk) = Self::commitment_script(vph)?;
                outputs.push(TxOut {
                    value: Amount::from_sat(commitment.amount_sats),
                    script_pubkey: spk,
                });
                commitment_sats = commitment.amount_sats;
                commitment_ws = Some(ws);
            }
        }
        let commitment_vout = commitment_ws.as_ref().map(|_| (outputs.len() - 1) as u32);

        let change_spk = self.validate_address(&request.change_address)?.script_pubkey();
        let fixed = TX_OVERHEAD_VBYTES + outputs.iter().map(|o| output_vbytes(&o.script_pubkey)).sum::<u64>();
        let target = payouts_total
            .checked_add(commitment_sats)
            .ok_or(BuilderError::Overflow)?;

        let selection = select(
            utxos,
            request.selection,
            target,
            fixed,
            output_vbytes(&change_spk),
            request.fee_rate,
            self.dust_limit,
        )?;

        let mut change_vout = None;
        if selection.change > 0 {
            change_vout = Some(outputs.len() as u32);
            outputs.push(TxOut {
                value: Amount::from_sat(selection.change),
                script_pubkey: change_spk,
            });
        }

        let vbytes = fixed
            + selection.inputs.iter().map(Utxo::input_vbytes).sum::<u64>()
            + if selection.change > 0 { output_vbytes(&outputs[outputs.len() - 1].script_pubkey) } else { 0 };

        let mut psbt = self.wrap(&selection.inputs, outputs)?;
        if let (Some(vout), Some(ws)) = (commitment_vout, commitment_ws) {
            psbt.outputs[vout as usize].witness_script = Some(ws);
        }

        let built = BuiltPsbt {
            contract_id: request.contract_id.clone(),
            contributor: None,
            txid: psbt.unsigned_tx.compute_txid().to_string(),
            psbt_base64: BASE64.encode(psbt.serialize()),
            inputs: selection.inputs,
            selected_sats: selection.selected,
            payouts_total,
            fee_sats: selection.fee,
            commitment_sats,
            change_sats: selection.change,
            vbytes,
            commitment_vout,
            change_vout,
            contributor_change: Vec::new(),
        };

        debug!(
            contract_id = %built.contract_id,
            inputs = built.inputs.len(),
            fee = built.fee_sats,
            change = built.change_sats,
            "Built payout PSBT"
        );
        Ok(built)
    }

    /// Build fund-raising PSBTs paying the escrow address.
    ///
    /// Shared mode returns one transaction: each contributor selects inputs for
    /// its own amount, its own change output, and an equal share of the
    /// overhead and target output. Split mode returns one PSBT per contributor.
    pub fn build_fundraise(&self, request: &FundraiseRequest) -> Result<Vec<BuiltPsbt>, BuilderError> {
        if request.fee_rate == 0 {
            return Err(BuilderError::InvalidFeeRate);
        }
        if request.contributions.is_empty() {
            return Err(BuilderError::NoUtxos);
        }
        let target_spk = self.validate_address(&request.target_address)?.script_pubkey();

        if request.split {
            return request
                .contributions
                .iter()
                .map(|c| {
                    let payout = PayoutRequest {
                        contract_id: request.contract_id.clone(),
                        payouts: vec![Payout {
                            address: request.target_address.clone(),
                            amount_sats: c.amount_sats,
                        }],
                        budget_sats: c.amount_sats,
                        fee_rate: request.fee_rate,
                        commitment: None,
                        change_address: c.change_address.clone(),
                        selection: CoinSelection::LargestFirst,
                    };
                    let mut built = self.build(&payout, &c.utxos)?;
                    built.contributor = Some(c.contributor.clone());
                    Ok(built)
                })
                .collect();
        }

        let n = request.contributions.len() as u64;
        let shared = TX_OVERHEAD_VBYTES + output_vbytes(&target_spk);
        let share = shared.div_ceil(n);

        let mut inputs = Vec::new();
        let mut change_outputs = Vec::new();
        let mut contributor_change = Vec::new();
        let mut total = 0u64;
        let mut fee = 0u64;
        let mut change = 0u64;
        let mut vbytes = shared;

        for c in &request.contributions {
            if c.amount_sats < self.dust_limit {
                return Err(BuilderError::AmountTooSmall(c.amount_sats));
            }
            let change_spk = self.validate_address(&c.change_address)?.script_pubkey();
            let selection = select(
                &c.utxos,
                CoinSelection::LargestFirst,
                c.amount_sats,
                share,
                output_vbytes(&change_spk),
                request.fee_rate,
                self.dust_limit,
            )?;

            vbytes += selection.inputs.iter().map(Utxo::input_vbytes).sum::<u64>();
            if selection.change > 0 {
                vbytes += output_vbytes(&change_spk);
                // target output sits at vout 0
                contributor_change.push(ContributorChange {
                    contributor: c.contributor.clone(),
                    vout: change_outputs.len() as u32 + 1,
                    amount_sats: selection.change,
                });
                change_outputs.push(TxOut {
                    value: Amount::from_sat(selection.change),
                    script_pubkey: change_spk,
                });
            }

            total = total.checked_add(c.amount_sats).ok_or(BuilderError::Overflow)?;
            fee = fee.checked_add(selection.fee).ok_or(BuilderError::Overflow)?;
            change = change.checked_add(selection.change).ok_or(BuilderError::Overflow)?;
            inputs.extend(selection.inputs);
        }

        let mut outputs = vec![TxOut {
            value: Amount::from_sat(total),
            script_pubkey: target_spk,
        }];
        outputs.extend(change_outputs);

        let psbt = self.wrap(&inputs, outputs)?;
        Ok(vec![BuiltPsbt {
            contract_id: request.contract_id.clone(),
            contributor: None,
            txid: psbt.unsigned_tx.compute_txid().to_string(),
            psbt_base64: BASE64.encode(psbt.serialize()),
            selected_sats: inputs
                .iter()
                .try_fold(0u64, |acc, u| acc.checked_add(u.value))
                .ok_or(BuilderError::Overflow)?,
            inputs,
            payouts_total: total,
            fee_sats: fee,
            commitment_sats: 0,
            change_sats: change,
            vbytes,
            commitment_vout: None,
            change_vout: None,
            contributor_change,
        }])
    }

    /// Spend every input, less the fee, across `destinations` in proportion
    /// to their amounts (refunds)
    pub fn build_sweep(
        &self,
        contract_id: &str,
        inputs: &[Utxo],
        destinations: &[Payout],
        fee_rate: u64,
    ) -> Result<BuiltPsbt, BuilderError> {
        if fee_rate == 0 {
            return Err(BuilderError::InvalidFeeRate);
        }
        if inputs.is_empty() {
            return Err(BuilderError::NoUtxos);
        }
        if destinations.is_empty() {
            return Err(BuilderError::NoPayouts);
        }
        let spks = destinations
            .iter()
            .map(|d| self.validate_address(&d.address).map(|a| a.script_pubkey()))
            .collect::<Result<Vec<_>, _>>()?;

        let selected = inputs
            .iter()
            .try_fold(0u64, |acc, u| acc.checked_add(u.value))
            .ok_or(BuilderError::Overflow)?;
        let vbytes = TX_OVERHEAD_VBYTES
            + spks.iter().map(output_vbytes).sum::<u64>()
            + inputs.iter().map(Utxo::input_vbytes).sum::<u64>();
        let fee = vbytes.checked_mul(fee_rate).ok_or(BuilderError::Overflow)?;

        let value = selected.saturating_sub(fee);
        let shares = pro_rata(value, destinations).ok_or(BuilderError::Overflow)?;
        if shares.iter().any(|s| s.amount_sats < self.dust_limit) {
            return Err(BuilderError::InsufficientFunds {
                required: fee.saturating_add(self.dust_limit.saturating_mul(destinations.len() as u64)),
                available: selected,
            });
        }

        let outputs = shares
            .iter()
            .zip(spks)
            .map(|(share, script_pubkey)| TxOut {
                value: Amount::from_sat(share.amount_sats),
                script_pubkey,
            })
            .collect();
        let psbt = self.wrap(inputs, outputs)?;
        Ok(BuiltPsbt {
            contract_id: contract_id.to_string(),
            contributor: None,
            txid: psbt.unsigned_tx.compute_txid().to_string(),
            psbt_base64: BASE64.encode(psbt.serialize()),
            inputs: inputs.to_vec(),
            selected_sats: selected,
            payouts_total: value,
            fee_sats: fee,
            commitment_sats: 0,
            change_sats: 0,
            vbytes,
            commitment_vout: None,
            change_vout: None,
            contributor_change: Vec::new(),
        })
    }

    fn wrap(&self, inputs: &[Utxo], outputs: Vec<TxOut>) -> Result<Psbt, BuilderError> {
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs.iter().map(to_txin).collect::<Result<_, _>>()?,
            output: outputs,
        };

        let mut psbt = Psbt::from_unsigned_tx(tx).map_err(|e| BuilderError::InvalidPsbt(e.to_string()))?;
        for (slot, utxo) in psbt.inputs.iter_mut().zip(inputs) {
            slot.witness_utxo = Some(TxOut {
                value: Amount::from_sat(utxo.value),
                script_pubkey: utxo.script_pubkey()?,
            });
            slot.witness_script = utxo.witness_script()?;
        }
        Ok(psbt)
    }

    /// Whether the PSBT carries a commitment output for `visible_pixel_hash`
    pub fn commitment_matches(psbt_base64: &str, visible_pixel_hash: &str) -> Result<bool, BuilderError> {
        let psbt = decode_psbt(psbt_base64)?;
        let (_, expected) = Self::commitment_script(visible_pixel_hash)?;
        Ok(psbt.unsigned_tx.output.iter().any(|o| o.script_pubkey == expected))
    }
}

/// Split `total` across `weights` in proportion to their amounts; the last
/// output takes the rounding. `None` when the weights sum to zero or overflow.
pub fn pro_rata(total: u64, weights: &[Payout]) -> Option<Vec<Payout>> {
    let sum = weights
        .iter()
        .try_fold(0u64, |acc, w| acc.checked_add(w.amount_sats))?;
    if sum == 0 {
        return None;
    }

    let mut left = total;
    let mut shares = Vec::with_capacity(weights.len());
    for (i, weight) in weights.iter().enumerate() {
        let share = if i + 1 == weights.len() {
            left
        } else {
            (total as u128 * weight.amount_sats as u128 / sum as u128) as u64
        };
        left -= share;
        shares.push(Payout {
            address: weight.address.clone(),
            amount_sats: share,
        });
    }
    Some(shares)
}

pub fn decode_psbt(psbt_base64: &str) -> Result<Psbt, BuilderError> {
    let bytes = BASE64
        .decode(psbt_base64)
        .map_err(|e| BuilderError::InvalidPsbt(e.to_string()))?;
    Psbt::deserialize(&bytes).map_err(|e| BuilderError::InvalidPsbt(e.to_string()))
}

/// Source of spendable outputs for an owner (address or wallet id)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FundingProvider: Send + Sync {
    async fn utxos_for(&self, owner: &str) -> Result<Vec<Utxo>, BuilderError>;
}

/// Fixed UTXO sets, registered up front
#[derive(Default)]
pub struct StaticFundingProvider {
    utxos: RwLock<HashMap<String, Vec<Utxo>>>,
}

impl StaticFundingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, owner: &str, utxo: Utxo) {
        self.utxos.write().await.entry(owner.to_string()).or_default().push(utxo);
    }
}

#[async_trait]
impl FundingProvider for StaticFundingProvider {
    async fn utxos_for(&self, owner: &str) -> Result<Vec<Utxo>, BuilderError> {
        Ok(self.utxos.read().await.get(owner).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl FundingProvider for EsploraClient {
    /// Confirmed outputs paying `owner`, which must be an address
    async fn utxos_for(&self, owner: &str) -> Result<Vec<Utxo>, BuilderError> {
        let script_pubkey = Address::from_str(owner)
            .map_err(|e| BuilderError::InvalidAddress(format!("{}: {}", owner, e)))?
            .assume_checked()
            .script_pubkey()
            .to_hex_string();

        Ok(self
            .get_address_utxos(owner)
            .await?
            .into_iter()
            .filter(|u| u.status.confirmed)
            .map(|u| Utxo {
                txid: u.txid,
                vout: u.vout,
                value: u.value,
                script_pubkey: script_pubkey.clone(),
                witness_script: None,
            })
            .collect())
    }
}
