//! Script Templates
//!
//! Turns a template name plus parameters into a validated spending script,
//! its output script and address. Pure: no I/O, no keys held.
//!
//! | Template | Script | Output |
//! |---|---|---|
//! | `p2pkh` | `DUP HASH160 <h> EQUALVERIFY CHECKSIG` | P2PKH |
//! | `multisig`, `multisig_2of3` | `<m> <pk>... <n> CHECKMULTISIG` | P2WSH |
//! | `timelock` | `<lock> CLTV DROP <pk> CHECKSIG`, or `IF <claim> CHECKSIG ELSE <lock> CLTV DROP <refund> CHECKSIG ENDIF` | P2WSH |
//! | `taproot` | key path on the first key, optional CLTV refund leaf | P2TR |
//! | `hashlock` | `SHA256 <hash> EQUAL` | P2WSH |

use bitcoin::opcodes::all::*;
use bitcoin::opcodes::Opcode;
use bitcoin::script::{Builder, Instruction};
use bitcoin::secp256k1::SECP256K1;
use bitcoin::taproot::TaprootBuilder;
use bitcoin::{Address, Network, PublicKey, Script, ScriptBuf, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use thiserror::Error;

/// Standard P2WSH multisig limit
pub const MAX_MULTISIG_KEYS: usize = 15;

/// CLTV values at or above this are timestamps; escrows use heights
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Script errors
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("unsupported template: {0}")]
    UnsupportedTemplate(String),

    #[error("missing parameter: {0}")]
    MissingParam(&'static str),

    #[error("invalid public key {0}")]
    InvalidPubkey(String),

    #[error("uncompressed public key not allowed: {0}")]
    UncompressedPubkey(String),

    #[error("duplicate public key {0}")]
    DuplicatePubkey(String),

    #[error("invalid threshold {threshold} for {participants} participants")]
    InvalidThreshold { threshold: u8, participants: usize },

    #[error("template {template} needs {expected} keys, got {actual}")]
    WrongKeyCount {
        template: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid locktime {0}: must be a block height in 1..{LOCKTIME_THRESHOLD}")]
    InvalidLocktime(u32),

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("taproot construction failed: {0}")]
    Taproot(String),

    #[error("unrecognized script: {0}")]
    Unrecognized(String),
}

/// Template parameters as supplied by callers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptParams {
    /// Compressed pubkeys, hex
    #[serde(default)]
    pub pubkeys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locktime: Option<u32>,
    /// 32-byte hash, hex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Validated template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptTemplate {
    P2pkh {
        pubkey: PublicKey,
    },
    Multisig {
        threshold: u8,
        pubkeys: Vec<PublicKey>,
    },
    Timelock {
        /// Spends any time; absent for a pure time-locked key
        claim: Option<PublicKey>,
        refund: PublicKey,
        locktime: u32,
    },
    Taproot {
        internal_key: XOnlyPublicKey,
        refund: Option<(XOnlyPublicKey, u32)>,
    },
    HashLock {
        hash: [u8; 32],
    },
}

/// Result of interpreting a template
#[derive(Debug, Clone, Serialize)]
pub struct ScriptDescriptor {
    pub template: String,
    /// Descriptor-style summary of the spending policy
    pub descriptor: String,
    /// Witness script (P2WSH), refund leaf (P2TR) or the output script (P2PKH)
    #[serde(serialize_with = "serialize_script")]
    pub script: ScriptBuf,
    #[serde(serialize_with = "serialize_script")]
    pub script_pubkey: ScriptBuf,
    pub address: String,
    pub required_signatures: u8,
    pub participants: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locktime: Option<u32>,
}

fn serialize_script<S: serde::Serializer>(script: &ScriptBuf, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(script.as_bytes()))
}

fn parse_pubkey(hex_key: &str) -> Result<PublicKey, ScriptError> {
    let key = PublicKey::from_str(hex_key.trim())
        .map_err(|_| ScriptError::InvalidPubkey(hex_key.to_string()))?;
    if !key.compressed {
        return Err(ScriptError::UncompressedPubkey(hex_key.to_string()));
    }
    Ok(key)
}

fn parse_distinct_pubkeys(keys: &[String]) -> Result<Vec<PublicKey>, ScriptError> {
    let mut seen = HashSet::new();
    keys.iter()
        .map(|k| {
            let key = parse_pubkey(k)?;
            if !seen.insert(key.inner.serialize()) {
                return Err(ScriptError::DuplicatePubkey(k.clone()));
            }
            Ok(key)
        })
        .collect()
}

fn check_locktime(locktime: u32) -> Result<u32, ScriptError> {
    if locktime == 0 || locktime >= LOCKTIME_THRESHOLD {
        return Err(ScriptError::InvalidLocktime(locktime));
    }
    Ok(locktime)
}

fn parse_hash(hex_hash: &str) -> Result<[u8; 32], ScriptError> {
    let bytes = hex::decode(hex_hash.trim()).map_err(|e| ScriptError::InvalidHash(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| ScriptError::InvalidHash(format!("expected 32 bytes, got {}", b.len())))
}

impl ScriptTemplate {
    /// Validate `params` against template `name`
    pub fn from_params(name: &str, params: &ScriptParams) -> Result<Self, ScriptError> {
        match name {
            "p2pkh" => {
                let [key] = params.pubkeys.as_slice() else {
                    return Err(ScriptError::WrongKeyCount {
                        template: "p2pkh",
                        expected: 1,
                        actual: params.pubkeys.len(),
                    });
                };
                Ok(Self::P2pkh {
                    pubkey: parse_pubkey(key)?,
                })
            }
            "multisig" | "multisig_2of3" => {
                let pubkeys = parse_distinct_pubkeys(&params.pubkeys)?;
                let fixed = name == "multisig_2of3";

                if fixed && pubkeys.len() != 3 {
                    return Err(ScriptError::WrongKeyCount {
                        template: "multisig_2of3",
                        expected: 3,
                        actual: pubkeys.len(),
                    });
                }
                if pubkeys.is_empty() || pubkeys.len() > MAX_MULTISIG_KEYS {
                    return Err(ScriptError::WrongKeyCount {
                        template: "multisig",
                        expected: MAX_MULTISIG_KEYS,
                        actual: pubkeys.len(),
                    });
                }

                let threshold = match (fixed, params.threshold) {
                    (true, None) => 2,
                    (_, Some(t)) => t,
                    (false, None) => return Err(ScriptError::MissingParam("threshold")),
                };
                if threshold == 0 || threshold as usize > pubkeys.len() || (fixed && threshold != 2) {
                    return Err(ScriptError::InvalidThreshold {
                        threshold,
                        participants: pubkeys.len(),
                    });
                }

                Ok(Self::Multisig { threshold, pubkeys })
            }
            "timelock" => {
                let locktime = check_locktime(params.locktime.ok_or(ScriptError::MissingParam("locktime"))?)?;
                let keys = parse_distinct_pubkeys(&params.pubkeys)?;
                match keys.as_slice() {
                    [refund] => Ok(Self::Timelock {
                        claim: None,
                        refund: *refund,
                        locktime,
                    }),
                    [claim, refund] => Ok(Self::Timelock {
                        claim: Some(*claim),
                        refund: *refund,
                        locktime,
                    }),
                    _ => Err(ScriptError::WrongKeyCount {
                        template: "timelock",
                        expected: 2,
                        actual: keys.len(),
                    }),
                }
            }
            "taproot" => {
                let keys = parse_distinct_pubkeys(&params.pubkeys)?;
                let internal_key = keys
                    .first()
                    .map(|k| XOnlyPublicKey::from(k.inner))
                    .ok_or(ScriptError::MissingParam("pubkeys"))?;

                let refund = match (keys.get(1), params.locktime) {
                    (Some(key), Some(locktime)) => {
                        Some((XOnlyPublicKey::from(key.inner), check_locktime(locktime)?))
                    }
                    (Some(_), None) => return Err(ScriptError::MissingParam("locktime")),
                    (None, _) => None,
                };
                if keys.len() > 2 {
                    return Err(ScriptError::WrongKeyCount {
                        template: "taproot",
                        expected: 2,
                        actual: keys.len(),
                    });
                }

                Ok(Self::Taproot {
                    internal_key,
                    refund,
                })
            }
            "hashlock" => {
                let hash = params.hash.as_deref().ok_or(ScriptError::MissingParam("hash"))?;
                Ok(Self::HashLock {
                    hash: parse_hash(hash)?,
                })
            }
            other => Err(ScriptError::UnsupportedTemplate(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::P2pkh { .. } => "p2pkh",
            Self::Multisig { .. } => "multisig",
            Self::Timelock { .. } => "timelock",
            Self::Taproot { .. } => "taproot",
            Self::HashLock { .. } => "hashlock",
        }
    }

    /// Build script, output and address for `network`
    pub fn describe(&self, network: Network) -> Result<ScriptDescriptor, ScriptError> {
        let (script, script_pubkey, address, descriptor) = match self {
            Self::P2pkh { pubkey } => {
                let address = Address::p2pkh(*pubkey, network);
                let spk = address.script_pubkey();
                (spk.clone(), spk, address, format!("pkh({})", pubkey))
            }
            Self::Multisig { threshold, pubkeys } => {
                let script = multisig_script(*threshold, pubkeys);
                let address = Address::p2wsh(&script, network);
                let keys: Vec<String> = pubkeys.iter().map(|k| k.to_string()).collect();
                let descriptor = format!("wsh(multi({},{}))", threshold, keys.join(","));
                (script, address.script_pubkey(), address, descriptor)
            }
            Self::Timelock {
                claim,
                refund,
                locktime,
            } => {
                let script = timelock_script(claim.as_ref(), refund, *locktime);
                let address = Address::p2wsh(&script, network);
                let descriptor = match claim {
                    Some(claim) => format!("wsh(or(pk({}),and(after({}),pk({}))))", claim, locktime, refund),
                    None => format!("wsh(and(after({}),pk({})))", locktime, refund),
                };
                (script, address.script_pubkey(), address, descriptor)
            }
            Self::Taproot {
                internal_key,
                refund,
            } => {
                let (leaf, spend_info) = match refund {
                    Some((refund_key, locktime)) => {
                        let leaf = cltv_leaf(refund_key, *locktime);
                        let info = TaprootBuilder::new()
                            .add_leaf(0, leaf.clone())
                            .map_err(|e| ScriptError::Taproot(e.to_string()))?
                            .finalize(SECP256K1, *internal_key)
                            .map_err(|_| ScriptError::Taproot("incomplete tree".to_string()))?;
                        (leaf, info)
                    }
                    None => {
                        let info = TaprootBuilder::new()
                            .finalize(SECP256K1, *internal_key)
                            .map_err(|_| ScriptError::Taproot("incomplete tree".to_string()))?;
                        (ScriptBuf::new(), info)
                    }
                };
                let address = Address::p2tr(SECP256K1, *internal_key, spend_info.merkle_root(), network);
                let descriptor = match refund {
                    Some((key, locktime)) => format!("tr({},and(after({}),pk({})))", internal_key, locktime, key),
                    None => format!("tr({})", internal_key),
                };
                (leaf, address.script_pubkey(), address, descriptor)
            }
            Self::HashLock { hash } => {
                let script = hash_lock_script(hash);
                let address = Address::p2wsh(&script, network);
                let descriptor = format!("wsh(sha256({}))", hex::encode(hash));
                (script, address.script_pubkey(), address, descriptor)
            }
        };

        Ok(ScriptDescriptor {
            template: self.name().to_string(),
            descriptor,
            script,
            script_pubkey,
            address: address.to_string(),
            required_signatures: self.required_signatures(),
            participants: self.participants(),
            locktime: self.locktime(),
        })
    }

    pub fn required_signatures(&self) -> u8 {
        match self {
            Self::Multisig { threshold, .. } => *threshold,
            Self::HashLock { .. } => 0,
            _ => 1,
        }
    }

    pub fn participants(&self) -> Vec<String> {
        match self {
            Self::P2pkh { pubkey } => vec![pubkey.to_string()],
            Self::Multisig { pubkeys, .. } => pubkeys.iter().map(|k| k.to_string()).collect(),
            Self::Timelock { claim, refund, .. } => claim
                .iter()
                .chain(std::iter::once(refund))
                .map(|k| k.to_string())
                .collect(),
            Self::Taproot {
                internal_key,
                refund,
            } => std::iter::once(internal_key.to_string())
                .chain(refund.iter().map(|(k, _)| k.to_string()))
                .collect(),
            Self::HashLock { .. } => Vec::new(),
        }
    }

    pub fn locktime(&self) -> Option<u32> {
        match self {
            Self::Timelock { locktime, .. } => Some(*locktime),
            Self::Taproot {
                refund: Some((_, locktime)),
                ..
            } => Some(*locktime),
            _ => None,
        }
    }
}

/// Validate and describe template `name` with `params`
pub fn interpret(name: &str, params: &ScriptParams, network: Network) -> Result<ScriptDescriptor, ScriptError> {
    ScriptTemplate::from_params(name, params)?.describe(network)
}

pub fn multisig_script(threshold: u8, pubkeys: &[PublicKey]) -> ScriptBuf {
    let mut builder = Builder::new().push_int(threshold as i64);
    for key in pubkeys {
        builder = builder.push_key(key);
    }
    builder
        .push_int(pubkeys.len() as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

pub fn timelock_script(claim: Option<&PublicKey>, refund: &PublicKey, locktime: u32) -> ScriptBuf {
    let refund_branch = |builder: Builder| {
        builder
            .push_int(locktime as i64)
            .push_opcode(OP_CLTV)
            .push_opcode(OP_DROP)
            .push_key(refund)
            .push_opcode(OP_CHECKSIG)
    };

    match claim {
        Some(claim) => {
            let builder = Builder::new()
                .push_opcode(OP_IF)
                .push_key(claim)
                .push_opcode(OP_CHECKSIG)
                .push_opcode(OP_ELSE);
            refund_branch(builder).push_opcode(OP_ENDIF).into_script()
        }
        None => refund_branch(Builder::new()).into_script(),
    }
}

fn cltv_leaf(key: &XOnlyPublicKey, locktime: u32) -> ScriptBuf {
    Builder::new()
        .push_int(locktime as i64)
        .push_opcode(OP_CLTV)
        .push_opcode(OP_DROP)
        .push_x_only_key(key)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

/// `OP_SHA256 <hash> OP_EQUAL`
pub fn hash_lock_script(hash: &[u8; 32]) -> ScriptBuf {
    Builder::new()
        .push_opcode(OP_SHA256)
        .push_slice(hash)
        .push_opcode(OP_EQUAL)
        .into_script()
}

#[derive(Debug)]
enum Token {
    Op(Opcode),
    Push(Vec<u8>),
}

impl Token {
    fn number(&self) -> Option<i64> {
        match self {
            Token::Op(op) => {
                let code = op.to_u8();
                let one = OP_PUSHNUM_1.to_u8();
                let sixteen = OP_PUSHNUM_16.to_u8();
                (one..=sixteen).contains(&code).then(|| (code - one + 1) as i64)
            }
            Token::Push(bytes) => decode_script_num(bytes),
        }
    }

    fn is(&self, opcode: Opcode) -> bool {
        matches!(self, Token::Op(op) if *op == opcode)
    }
}

/// Minimally-encoded CScriptNum, at most 5 bytes
fn decode_script_num(bytes: &[u8]) -> Option<i64> {
    if bytes.len() > 5 {
        return None;
    }
    let Some((last, _)) = bytes.split_last() else {
        return Some(0);
    };

    let mut value: i64 = 0;
    for (i, b) in bytes.iter().enumerate() {
        value |= (*b as i64) << (8 * i);
    }
    if last & 0x80 != 0 {
        value &= !(0x80i64 << (8 * (bytes.len() - 1)));
        value = -value;
    }
    Some(value)
}

fn tokenize(script: &Script) -> Result<Vec<Token>, ScriptError> {
    script
        .instructions()
        .map(|ins| match ins {
            Ok(Instruction::Op(op)) => Ok(Token::Op(op)),
            Ok(Instruction::PushBytes(bytes)) => Ok(Token::Push(bytes.as_bytes().to_vec())),
            Err(e) => Err(ScriptError::Unrecognized(e.to_string())),
        })
        .collect()
}

fn key_param(bytes: &[u8]) -> Result<String, ScriptError> {
    parse_pubkey(&hex::encode(bytes)).map(|k| k.to_string())
}

fn locktime_param(token: &Token) -> Result<u32, ScriptError> {
    let value = token
        .number()
        .ok_or_else(|| ScriptError::Unrecognized("locktime is not a number".to_string()))?;
    u32::try_from(value)
        .map_err(|_| ScriptError::InvalidLocktime(0))
        .and_then(check_locktime)
}

/// Recover the template name and parameters from an existing script.
///
/// Accepts witness scripts produced by this module and standard P2PKH; the
/// result feeds straight back into [`interpret`]. P2PKH only carries the key
/// hash, so it returns no pubkeys.
pub fn parse_script(script: &Script) -> Result<(&'static str, ScriptParams), ScriptError> {
    let tokens = tokenize(script)?;
    let mut params = ScriptParams::default();

    match tokens.as_slice() {
        [Token::Op(sha), Token::Push(hash), Token::Op(eq)]
            if *sha == OP_SHA256 && *eq == OP_EQUAL && hash.len() == 32 =>
        {
            params.hash = Some(hex::encode(hash));
            Ok(("hashlock", params))
        }
        [dup, h160, Token::Push(hash), eqv, chk]
            if dup.is(OP_DUP) && h160.is(OP_HASH160) && hash.len() == 20 && eqv.is(OP_EQUALVERIFY) && chk.is(OP_CHECKSIG) =>
        {
            Ok(("p2pkh", params))
        }
        [lock, cltv, drop, Token::Push(key), chk]
            if cltv.is(OP_CLTV) && drop.is(OP_DROP) && chk.is(OP_CHECKSIG) =>
        {
            params.locktime = Some(locktime_param(lock)?);
            params.pubkeys = vec![key_param(key)?];
            Ok(("timelock", params))
        }
        [op_if, Token::Push(claim), chk1, op_else, lock, cltv, drop, Token::Push(refund), chk2, op_endif]
            if op_if.is(OP_IF)
                && chk1.is(OP_CHECKSIG)
                && op_else.is(OP_ELSE)
                && cltv.is(OP_CLTV)
                && drop.is(OP_DROP)
                && chk2.is(OP_CHECKSIG)
                && op_endif.is(OP_ENDIF) =>
        {
            params.locktime = Some(locktime_param(lock)?);
            params.pubkeys = vec![key_param(claim)?, key_param(refund)?];
            Ok(("timelock", params))
        }
        [m, keys @ .., n, check] if check.is(OP_CHECKMULTISIG) && !keys.is_empty() => {
            let threshold = m
                .number()
                .ok_or_else(|| ScriptError::Unrecognized("multisig threshold".to_string()))?;
            let count = n
                .number()
                .ok_or_else(|| ScriptError::Unrecognized("multisig key count".to_string()))?;
            if count as usize != keys.len() {
                return Err(ScriptError::Unrecognized(format!(
                    "multisig declares {} keys, has {}",
                    count,
                    keys.len()
                )));
            }

            params.pubkeys = keys
                .iter()
                .map(|k| match k {
                    Token::Push(bytes) => key_param(bytes),
                    Token::Op(op) => Err(ScriptError::Unrecognized(format!("unexpected {:?}", op))),
                })
                .collect::<Result<_, _>>()?;
            params.threshold = Some(
                u8::try_from(threshold).map_err(|_| ScriptError::InvalidThreshold {
                    threshold: 0,
                    participants: keys.len(),
                })?,
            );
            Ok(("multisig", params))
        }
        _ => Err(ScriptError::Unrecognized(script.to_asm_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    fn key(seed: u8) -> String {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
        PublicKey::new(bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &sk)).to_string()
    }

    fn multisig_params() -> ScriptParams {
        ScriptParams {
            pubkeys: vec![key(1), key(2), key(3)],
            ..Default::default()
        }
    }

    #[test]
    fn test_2of3_multisig() {
        let desc = interpret("multisig_2of3", &multisig_params(), Network::Testnet).unwrap();
        assert_eq!(desc.required_signatures, 2);
        assert_eq!(desc.participants.len(), 3);
        assert!(desc.address.starts_with("tb1q"));
        assert!(desc.descriptor.starts_with("wsh(multi(2,"));
        assert!(desc.script_pubkey.is_p2wsh());
    }

    #[test]
    fn test_2of3_rejects_wrong_shapes() {
        let mut two_keys = multisig_params();
        two_keys.pubkeys.pop();
        assert!(matches!(
            interpret("multisig_2of3", &two_keys, Network::Testnet),
            Err(ScriptError::WrongKeyCount { expected: 3, .. })
        ));

        let mut dup = multisig_params();
        dup.pubkeys[2] = dup.pubkeys[0].clone();
        assert!(matches!(
            interpret("multisig_2of3", &dup, Network::Testnet),
            Err(ScriptError::DuplicatePubkey(_))
        ));

        let mut threshold = multisig_params();
        threshold.threshold = Some(3);
        assert!(matches!(
            interpret("multisig_2of3", &threshold, Network::Testnet),
            Err(ScriptError::InvalidThreshold { .. })
        ));
    }

    #[test]
    fn test_threshold_above_participants() {
        let params = ScriptParams {
            pubkeys: vec![key(1), key(2)],
            threshold: Some(3),
            ..Default::default()
        };
        assert!(matches!(
            interpret("multisig", &params, Network::Testnet),
            Err(ScriptError::InvalidThreshold { threshold: 3, participants: 2 })
        ));
    }

    #[test]
    fn test_uncompressed_key_rejected() {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[4u8; 32]).unwrap();
        let uncompressed = hex::encode(
            bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &sk).serialize_uncompressed(),
        );
        let params = ScriptParams {
            pubkeys: vec![uncompressed],
            ..Default::default()
        };
        assert!(matches!(
            interpret("p2pkh", &params, Network::Bitcoin),
            Err(ScriptError::UncompressedPubkey(_))
        ));
    }

    #[test]
    fn test_unknown_template() {
        assert!(matches!(
            interpret("p2sh_magic", &ScriptParams::default(), Network::Testnet),
            Err(ScriptError::UnsupportedTemplate(_))
        ));
    }

    #[test]
    fn test_timelock_requires_height() {
        let mut params = ScriptParams {
            pubkeys: vec![key(1), key(2)],
            locktime: Some(850_000),
            ..Default::default()
        };
        let desc = interpret("timelock", &params, Network::Testnet).unwrap();
        assert_eq!(desc.locktime, Some(850_000));
        assert_eq!(desc.required_signatures, 1);

        params.locktime = Some(LOCKTIME_THRESHOLD + 1);
        assert!(matches!(
            interpret("timelock", &params, Network::Testnet),
            Err(ScriptError::InvalidLocktime(_))
        ));

        params.locktime = None;
        assert!(matches!(
            interpret("timelock", &params, Network::Testnet),
            Err(ScriptError::MissingParam("locktime"))
        ));
    }

    #[test]
    fn test_taproot_with_refund_leaf() {
        let params = ScriptParams {
            pubkeys: vec![key(1), key(2)],
            locktime: Some(900_000),
            ..Default::default()
        };
        let desc = interpret("taproot", &params, Network::Testnet).unwrap();
        assert!(desc.address.starts_with("tb1p"));
        assert!(desc.script_pubkey.is_p2tr());
        assert!(!desc.script.is_empty());

        let key_only = ScriptParams {
            pubkeys: vec![key(1)],
            ..Default::default()
        };
        let plain = interpret("taproot", &key_only, Network::Testnet).unwrap();
        assert_ne!(plain.address, desc.address);
        assert!(plain.script.is_empty());
    }

    #[test]
    fn test_hashlock_embeds_hash() {
        let hash = [0xabu8; 32];
        let params = ScriptParams {
            hash: Some(hex::encode(hash)),
            ..Default::default()
        };
        let desc = interpret("hashlock", &params, Network::Testnet).unwrap();
        assert!(desc.script.as_bytes().windows(32).any(|w| w == hash));

        let short = ScriptParams {
            hash: Some("abcd".into()),
            ..Default::default()
        };
        assert!(matches!(
            interpret("hashlock", &short, Network::Testnet),
            Err(ScriptError::InvalidHash(_))
        ));
    }

    #[test]
    fn test_parse_recovers_parameters() {
        let desc = interpret("multisig_2of3", &multisig_params(), Network::Testnet).unwrap();
        let (name, params) = parse_script(&desc.script).unwrap();
        assert_eq!(name, "multisig");
        assert_eq!(params.threshold, Some(2));
        assert_eq!(params.pubkeys, multisig_params().pubkeys);

        let timelock = ScriptParams {
            pubkeys: vec![key(5), key(6)],
            locktime: Some(840_123),
            ..Default::default()
        };
        let desc = interpret("timelock", &timelock, Network::Testnet).unwrap();
        let (name, params) = parse_script(&desc.script).unwrap();
        assert_eq!(name, "timelock");
        assert_eq!(params, timelock);

        let single = ScriptParams {
            pubkeys: vec![key(7)],
            locktime: Some(12),
            ..Default::default()
        };
        let desc = interpret("timelock", &single, Network::Testnet).unwrap();
        assert_eq!(parse_script(&desc.script).unwrap().1, single);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let script = Builder::new()
            .push_opcode(OP_RETURN)
            .push_slice([1u8, 2, 3])
            .into_script();
        assert!(matches!(parse_script(&script), Err(ScriptError::Unrecognized(_))));
    }

    #[test]
    fn test_script_num_decoding() {
        assert_eq!(decode_script_num(&[]), Some(0));
        assert_eq!(decode_script_num(&[0x7f]), Some(127));
        assert_eq!(decode_script_num(&[0x80, 0x00]), Some(128));
        assert_eq!(decode_script_num(&[0x81]), Some(-1));
        assert_eq!(decode_script_num(&[0x50, 0xf8, 0x0c]), Some(850_000));
    }
}
