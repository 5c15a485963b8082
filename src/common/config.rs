//! Environment-based Configuration for the Wishfund Engine
//!
//! # Environment Variables
//!
//! ## Network
//! - `WISHFUND_NETWORK` - "mainnet", "testnet", or "devnet" (default: "devnet")
//! - `WISHFUND_BITCOIN_API` - Esplora API endpoint URL
//! - `WISHFUND_CHAIN_BACKEND` - "esplora" or "memory" (default: esplora, memory on devnet)
//!
//! ## Service
//! - `WISHFUND_API_PORT` - HTTP port (default: 3001)
//! - `WISHFUND_DB_PATH` - SQLite file; unset keeps records in memory
//! - `WISHFUND_LOG_LEVEL` - trace, debug, info, warn, error
//!
//! ## Lifecycle
//! - `WISHFUND_CLAIM_TTL_SECS` - Time an agent has to submit after claiming
//! - `WISHFUND_MIN_CONFIRMATIONS` - Depth at which a MerkleProof is confirmed
//! - `WISHFUND_POLL_INTERVAL_SECS` - TransactionMonitor poll cadence
//! - `WISHFUND_SWEEP_INTERVAL_SECS` - Claim expiry sweep cadence
//! - `WISHFUND_REQUEST_TIMEOUT_SECS` - Per chain request timeout
//! - `WISHFUND_RETRY_ATTEMPTS`, `WISHFUND_RETRY_INITIAL_MS`, `WISHFUND_RETRY_MAX_MS`
//! - `WISHFUND_REORG_WATCH_BLOCKS` - How long confirmed txs stay under reorg watch
//!
//! ## Transactions
//! - `WISHFUND_FEE_RATE` - Default fee rate in sat/vB
//! - `WISHFUND_DUST_LIMIT` - Change below this is folded into the fee
//! - `WISHFUND_FUNDING_MODE` - "escrow" or "commitment"

use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::chain::RetryPolicy;
use crate::types::FundingMode;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("setting not allowed on {0}: {1}")]
    NotAllowed(String, String),
}

/// Network environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Devnet,
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "devnet" | "dev" => Ok(Network::Devnet),
            _ => Err(ConfigError::InvalidValue(
                "WISHFUND_NETWORK".to_string(),
                format!("unknown network: {}", s),
            )),
        }
    }
}

impl Network {
    /// Get default Bitcoin/Esplora API for this network
    pub fn default_bitcoin_api(&self) -> &'static str {
        match self {
            Network::Mainnet => "https://blockstream.info/api",
            Network::Testnet | Network::Devnet => "https://blockstream.info/testnet/api",
        }
    }

    /// Get bitcoin network enum
    pub fn bitcoin_network(&self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet | Network::Devnet => bitcoin::Network::Testnet,
        }
    }

    fn default_min_confirmations(&self) -> u32 {
        match self {
            Network::Mainnet => 6,
            Network::Testnet => 2,
            Network::Devnet => 1,
        }
    }
}

/// Which chain-data collaborator backs the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainBackend {
    Esplora,
    Memory,
}

impl FromStr for ChainBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "esplora" => Ok(ChainBackend::Esplora),
            "memory" | "mock" => Ok(ChainBackend::Memory),
            _ => Err(ConfigError::InvalidValue(
                "WISHFUND_CHAIN_BACKEND".to_string(),
                format!("unknown backend: {}", s),
            )),
        }
    }
}

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct WishfundConfig {
    pub network: Network,
    pub bitcoin_api: String,
    pub chain_backend: ChainBackend,
    pub api_port: u16,
    /// SQLite database path (None = in-memory store)
    pub db_path: Option<String>,
    pub claim_ttl_secs: u64,
    pub min_confirmations: u32,
    pub poll_interval_secs: u64,
    pub sweep_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub retry: RetryPolicy,
    pub reorg_watch_blocks: u32,
    pub fee_rate_sat_vb: u64,
    pub dust_limit_sats: u64,
    pub funding_mode: FundingMode,
    pub log_level: String,
}

impl Default for WishfundConfig {
    fn default() -> Self {
        let network = Network::Devnet;
        Self {
            network,
            bitcoin_api: network.default_bitcoin_api().to_string(),
            chain_backend: ChainBackend::Memory,
            api_port: 3001,
            db_path: None,
            claim_ttl_secs: 3600,
            min_confirmations: network.default_min_confirmations(),
            poll_interval_secs: 30,
            sweep_interval_secs: 60,
            request_timeout_secs: 10,
            retry: RetryPolicy::default(),
            reorg_watch_blocks: 6,
            fee_rate_sat_vb: 2,
            dust_limit_sats: 546,
            funding_mode: FundingMode::Escrow,
            log_level: "info".to_string(),
        }
    }
}

impl WishfundConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let network: Network = env::var("WISHFUND_NETWORK")
            .unwrap_or_else(|_| "devnet".to_string())
            .parse()?;

        let bitcoin_api = env::var("WISHFUND_BITCOIN_API")
            .unwrap_or_else(|_| network.default_bitcoin_api().to_string());

        let chain_backend = match env::var("WISHFUND_CHAIN_BACKEND") {
            Ok(v) => v.parse()?,
            Err(_) if network == Network::Devnet => ChainBackend::Memory,
            Err(_) => ChainBackend::Esplora,
        };

        let funding_mode = match env::var("WISHFUND_FUNDING_MODE") {
            Ok(v) => v.parse().map_err(|e: String| {
                ConfigError::InvalidValue("WISHFUND_FUNDING_MODE".to_string(), e)
            })?,
            Err(_) => FundingMode::Escrow,
        };

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: parse_or("WISHFUND_RETRY_ATTEMPTS", defaults.max_attempts)?,
            initial_delay: Duration::from_millis(parse_or(
                "WISHFUND_RETRY_INITIAL_MS",
                defaults.initial_delay.as_millis() as u64,
            )?),
            max_delay: Duration::from_millis(parse_or(
                "WISHFUND_RETRY_MAX_MS",
                defaults.max_delay.as_millis() as u64,
            )?),
            multiplier: defaults.multiplier,
        };

        let config = Self {
            network,
            bitcoin_api,
            chain_backend,
            api_port: parse_or("WISHFUND_API_PORT", 3001)?,
            db_path: env::var("WISHFUND_DB_PATH").ok().filter(|p| !p.is_empty()),
            claim_ttl_secs: parse_or("WISHFUND_CLAIM_TTL_SECS", 3600)?,
            min_confirmations: parse_or(
                "WISHFUND_MIN_CONFIRMATIONS",
                network.default_min_confirmations(),
            )?,
            poll_interval_secs: parse_or("WISHFUND_POLL_INTERVAL_SECS", 30)?,
            sweep_interval_secs: parse_or("WISHFUND_SWEEP_INTERVAL_SECS", 60)?,
            request_timeout_secs: parse_or("WISHFUND_REQUEST_TIMEOUT_SECS", 10)?,
            retry,
            reorg_watch_blocks: parse_or("WISHFUND_REORG_WATCH_BLOCKS", 6)?,
            fee_rate_sat_vb: parse_or("WISHFUND_FEE_RATE", 2)?,
            dust_limit_sats: parse_or("WISHFUND_DUST_LIMIT", 546)?,
            funding_mode,
            log_level: env::var("WISHFUND_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall or weaken the engine
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.claim_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "WISHFUND_CLAIM_TTL_SECS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        if self.min_confirmations == 0 {
            return Err(ConfigError::InvalidValue(
                "WISHFUND_MIN_CONFIRMATIONS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        if self.poll_interval_secs == 0 || self.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "WISHFUND_POLL_INTERVAL_SECS".to_string(),
                "background intervals must be non-zero".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "WISHFUND_RETRY_ATTEMPTS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        if self.network == Network::Mainnet && self.chain_backend == ChainBackend::Memory {
            return Err(ConfigError::NotAllowed(
                "mainnet".to_string(),
                "in-memory chain backend".to_string(),
            ));
        }

        Ok(())
    }

    pub fn claim_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.claim_ttl_secs as i64)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("=== Wishfund Configuration ===");
        println!("Network: {:?}", self.network);
        println!("Bitcoin API: {}", self.bitcoin_api);
        println!("Chain backend: {:?}", self.chain_backend);
        println!(
            "Store: {}",
            self.db_path.as_deref().unwrap_or("in-memory")
        );
        println!("Claim TTL: {}s", self.claim_ttl_secs);
        println!("Min confirmations: {}", self.min_confirmations);
        println!(
            "Poll/sweep interval: {}s / {}s",
            self.poll_interval_secs, self.sweep_interval_secs
        );
        println!("Default fee rate: {} sat/vB", self.fee_rate_sat_vb);
        println!("Funding mode: {}", self.funding_mode);
        println!("Log Level: {}", self.log_level);
        println!("==============================");
    }
}

fn parse_or<T: FromStr>(var_name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(var_name) {
        Ok(value) => value.trim().parse().map_err(|_| {
            ConfigError::InvalidValue(var_name.to_string(), format!("cannot parse '{}'", value))
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_parsing() {
        assert!(matches!("mainnet".parse::<Network>(), Ok(Network::Mainnet)));
        assert!(matches!("testnet".parse::<Network>(), Ok(Network::Testnet)));
        assert!(matches!("devnet".parse::<Network>(), Ok(Network::Devnet)));
        assert!("invalid".parse::<Network>().is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = WishfundConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.claim_ttl(), chrono::Duration::hours(1));
    }

    #[test]
    fn test_mainnet_rejects_memory_chain() {
        let config = WishfundConfig {
            network: Network::Mainnet,
            chain_backend: ChainBackend::Memory,
            ..WishfundConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::NotAllowed(_, _))));
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let config = WishfundConfig {
            claim_ttl_secs: 0,
            ..WishfundConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
