//! Common Infrastructure Module
//!
//! - Configuration loading from environment variables
//! - Structured logging setup
//! - Root error taxonomy

pub mod config;
pub mod error;
pub mod logging;

// Re-exports for convenience
pub use config::{ChainBackend, ConfigError, Network, WishfundConfig};
pub use error::{ErrorKind, Result, WishfundError};
pub use logging::{
    generate_correlation_id, init_from_config, init_logging, log_api_request, log_api_response,
    log_chain_event, log_lifecycle_event, log_security_event, EventCategory, LogEvent, LogLevel,
    LoggingError,
};
