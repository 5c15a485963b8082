//! Retry with Exponential Backoff
//!
//! Chain calls are retried only on transient errors. Each attempt runs under
//! a request timeout that is independent of any background poll interval.

use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{BlockHeaderInfo, ChainClient, ChainError};
use crate::types::{MerkleProof, TxRole};

/// Backoff schedule
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Delay before retry number `attempt` (1-based), capped, with up to 10%
    /// jitter so concurrent pollers do not retry in lockstep
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_millis() as f64) as u64;

        let jitter = if capped >= 10 {
            rand::thread_rng().gen_range(0..=capped / 10)
        } else {
            0
        };

        Duration::from_millis(capped.saturating_add(jitter).min(self.max_delay.as_millis() as u64))
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    op_name: &str,
    mut op: F,
) -> Result<T, ChainError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChainError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let result = match tokio::time::timeout(timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(ChainError::Timeout(timeout)),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying chain request"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.is_transient() {
                    warn!(op = op_name, attempts = attempt, error = %e, "Chain request exhausted retries");
                }
                return Err(e);
            }
        }
    }
}

/// `ChainClient` decorator adding timeout + backoff to every call
#[derive(Clone)]
pub struct RetryingChainClient {
    inner: Arc<dyn ChainClient>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl RetryingChainClient {
    pub fn new(inner: Arc<dyn ChainClient>, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            inner,
            policy,
            timeout,
        }
    }
}

#[async_trait]
impl ChainClient for RetryingChainClient {
    async fn get_block_header(&self, height: u32) -> Result<BlockHeaderInfo, ChainError> {
        with_retry(&self.policy, self.timeout, "get_block_header", || {
            self.inner.get_block_header(height)
        })
        .await
    }

    async fn get_tx_confirmations(&self, tx_id: &str) -> Result<Option<u32>, ChainError> {
        with_retry(&self.policy, self.timeout, "get_tx_confirmations", || {
            self.inner.get_tx_confirmations(tx_id)
        })
        .await
    }

    async fn get_current_height(&self) -> Result<u32, ChainError> {
        with_retry(&self.policy, self.timeout, "get_current_height", || {
            self.inner.get_current_height()
        })
        .await
    }

    async fn get_merkle_proof(&self, tx_id: &str, role: TxRole) -> Result<Option<MerkleProof>, ChainError> {
        with_retry(&self.policy, self.timeout, "get_merkle_proof", || {
            self.inner.get_merkle_proof(tx_id, role)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            multiplier: 2.0,
        };
        assert!(policy.delay_for_attempt(1) >= Duration::from_millis(100));
        assert!(policy.delay_for_attempt(2) >= Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(3), Duration::from_secs(1), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ChainError::Unavailable("busy".into()))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = with_retry(&fast_policy(5), Duration::from_secs(1), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ChainError::Parse("garbage".into())) }
        })
        .await;

        assert!(matches!(result, Err(ChainError::Parse(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retrying_client_gives_up() {
        let mut mock = MockChainClient::new();
        mock.expect_get_current_height()
            .times(3)
            .returning(|| Err(ChainError::Unavailable("down".into())));

        let client = RetryingChainClient::new(Arc::new(mock), fast_policy(3), Duration::from_secs(1));
        let result = client.get_current_height().await;
        assert!(matches!(result, Err(ChainError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let result: Result<u32, _> =
            with_retry(&fast_policy(1), Duration::from_millis(10), "slow", || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(1)
            })
            .await;

        assert!(matches!(result, Err(ChainError::Timeout(_))));
    }
}
