use convoguard_core::{ConvoError, ConvoResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Configures retry behaviour for durable-store calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    100
}
fn default_backoff_max_ms() -> u64 {
    2_000
}

/// Whether a store error is worth retrying.
///
/// Only backend unavailability and raw I/O failures qualify. Decryption
/// failures and version conflicts will not change on retry.
pub fn is_retryable(err: &ConvoError) -> bool {
    matches!(err, ConvoError::StoreUnavailable(_) | ConvoError::Io(_))
}

/// Computes the backoff delay for a given attempt using exponential backoff
/// capped at `backoff_max_ms`.
pub fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> u64 {
    let delay = policy
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(attempt));
    delay.min(policy.backoff_max_ms)
}

/// Run `op` with a per-attempt timeout, retrying retryable failures.
///
/// A timed-out attempt counts as [`ConvoError::StoreUnavailable`]. The last
/// error is returned once the retries are spent.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    what: &str,
    mut op: F,
) -> ConvoResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ConvoResult<T>>,
{
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(ConvoError::StoreUnavailable(format!(
                "{what} timed out after {}ms",
                timeout.as_millis()
            ))),
        };
        match result {
            Err(e) if is_retryable(&e) && attempt < policy.max_retries => {
                let delay = compute_backoff(policy, attempt);
                warn!(
                    operation = what,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    delay_ms = delay,
                    error = %e,
                    "Store call failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
