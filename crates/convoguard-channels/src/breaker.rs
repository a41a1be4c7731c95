use convoguard_core::{ConvoError, ConvoResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time the circuit stays open before a trial call, in milliseconds.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    /// Upper bound on a single guarded call, in milliseconds.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout_ms() -> u64 {
    60_000
}
fn default_call_timeout_ms() -> u64 {
    10_000
}

/// Operating state of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    /// Calls pass through.
    Closed,
    /// Calls fail fast.
    Open,
    /// One trial call is allowed to probe recovery.
    HalfOpen,
}

#[derive(Debug)]
struct CircuitState {
    status: CircuitStatus,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Point-in-time view of a breaker, for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    /// Name of the protected upstream.
    pub name: String,
    /// Current status.
    pub status: CircuitStatus,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Milliseconds since the circuit opened, when open.
    pub open_for_ms: Option<u64>,
}

/// Three-state circuit breaker for one upstream dependency.
///
/// Only transient errors (see [`ConvoError::is_transient`]) and timeouts
/// count as failures. Request-specific rejections pass through untouched.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    call_timeout: Duration,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(name: impl Into<String>, config: &BreakerConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold.max(1),
            reset_timeout: Duration::from_millis(config.reset_timeout_ms),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
            state: Mutex::new(CircuitState {
                status: CircuitStatus::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Run `operation` under the breaker.
    ///
    /// Fails fast with [`ConvoError::UpstreamUnavailable`] while open. A call
    /// that exceeds the call timeout is abandoned and counted as a failure.
    pub async fn call<F, T>(&self, operation: F) -> ConvoResult<T>
    where
        F: Future<Output = ConvoResult<T>>,
    {
        let mut permit = self.acquire()?;
        let result = match tokio::time::timeout(self.call_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(ConvoError::UpstreamUnavailable(format!(
                "{} call timed out after {}ms",
                self.name,
                self.call_timeout.as_millis()
            ))),
        };

        match &result {
            Ok(_) => self.record_success(),
            Err(e) if e.is_transient() => self.record_failure(e),
            Err(_) => self.record_neutral(),
        }
        permit.completed = true;
        result
    }

    /// Current status, without side effects.
    pub fn status(&self) -> CircuitStatus {
        self.state.lock().status
    }

    /// Snapshot for health output.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            status: state.status,
            consecutive_failures: state.consecutive_failures,
            open_for_ms: state
                .opened_at
                .map(|at| u64::try_from(at.elapsed().as_millis()).unwrap_or(u64::MAX)),
        }
    }

    /// Name of the protected upstream.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn acquire(&self) -> ConvoResult<Permit<'_>> {
        let mut state = self.state.lock();
        match state.status {
            CircuitStatus::Closed => {}
            CircuitStatus::Open => {
                let elapsed = state.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed < self.reset_timeout {
                    return Err(self.open_error());
                }
                state.status = CircuitStatus::HalfOpen;
                state.trial_in_flight = true;
                info!(upstream = %self.name, "Circuit half-open, sending trial call");
            }
            CircuitStatus::HalfOpen => {
                if state.trial_in_flight {
                    return Err(self.open_error());
                }
                state.trial_in_flight = true;
            }
        }
        Ok(Permit {
            breaker: self,
            completed: false,
        })
    }

    fn open_error(&self) -> ConvoError {
        ConvoError::UpstreamUnavailable(format!("circuit for {} is open", self.name))
    }

    fn record_success(&self) {
        let mut state = self.state.lock();
        if state.status != CircuitStatus::Closed {
            info!(upstream = %self.name, "Circuit closed");
        }
        state.status = CircuitStatus::Closed;
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.trial_in_flight = false;
    }

    fn record_failure(&self, error: &ConvoError) {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        match state.status {
            CircuitStatus::Closed if state.consecutive_failures >= self.failure_threshold => {
                state.status = CircuitStatus::Open;
                state.opened_at = Some(Instant::now());
                warn!(
                    upstream = %self.name,
                    failures = state.consecutive_failures,
                    error = %error,
                    "Circuit opened"
                );
            }
            CircuitStatus::HalfOpen => {
                state.status = CircuitStatus::Open;
                state.opened_at = Some(Instant::now());
                state.trial_in_flight = false;
                warn!(upstream = %self.name, error = %error, "Trial call failed, circuit re-opened");
            }
            _ => {}
        }
    }

    /// The upstream answered but rejected this particular request.
    fn record_neutral(&self) {
        let mut state = self.state.lock();
        if state.status == CircuitStatus::HalfOpen {
            state.trial_in_flight = false;
        }
    }
}

/// Releases a half-open trial slot if the guarded call is dropped before it
/// finishes.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    completed: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.completed {
            let mut state = self.breaker.state.lock();
            if state.status == CircuitStatus::HalfOpen {
                state.trial_in_flight = false;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            &BreakerConfig {
                failure_threshold: 5,
                reset_timeout_ms: 60_000,
                call_timeout_ms: 1_000,
            },
        )
    }

    async fn fail(b: &CircuitBreaker) -> ConvoResult<()> {
        b.call(async { Err::<(), _>(ConvoError::UpstreamUnavailable("503".into())) })
            .await
    }

    async fn succeed(b: &CircuitBreaker) -> ConvoResult<()> {
        b.call(async { Ok(()) }).await
    }

    #[tokio::test]
    async fn opens_after_threshold() {
        let b = breaker();
        for _ in 0..4 {
            assert!(fail(&b).await.is_err());
            assert_eq!(b.status(), CircuitStatus::Closed);
        }
        assert!(fail(&b).await.is_err());
        assert_eq!(b.status(), CircuitStatus::Open);
    }

    #[tokio::test]
    async fn success_resets_consecutive_count() {
        let b = breaker();
        for _ in 0..4 {
            fail(&b).await.ok();
        }
        succeed(&b).await.unwrap();
        assert_eq!(b.snapshot().consecutive_failures, 0);
        for _ in 0..4 {
            fail(&b).await.ok();
        }
        assert_eq!(b.status(), CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_fails_fast_without_calling() {
        let b = breaker();
        for _ in 0..5 {
            fail(&b).await.ok();
        }
        let calls = AtomicU32::new(0);
        let result = b
            .call(async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ConvoError::UpstreamUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_success_closes() {
        let b = breaker();
        for _ in 0..5 {
            fail(&b).await.ok();
        }
        tokio::time::advance(Duration::from_millis(60_000)).await;
        succeed(&b).await.unwrap();
        assert_eq!(b.status(), CircuitStatus::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_and_restarts_clock() {
        let b = breaker();
        for _ in 0..5 {
            fail(&b).await.ok();
        }
        tokio::time::advance(Duration::from_millis(60_000)).await;
        fail(&b).await.ok();
        assert_eq!(b.status(), CircuitStatus::Open);

        tokio::time::advance(Duration::from_millis(30_000)).await;
        assert!(succeed(&b).await.is_err());
        tokio::time::advance(Duration::from_millis(30_000)).await;
        assert!(succeed(&b).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_trial_in_flight() {
        let b = breaker();
        for _ in 0..5 {
            fail(&b).await.ok();
        }
        tokio::time::advance(Duration::from_millis(60_000)).await;

        let trial = b.acquire().unwrap();
        assert_eq!(b.status(), CircuitStatus::HalfOpen);
        assert!(b.acquire().is_err());

        // Abandoning the trial frees the slot.
        drop(trial);
        assert!(b.acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_failure() {
        let b = CircuitBreaker::new(
            "slow",
            &BreakerConfig {
                failure_threshold: 1,
                reset_timeout_ms: 60_000,
                call_timeout_ms: 100,
            },
        );
        let result = b
            .call(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ConvoError::UpstreamUnavailable(_))));
        assert_eq!(b.status(), CircuitStatus::Open);
    }

    #[tokio::test]
    async fn client_errors_do_not_trip_the_breaker() {
        let b = CircuitBreaker::new(
            "test",
            &BreakerConfig {
                failure_threshold: 1,
                ..BreakerConfig::default()
            },
        );
        let result = b
            .call(async { Err::<(), _>(ConvoError::Channel("invalid recipient".into())) })
            .await;
        assert!(matches!(result, Err(ConvoError::Channel(_))));
        assert_eq!(b.status(), CircuitStatus::Closed);
    }
}
