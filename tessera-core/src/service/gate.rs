//! Retry, timeout, backoff and circuit breaking around external calls.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{config::Settings, error::ServiceError};

/// How one attempt failed, as reported by the service client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Worth retrying: network failure, 5xx, rate limiting, empty answer.
    Transient(String),
    /// The service answered and refused. Never retried.
    Rejected(String),
}

#[derive(Debug, Clone)]
pub struct GatePolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: bool,
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl GatePolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            timeout: settings.service_timeout,
            max_retries: settings.max_retries,
            base_backoff: settings.retry_backoff,
            max_backoff: settings.max_backoff,
            jitter: settings.retry_jitter,
            failure_threshold: settings.circuit_failure_threshold,
            cooldown: settings.circuit_cooldown,
        }
    }

    /// Delay before retry number `attempt` (zero-based), before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    fn jittered_backoff(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        // keep at least half of the computed delay
        let half = delay.as_millis() as u64 / 2;
        let extra = rand::thread_rng().gen_range(0..=half);
        Duration::from_millis(half + extra)
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Breaker for a single endpoint.
#[derive(Debug)]
struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// `Err(remaining)` while the circuit refuses calls. The returned
    /// admission is pending when it holds the half-open trial slot.
    fn admit(&self) -> Result<Admission<'_>, Duration> {
        let mut state = self.lock();
        let Some(opened_at) = state.opened_at else {
            return Ok(Admission {
                circuit: self,
                trial: false,
            });
        };
        let elapsed = opened_at.elapsed();
        if elapsed < self.cooldown {
            return Err(self.cooldown - elapsed);
        }
        if state.trial_in_flight {
            return Err(Duration::ZERO);
        }
        state.trial_in_flight = true;
        Ok(Admission {
            circuit: self,
            trial: true,
        })
    }

    /// Frees the trial slot of a call that never reported an outcome. The
    /// circuit stays open, so the next caller becomes the trial.
    fn abandon_trial(&self) {
        self.lock().trial_in_flight = false;
    }

    fn record_success(&self) {
        let mut state = self.lock();
        *state = BreakerState::default();
    }

    fn record_failure(&self) -> bool {
        let mut state = self.lock();
        state.consecutive_failures += 1;
        if state.trial_in_flight || state.consecutive_failures >= self.threshold {
            state.opened_at = Some(Instant::now());
            state.trial_in_flight = false;
            return true;
        }
        false
    }
}

/// One admitted attempt. Dropping it before an outcome is recorded, on
/// cancellation or when the caller's future is dropped, releases the
/// half-open trial slot.
struct Admission<'a> {
    circuit: &'a CircuitBreaker,
    trial: bool,
}

impl Admission<'_> {
    fn success(mut self) {
        self.trial = false;
        self.circuit.record_success();
    }

    fn failure(mut self) -> bool {
        self.trial = false;
        self.circuit.record_failure()
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.trial {
            self.circuit.abandon_trial();
        }
    }
}

enum LastFailure {
    Timeout,
    Transient(String),
}

/// Shared by every conversion in the process; the breaker table is the only
/// mutable state and sits behind a lock.
#[derive(Debug)]
pub struct ServiceGate {
    policy: GatePolicy,
    circuits: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl ServiceGate {
    pub fn new(policy: GatePolicy) -> Self {
        Self {
            policy,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    fn circuit(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        let mut circuits = self
            .circuits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        circuits
            .entry(endpoint.to_owned())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    self.policy.failure_threshold,
                    self.policy.cooldown,
                ))
            })
            .clone()
    }

    /// Runs `call` under the gate's policy for `endpoint`.
    ///
    /// `call` is invoked once per attempt. It races against `cancel` and the
    /// per-call timeout.
    pub async fn call<T, F, Fut>(
        &self,
        endpoint: &str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let circuit = self.circuit(endpoint);
        let mut attempt: u32 = 0;
        loop {
            let admission = match circuit.admit() {
                Ok(admission) => admission,
                Err(remaining) => {
                    return Err(ServiceError::CircuitOpen {
                        endpoint: endpoint.to_owned(),
                        retry_in_ms: remaining.as_millis() as u64,
                    })
                }
            };

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ServiceError::Cancelled { endpoint: endpoint.to_owned() });
                }
                outcome = tokio::time::timeout(self.policy.timeout, call()) => outcome,
            };

            let failure = match outcome {
                Ok(Ok(value)) => {
                    admission.success();
                    if attempt > 0 {
                        debug!(endpoint, attempts = attempt + 1, "call recovered");
                    }
                    return Ok(value);
                }
                Ok(Err(CallError::Rejected(reason))) => {
                    // the service is up, it just refused this request
                    admission.success();
                    return Err(ServiceError::Rejected {
                        endpoint: endpoint.to_owned(),
                        reason,
                    });
                }
                Ok(Err(CallError::Transient(err))) => LastFailure::Transient(err),
                Err(_elapsed) => LastFailure::Timeout,
            };

            if admission.failure() {
                warn!(endpoint, "circuit opened");
            }
            attempt += 1;

            if attempt > self.policy.max_retries {
                return Err(match failure {
                    LastFailure::Timeout => ServiceError::Timeout {
                        endpoint: endpoint.to_owned(),
                        attempts: attempt,
                        timeout_ms: self.policy.timeout.as_millis() as u64,
                    },
                    LastFailure::Transient(last_error) => ServiceError::Exhausted {
                        endpoint: endpoint.to_owned(),
                        attempts: attempt,
                        last_error,
                    },
                });
            }

            let delay = self.policy.jittered_backoff(attempt - 1);
            match &failure {
                LastFailure::Timeout => warn!(
                    endpoint,
                    "attempt {}/{} timed out, retrying in {}ms",
                    attempt,
                    self.policy.max_retries + 1,
                    delay.as_millis()
                ),
                LastFailure::Transient(err) => warn!(
                    endpoint,
                    "attempt {}/{} failed: {}, retrying in {}ms",
                    attempt,
                    self.policy.max_retries + 1,
                    err,
                    delay.as_millis()
                ),
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ServiceError::Cancelled { endpoint: endpoint.to_owned() });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32, threshold: u32) -> GatePolicy {
        GatePolicy {
            timeout: Duration::from_secs(1),
            max_retries,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
            jitter: true,
            failure_threshold: threshold,
            cooldown: Duration::from_secs(30),
        }
    }

    /// Fails the first `failures` calls, then answers `42`.
    fn flaky(calls: &AtomicU32, failures: u32) -> Result<u32, CallError> {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        if n < failures {
            Err(CallError::Transient(format!("boom {n}")))
        } else {
            Ok(42)
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy(5, 10);
        assert_eq!(p.backoff(0), Duration::from_millis(100));
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(800));
        assert_eq!(p.backoff(4), Duration::from_millis(1000));
        assert_eq!(p.backoff(40), Duration::from_millis(1000));
        for attempt in 0..6 {
            let d = p.jittered_backoff(attempt);
            assert!(d <= p.backoff(attempt) && d >= p.backoff(attempt) / 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success_within_budget() {
        let gate = ServiceGate::new(policy(3, 10));
        let calls = &AtomicU32::new(0);
        let out = gate
            .call("svc", &CancellationToken::new(), move || async move { flaky(calls, 3) })
            .await;
        assert_eq!(out, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_bound() {
        let gate = ServiceGate::new(policy(2, 10));
        let calls = &AtomicU32::new(0);
        let out = gate
            .call("svc", &CancellationToken::new(), move || async move { flaky(calls, 10) })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match out {
            Err(ServiceError::Exhausted {
                attempts,
                last_error,
                ..
            }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "boom 2");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_is_not_retried() {
        let gate = ServiceGate::new(policy(5, 10));
        let calls = &AtomicU32::new(0);
        let out: Result<(), _> = gate
            .call("svc", &CancellationToken::new(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CallError::Rejected("bad schema".into()))
            })
            .await;
        assert!(matches!(out, Err(ServiceError::Rejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_when_last_attempt_hangs() {
        let gate = ServiceGate::new(policy(1, 10));
        let out: Result<(), _> = gate
            .call("slow", &CancellationToken::new(), || async {
                std::future::pending::<Result<(), CallError>>().await
            })
            .await;
        assert_eq!(
            out,
            Err(ServiceError::Timeout {
                endpoint: "slow".into(),
                attempts: 2,
                timeout_ms: 1000
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_opens_then_half_opens() {
        let gate = ServiceGate::new(policy(0, 3));
        let calls = &AtomicU32::new(0);
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            let out = gate.call("svc", &cancel, move || async move { flaky(calls, 4) }).await;
            assert!(matches!(out, Err(ServiceError::Exhausted { .. })));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // open: fails fast without invoking the call
        let out = gate.call("svc", &cancel, move || async move { flaky(calls, 4) }).await;
        assert!(matches!(out, Err(ServiceError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // other endpoints are unaffected
        let other = &AtomicU32::new(0);
        assert_eq!(
            gate.call("other", &cancel, move || async move { flaky(other, 0) }).await,
            Ok(42)
        );

        // half-open trial fails and re-opens
        tokio::time::advance(Duration::from_secs(31)).await;
        let out = gate.call("svc", &cancel, move || async move { flaky(calls, 4) }).await;
        assert!(matches!(out, Err(ServiceError::Exhausted { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let out = gate.call("svc", &cancel, move || async move { flaky(calls, 4) }).await;
        assert!(matches!(out, Err(ServiceError::CircuitOpen { .. })));

        // next trial succeeds and closes the circuit
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(gate.call("svc", &cancel, move || async move { flaky(calls, 4) }).await, Ok(42));
        assert_eq!(gate.call("svc", &cancel, move || async move { flaky(calls, 4) }).await, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_trial_frees_the_half_open_slot() {
        let mut p = policy(0, 1);
        p.timeout = Duration::from_secs(600);
        let gate = ServiceGate::new(p);
        let calls = &AtomicU32::new(0);
        let never = CancellationToken::new();

        let out = gate.call("svc", &never, move || async move { flaky(calls, 1) }).await;
        assert!(matches!(out, Err(ServiceError::Exhausted { .. })));
        tokio::time::advance(Duration::from_secs(31)).await;

        // the trial's conversion is cancelled while the call hangs
        let cancel = CancellationToken::new();
        let trial = gate.call("svc", &cancel, || async {
            std::future::pending::<Result<u32, CallError>>().await
        });
        let canceller = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        };
        let (out, ()) = tokio::join!(trial, canceller);
        assert!(matches!(out, Err(ServiceError::Cancelled { .. })));

        // the next trial is admitted and closes the circuit
        assert_eq!(gate.call("svc", &never, move || async move { flaky(calls, 1) }).await, Ok(42));

        // reopen, then drop a trial future mid-call
        let out = gate
            .call("svc", &never, || async { Err::<u32, _>(CallError::Transient("down".into())) })
            .await;
        assert!(matches!(out, Err(ServiceError::Exhausted { .. })));
        tokio::time::advance(Duration::from_secs(31)).await;
        let dropped = tokio::time::timeout(
            Duration::from_secs(1),
            gate.call("svc", &never, || async {
                std::future::pending::<Result<u32, CallError>>().await
            }),
        )
        .await;
        assert!(dropped.is_err());

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(gate.call("svc", &never, move || async move { flaky(calls, 1) }).await, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_call() {
        let gate = ServiceGate::new(policy(3, 10));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = &AtomicU32::new(0);
        let out = gate.call("svc", &cancel, move || async move { flaky(calls, 0) }).await;
        assert!(matches!(out, Err(ServiceError::Cancelled { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
