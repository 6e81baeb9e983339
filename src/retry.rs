//! Classified retry with exponential backoff.
//!
//! Each logical operation gets one [`RetryAttempt`]. Every failure runs
//! through [`classify`]; the verdict's policy decides whether to back off,
//! re-authenticate once, or stop. Whatever stops the loop is mapped onto the
//! caller-facing [`Error`] taxonomy here.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::classify::{classify, ErrorKind, ErrorVerdict};
use crate::config::RetryConfig;
use crate::logging::targets;
use crate::remote::RawFailure;
use crate::weight::OperationCost;
use crate::{Error, Result};

/// Calculate exponential backoff delay with jitter.
///
/// # Arguments
/// - `attempt`: Retry number (0-based: 0 is the delay before the first retry)
/// - `initial`: Initial delay
/// - `max`: Maximum delay, applied after jitter
/// - `multiplier`: Backoff multiplier (typically 2.0)
/// - `jitter`: Jitter factor (0.0-1.0, e.g. 0.25 for ±25%)
pub fn calculate_backoff_delay(
    attempt: u32,
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
) -> Duration {
    let base_secs = initial.as_secs_f64() * multiplier.powi(attempt as i32);
    let capped_secs = base_secs.min(max.as_secs_f64());

    let jitter_factor = if jitter > 0.0 {
        1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
    } else {
        1.0
    };

    Duration::from_secs_f64((capped_secs * jitter_factor).clamp(0.0, max.as_secs_f64()))
}

/// Bookkeeping for one logical operation. Discarded when it terminates.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    /// Operation name for logs and surfaced errors
    pub operation: String,
    /// Attempts started so far
    pub attempt: u32,
    /// Backoff slept so far
    pub elapsed_backoff: Duration,
    /// Whether the one allowed re-authentication has been spent
    pub reauthenticated: bool,
    pub started: Instant,
    pub deadline: Instant,
    /// Locally computed cost, reported if the remote rejects the request size
    pub cost: Option<OperationCost>,
}

impl RetryAttempt {
    pub fn new(operation: impl Into<String>, deadline: Instant) -> Self {
        Self {
            operation: operation.into(),
            attempt: 0,
            elapsed_backoff: Duration::ZERO,
            reauthenticated: false,
            started: Instant::now(),
            deadline,
            cost: None,
        }
    }

    pub fn with_cost(mut self, cost: OperationCost) -> Self {
        self.cost = Some(cost);
        self
    }

    fn timeout(&self) -> Error {
        Error::Timeout(self.deadline.saturating_duration_since(self.started))
    }

    fn exhausted(&self, verdict: &ErrorVerdict) -> Error {
        error!(
            target: targets::RETRY,
            operation = %self.operation,
            attempts = self.attempt,
            backoff_ms = self.elapsed_backoff.as_millis() as u64,
            code = %verdict.code,
            "Retry budget exhausted"
        );
        Error::RateLimitExceededPermanently {
            attempts: self.attempt,
            last_code: verdict.code.clone(),
        }
    }
}

type NoReauth = fn() -> std::future::Ready<Result<()>>;

/// Applies [`RetryConfig`] bounds to fallible remote operations.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before retry number `retry` (1-based), honouring a server hint.
    pub fn backoff_delay(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let scheduled = calculate_backoff_delay(
            retry.saturating_sub(1),
            self.config.base_delay(),
            self.config.max_delay(),
            self.config.multiplier,
            self.config.jitter,
        );
        match hint {
            Some(hint) => scheduled.max(hint).min(self.config.max_delay()),
            None => scheduled,
        }
    }

    /// Run `op` with backoff for RateLimited/Transient verdicts.
    ///
    /// A SessionExpired verdict is terminal here (`SessionInvalid`); use
    /// [`execute_with_reauth`](Self::execute_with_reauth) on paths that can
    /// re-login.
    pub async fn execute<T, Op, Fut>(&self, attempt: RetryAttempt, op: Op) -> Result<T>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<std::result::Result<T, RawFailure>>>,
    {
        self.run(attempt, op, None::<NoReauth>).await
    }

    /// Like [`execute`](Self::execute), but a SessionExpired verdict runs
    /// `reauth` once and retries immediately. A second SessionExpired after
    /// that surfaces as `SessionInvalid`.
    ///
    /// `op` returns `Err` for gate-side failures (e.g. login refused), which
    /// end the loop as-is, and `Ok(Err(_))` for remote failures to classify.
    pub async fn execute_with_reauth<T, Op, Fut, Re, ReFut>(
        &self,
        attempt: RetryAttempt,
        op: Op,
        reauth: Re,
    ) -> Result<T>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<std::result::Result<T, RawFailure>>>,
        Re: FnMut() -> ReFut,
        ReFut: Future<Output = Result<()>>,
    {
        self.run(attempt, op, Some(reauth)).await
    }

    async fn run<T, Op, Fut, Re, ReFut>(
        &self,
        mut state: RetryAttempt,
        mut op: Op,
        mut reauth: Option<Re>,
    ) -> Result<T>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<std::result::Result<T, RawFailure>>>,
        Re: FnMut() -> ReFut,
        ReFut: Future<Output = Result<()>>,
    {
        loop {
            if Instant::now() >= state.deadline {
                return Err(state.timeout());
            }
            state.attempt += 1;

            let outcome = match tokio::time::timeout_at(state.deadline, op(state.attempt)).await {
                Ok(outcome) => outcome?,
                Err(_) => return Err(state.timeout()),
            };
            let failure = match outcome {
                Ok(value) => {
                    if state.attempt > 1 {
                        debug!(
                            target: targets::RETRY,
                            operation = %state.operation,
                            attempts = state.attempt,
                            "Succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(failure) => failure,
            };

            let verdict = classify(&failure);
            debug!(
                target: targets::RETRY,
                operation = %state.operation,
                attempt = state.attempt,
                kind = ?verdict.kind,
                code = %verdict.code,
                "Classified failure"
            );

            match verdict.kind {
                ErrorKind::Fatal => {
                    error!(
                        target: targets::RETRY,
                        operation = %state.operation,
                        code = %verdict.code,
                        message = %verdict.message,
                        "Remote error"
                    );
                    return Err(Error::fatal(verdict.code, verdict.message));
                }
                ErrorKind::CostExceeded => {
                    let (cost, budget) = state
                        .cost
                        .map(|c| (c.weight, c.budget))
                        .unwrap_or_default();
                    error!(
                        target: targets::RETRY,
                        operation = %state.operation,
                        code = %verdict.code,
                        "Remote rejected request size"
                    );
                    return Err(Error::cost_exceeded(state.operation, cost, budget));
                }
                ErrorKind::SessionExpired => {
                    let Some(reauth) = reauth.as_mut() else {
                        return Err(Error::session_invalid(format!(
                            "{} rejected the session ({})",
                            state.operation, verdict.code
                        )));
                    };
                    if state.reauthenticated {
                        error!(
                            target: targets::RETRY,
                            operation = %state.operation,
                            code = %verdict.code,
                            "Session rejected again after re-login"
                        );
                        return Err(Error::session_invalid(format!(
                            "{} rejected a freshly issued session ({})",
                            state.operation, verdict.code
                        )));
                    }
                    if state.attempt >= self.config.max_attempts {
                        return Err(state.exhausted(&verdict));
                    }
                    state.reauthenticated = true;
                    warn!(
                        target: targets::RETRY,
                        operation = %state.operation,
                        code = %verdict.code,
                        "Session expired, re-authenticating"
                    );
                    match tokio::time::timeout_at(state.deadline, reauth()).await {
                        Ok(result) => result?,
                        Err(_) => return Err(state.timeout()),
                    }
                }
                ErrorKind::RateLimited | ErrorKind::Transient => {
                    if state.attempt >= self.config.max_attempts {
                        return Err(state.exhausted(&verdict));
                    }
                    let delay = self.backoff_delay(state.attempt, verdict.backoff_hint);
                    if state.elapsed_backoff + delay > self.config.max_elapsed() {
                        return Err(state.exhausted(&verdict));
                    }

                    warn!(
                        target: targets::RETRY,
                        operation = %state.operation,
                        attempt = state.attempt,
                        kind = ?verdict.kind,
                        code = %verdict.code,
                        delay_ms = delay.as_millis() as u64,
                        "Backing off before retry"
                    );

                    let wake = Instant::now() + delay;
                    if wake >= state.deadline {
                        tokio::time::sleep_until(state.deadline).await;
                        return Err(state.timeout());
                    }
                    tokio::time::sleep_until(wake).await;
                    state.elapsed_backoff += delay;
                }
            }
        }
    }
}
