//! The single entry point for remote calls.
//!
//! ```text
//! call -> weight check -> [per attempt: permits -> token -> invoke]
//!      -> classify -> backoff / re-login / surface
//! ```
//!
//! The weight check runs once, before any permit or network call. Permits
//! are taken per attempt, so a retry is rate limited like any other call.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::GateConfig;
use crate::logging::targets;
use crate::rate_limit::{RateLimitMetrics, RateLimiterRegistry, RateScope};
use crate::remote::{AuthApi, OperationKind, OperationParams, RawResponse, RemoteApi};
use crate::retry::{RetryAttempt, RetryExecutor};
use crate::session::{SessionManager, SessionStatus};
use crate::weight::WeightValidator;
use crate::{Error, Result};

/// Facade over weight validation, rate limiting, session and retry.
///
/// Construct once per process and share it (`Arc<Dispatcher>`).
pub struct Dispatcher {
    validator: WeightValidator,
    limiters: Arc<RateLimiterRegistry>,
    session: Arc<SessionManager>,
    remote: Arc<dyn RemoteApi>,
    retry: RetryExecutor,
    call_timeout: Duration,
    calls: AtomicU64,
    failures: AtomicU64,
}

impl Dispatcher {
    /// Build the gate from a validated copy of `config`.
    ///
    /// # Errors
    /// `Error::Config` when [`GateConfig::validate`] rejects the config. A
    /// zero interval or capacity would otherwise stall or kill the
    /// background tasks.
    pub fn new(
        config: &GateConfig,
        remote: Arc<dyn RemoteApi>,
        auth: Arc<dyn AuthApi>,
    ) -> Result<Self> {
        config.validate()?;
        let limiters = Arc::new(RateLimiterRegistry::new(config.rate_limits.clone()));
        let session = Arc::new(SessionManager::new(
            config.credentials.clone(),
            config.session.clone(),
            config.retry.clone(),
            config.dispatch.call_timeout(),
            auth,
            limiters.clone(),
        ));
        Ok(Self {
            validator: WeightValidator::new(config.weight.budget),
            limiters,
            session,
            remote,
            retry: RetryExecutor::new(config.retry.clone()),
            call_timeout: config.dispatch.call_timeout(),
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        })
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn limiters(&self) -> &Arc<RateLimiterRegistry> {
        &self.limiters
    }

    pub fn validator(&self) -> &WeightValidator {
        &self.validator
    }

    /// Call with the configured deadline.
    ///
    /// # Errors
    /// One of `CostExceeded`, `UnsupportedParameter`,
    /// `RateLimitExceededPermanently`, `SessionInvalid`, `Fatal` or `Timeout`.
    pub async fn call(&self, kind: OperationKind, params: &OperationParams) -> Result<RawResponse> {
        self.call_with_timeout(kind, params, self.call_timeout).await
    }

    /// Call with an explicit overall deadline covering permits, backoff and
    /// network time.
    pub async fn call_with_timeout(
        &self,
        kind: OperationKind,
        params: &OperationParams,
        timeout: Duration,
    ) -> Result<RawResponse> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let result = self.dispatch(kind, params, timeout).await;
        if let Err(e) = &result {
            self.failures.fetch_add(1, Ordering::Relaxed);
            error!(target: targets::DISPATCH, operation = %kind, error = %e, "Call failed");
        }
        result
    }

    async fn dispatch(
        &self,
        kind: OperationKind,
        params: &OperationParams,
        timeout: Duration,
    ) -> Result<RawResponse> {
        let cost = self.validator.validate(kind, params)?;
        let scopes = Self::scopes(kind, params);
        let deadline = Instant::now() + timeout;
        debug!(
            target: targets::DISPATCH,
            operation = %kind,
            weight = cost.weight,
            scopes = scopes.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Dispatching"
        );

        // Token used by the latest attempt, so a SessionExpired verdict
        // invalidates exactly that token.
        let used_token: Mutex<Option<String>> = Mutex::new(None);
        let used_token = &used_token;
        let scopes = &scopes;
        let attempt = RetryAttempt::new(kind.method(), deadline).with_cost(cost);

        self.retry
            .execute_with_reauth(
                attempt,
                move |n| async move {
                    for scope in scopes {
                        self.limiters.acquire(scope).await;
                    }
                    let token = self.session.ensure_active().await?;
                    *used_token.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());
                    if n > 1 {
                        debug!(target: targets::DISPATCH, operation = %kind, attempt = n, "Retrying");
                    }
                    Ok::<_, Error>(self.remote.invoke(kind, params, &token).await)
                },
                move || async move {
                    let failed = used_token.lock().unwrap_or_else(|e| e.into_inner()).take();
                    match failed {
                        Some(token) => self.session.recover(&token).await.map(drop),
                        None => self.session.ensure_active().await.map(drop),
                    }
                },
            )
            .await
    }

    /// Rate scopes one attempt of `kind` must acquire, in acquisition order.
    ///
    /// Every call takes a general permit; market book reads also take one
    /// per distinct market.
    pub fn scopes(kind: OperationKind, params: &OperationParams) -> Vec<RateScope> {
        let mut scopes = vec![RateScope::GeneralOperation];
        if kind == OperationKind::ListMarketBook {
            let markets: BTreeSet<&str> = params.market_ids.iter().map(String::as_str).collect();
            scopes.extend(markets.into_iter().map(RateScope::resource));
        }
        scopes
    }

    /// Spawn the keep-alive loop and the limiter sweep.
    pub fn start_background(&self) -> BackgroundTasks {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = vec![
            tokio::spawn(self.session.clone().run_keep_alive(shutdown_rx.clone())),
            tokio::spawn(self.limiters.clone().run_sweeper(shutdown_rx)),
        ];
        BackgroundTasks {
            shutdown_tx,
            handles,
        }
    }

    /// Best-effort remote logout.
    pub async fn logout(&self) -> Result<()> {
        self.session.logout().await
    }

    /// Get metrics for logging/monitoring.
    pub fn metrics(&self) -> DispatchMetrics {
        DispatchMetrics {
            calls: self.calls.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            session_status: self.session.status(),
            rate_limits: self.limiters.metrics(),
        }
    }
}

/// Dispatcher counters.
#[derive(Debug, Clone)]
pub struct DispatchMetrics {
    pub calls: u64,
    pub failures: u64,
    pub session_status: SessionStatus,
    pub rate_limits: RateLimitMetrics,
}

/// Handle to the background tasks. Stop them together with
/// [`shutdown`](Self::shutdown).
#[derive(Debug)]
pub struct BackgroundTasks {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Signal both loops and wait for them to finish. In-flight foreground
    /// calls are not affected.
    pub async fn shutdown(self) {
        // Err only means both loops already exited.
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(target: targets::DISPATCH, error = %e, "Background task ended abnormally");
            }
        }
        debug!(target: targets::DISPATCH, "Background tasks stopped");
    }

    pub fn is_finished(&self) -> bool {
        self.handles.iter().all(|h| h.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::tests::fakes::{ScriptedAuth, ScriptedRemote};

    fn dispatcher() -> (Dispatcher, Arc<ScriptedRemote>, Arc<ScriptedAuth>) {
        let remote = Arc::new(ScriptedRemote::new());
        let auth = Arc::new(ScriptedAuth::new());
        let config = GateConfig {
            credentials: Credentials::new("user", "pw", "key"),
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(&config, remote.clone(), auth.clone()).unwrap();
        (dispatcher, remote, auth)
    }

    #[test]
    fn test_scopes_for_market_book() {
        let params = OperationParams::default().with_market_ids(["1.2", "1.1", "1.2"]);
        assert_eq!(
            Dispatcher::scopes(OperationKind::ListMarketBook, &params),
            vec![
                RateScope::GeneralOperation,
                RateScope::resource("1.1"),
                RateScope::resource("1.2"),
            ]
        );
        assert_eq!(
            Dispatcher::scopes(OperationKind::ListMarketCatalogue, &params),
            vec![RateScope::GeneralOperation]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_logs_in_lazily_and_passes_token() {
        let (dispatcher, remote, auth) = dispatcher();
        let response = dispatcher
            .call(OperationKind::ListEventTypes, &OperationParams::default())
            .await
            .unwrap();
        assert_eq!(response, serde_json::json!({ "ok": true }));
        assert_eq!(auth.login_calls(), 1);
        assert_eq!(remote.tokens(), vec!["token-1".to_string()]);

        let metrics = dispatcher.metrics();
        assert_eq!(metrics.calls, 1);
        assert_eq!(metrics.failures, 0);
        assert_eq!(metrics.session_status, SessionStatus::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_market_book_creates_resource_limiters() {
        let (dispatcher, _remote, _auth) = dispatcher();
        let params = OperationParams::default().with_market_ids(["1.1", "1.2"]);
        dispatcher
            .call(OperationKind::ListMarketBook, &params)
            .await
            .unwrap();
        assert!(dispatcher.limiters().has_resource_limiter("1.1"));
        assert!(dispatcher.limiters().has_resource_limiter("1.2"));
        assert_eq!(dispatcher.metrics().rate_limits.resource_limiters, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_parameter_never_reaches_network() {
        let (dispatcher, remote, auth) = dispatcher();
        let params = OperationParams::default().with_price_projection(["EX_EVERYTHING"]);
        let err = dispatcher
            .call(OperationKind::ListMarketBook, &params.with_market_ids(["1.1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedParameter { .. }));
        assert_eq!(remote.call_count(), 0);
        assert_eq!(auth.login_calls(), 0);
        assert_eq!(dispatcher.metrics().failures, 1);
    }

    #[test]
    fn test_new_rejects_config_that_would_stall_background_tasks() {
        let remote = Arc::new(ScriptedRemote::new());
        let auth = Arc::new(ScriptedAuth::new());
        let mut config = GateConfig {
            credentials: Credentials::new("user", "pw", "key"),
            ..Default::default()
        };
        config.session.keep_alive_interval_secs = 0;
        let err = Dispatcher::new(&config, remote.clone(), auth.clone()).err();
        assert!(matches!(err, Some(Error::Config(_))));

        config.session.keep_alive_interval_secs = 60;
        config.rate_limits.per_resource.capacity = 0;
        let err = Dispatcher::new(&config, remote, auth).err();
        assert!(matches!(err, Some(Error::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_tasks_shut_down_together() {
        let (dispatcher, _remote, _auth) = dispatcher();
        let tasks = dispatcher.start_background();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!tasks.is_finished());
        tasks.shutdown().await;
    }
}
