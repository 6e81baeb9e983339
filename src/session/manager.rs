use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::state::{Session, SessionSnapshot, SessionStatus};
use crate::config::{Credentials, RetryConfig, SessionConfig};
use crate::logging::targets;
use crate::rate_limit::{RateLimiterRegistry, RateScope};
use crate::retry::{RetryAttempt, RetryExecutor};
use crate::remote::AuthApi;
use crate::{Error, Result};

/// Owns the single process-wide [`Session`].
///
/// Readers take a snapshot from the `RwLock`. Every transition (login,
/// keep-alive, expiry, logout, reset) runs while holding `writer`, so there
/// is exactly one writer at a time and concurrent re-logins collapse.
pub struct SessionManager {
    credentials: Credentials,
    pub(super) config: SessionConfig,
    pub(super) auth: Arc<dyn AuthApi>,
    pub(super) limiters: Arc<RateLimiterRegistry>,
    retry: RetryExecutor,
    /// Deadline for one login (retries included) and one keep-alive call
    pub(super) auth_timeout: Duration,
    state: RwLock<Session>,
    pub(super) writer: Mutex<()>,
    pub(super) keep_alive_failures: AtomicU32,
    logins: AtomicU64,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("credentials", &self.credentials)
            .field("config", &self.config)
            .field("status", &self.status())
            .finish()
    }
}

impl SessionManager {
    pub fn new(
        credentials: Credentials,
        config: SessionConfig,
        retry: RetryConfig,
        auth_timeout: Duration,
        auth: Arc<dyn AuthApi>,
        limiters: Arc<RateLimiterRegistry>,
    ) -> Self {
        Self {
            credentials,
            config,
            auth,
            limiters,
            retry: RetryExecutor::new(retry),
            auth_timeout,
            state: RwLock::new(Session::default()),
            writer: Mutex::new(()),
            keep_alive_failures: AtomicU32::new(0),
            logins: AtomicU64::new(0),
        }
    }

    pub(super) fn read(&self) -> RwLockReadGuard<'_, Session> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(super) fn write(&self) -> RwLockWriteGuard<'_, Session> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Current token plus status. Re-check before use; it may change
    /// concurrently.
    pub fn snapshot(&self) -> SessionSnapshot {
        let session = self.read();
        SessionSnapshot {
            token: session.token.clone(),
            status: session.status,
            issued_at: session.issued_at,
            issued_at_utc: session.issued_at_utc,
            last_keep_alive: session.last_keep_alive,
            consecutive_keep_alive_failures: self.keep_alive_failures.load(Ordering::Relaxed),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.read().status
    }

    /// Successful logins over the manager's lifetime.
    pub fn login_count(&self) -> u64 {
        self.logins.load(Ordering::Relaxed)
    }

    /// A token to use right now, logging in first if there is none or the
    /// last keep-alive failed.
    pub async fn ensure_active(&self) -> Result<String> {
        if let Some(token) = self.active_token()? {
            return Ok(token);
        }

        let _writer = self.writer.lock().await;
        // Another caller may have logged in while we queued.
        if let Some(token) = self.active_token()? {
            return Ok(token);
        }
        self.login_locked().await
    }

    fn active_token(&self) -> Result<Option<String>> {
        let session = self.read();
        match session.status {
            SessionStatus::Active => Ok(session.token.clone()),
            SessionStatus::Invalid => Err(invalid_error()),
            SessionStatus::Unauthenticated | SessionStatus::Expiring => Ok(None),
        }
    }

    /// Log in unconditionally, replacing any current token.
    pub async fn login(&self) -> Result<String> {
        let _writer = self.writer.lock().await;
        if self.status() == SessionStatus::Invalid {
            return Err(invalid_error());
        }
        self.login_locked().await
    }

    /// Handle a SessionExpired verdict for `failed_token`.
    ///
    /// The session drops to `Unauthenticated` at once. Concurrent callers
    /// reporting the same token share one login: whoever gets the writer
    /// lock first re-logs in, the rest pick up the new token.
    pub async fn recover(&self, failed_token: &str) -> Result<String> {
        self.expire(failed_token);

        let _writer = self.writer.lock().await;
        {
            let session = self.read();
            match session.status {
                SessionStatus::Invalid => return Err(invalid_error()),
                SessionStatus::Active => {
                    if let Some(token) = &session.token {
                        if token != failed_token {
                            return Ok(token.clone());
                        }
                    }
                }
                SessionStatus::Unauthenticated | SessionStatus::Expiring => {}
            }
        }
        self.login_locked().await
    }

    /// Active/Expiring -> Unauthenticated if `token` is still the current one.
    pub(super) fn expire(&self, token: &str) {
        let mut session = self.write();
        if session.holds(token) && session.status.has_token() {
            session.clear(SessionStatus::Unauthenticated);
            drop(session);
            warn!(target: targets::SESSION, "Session expired, token dropped");
        }
    }

    /// Perform the login. Caller holds `writer`.
    pub(super) async fn login_locked(&self) -> Result<String> {
        let deadline = Instant::now() + self.auth_timeout;
        let attempt = RetryAttempt::new("login", deadline);

        let outcome = self
            .retry
            .execute(attempt, move |_| async move {
                self.limiters.acquire(&RateScope::Login).await;
                Ok::<_, Error>(self.auth.login(&self.credentials).await)
            })
            .await;

        match outcome {
            Ok(token) => {
                self.write().activate(token.clone());
                self.keep_alive_failures.store(0, Ordering::Relaxed);
                let logins = self.logins.fetch_add(1, Ordering::Relaxed) + 1;
                info!(
                    target: targets::SESSION,
                    logins,
                    certificate = self.credentials.uses_certificate(),
                    "Logged in"
                );
                Ok(token)
            }
            Err(Error::Fatal { code, message }) => {
                self.write().clear(SessionStatus::Invalid);
                error!(
                    target: targets::SESSION,
                    code = %code,
                    message = %message,
                    "Login rejected, session invalid until reset"
                );
                Err(Error::session_invalid(format!("login rejected: {code}")))
            }
            Err(Error::SessionInvalid(reason)) => {
                self.write().clear(SessionStatus::Invalid);
                error!(target: targets::SESSION, reason = %reason, "Login rejected, session invalid until reset");
                Err(Error::SessionInvalid(reason))
            }
            Err(e) => {
                warn!(target: targets::SESSION, error = %e, "Login failed");
                Err(e)
            }
        }
    }

    /// Best-effort remote logout, then drop the token.
    pub async fn logout(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        let token = self.read().token.clone();
        let Some(token) = token else {
            return Ok(());
        };

        self.limiters.acquire(&RateScope::Login).await;
        match tokio::time::timeout(self.auth_timeout, self.auth.logout(&token)).await {
            Ok(Ok(())) => info!(target: targets::SESSION, "Logged out"),
            Ok(Err(failure)) => {
                warn!(target: targets::SESSION, error = %failure, "Remote logout failed")
            }
            Err(_) => warn!(target: targets::SESSION, "Remote logout timed out"),
        }

        let mut session = self.write();
        if session.status != SessionStatus::Invalid {
            session.clear(SessionStatus::Unauthenticated);
        }
        Ok(())
    }

    /// Operator intervention: `Invalid -> Unauthenticated`. Returns whether
    /// the session was invalid.
    pub async fn reset(&self) -> bool {
        let _writer = self.writer.lock().await;
        let mut session = self.write();
        if session.status != SessionStatus::Invalid {
            return false;
        }
        session.clear(SessionStatus::Unauthenticated);
        self.keep_alive_failures.store(0, Ordering::Relaxed);
        info!(target: targets::SESSION, "Invalid session reset");
        true
    }
}

fn invalid_error() -> Error {
    Error::session_invalid("session is invalid; credentials must be fixed and the session reset")
}
