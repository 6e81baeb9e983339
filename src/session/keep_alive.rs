use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::manager::SessionManager;
use super::state::SessionStatus;
use crate::classify::{classify, ErrorVerdict};
use crate::logging::targets;
use crate::rate_limit::RateScope;
use crate::remote::RawFailure;

/// Result of one keep-alive round.
#[derive(Debug, Clone, PartialEq)]
pub enum KeepAliveOutcome {
    /// Session extended
    Refreshed,
    /// No token to refresh
    Skipped,
    /// Remote refused or did not answer; the session is now `Expiring`, or
    /// `Unauthenticated` if the verdict was SessionExpired
    Failed(ErrorVerdict),
}

impl SessionManager {
    /// Refresh the current token through the Login scope.
    pub async fn keep_alive(&self) -> KeepAliveOutcome {
        let _writer = self.writer.lock().await;
        let token = {
            let session = self.read();
            match (&session.token, session.status.has_token()) {
                (Some(token), true) => token.clone(),
                _ => return KeepAliveOutcome::Skipped,
            }
        };

        self.limiters.acquire(&RateScope::Login).await;
        let result = match tokio::time::timeout(self.auth_timeout, self.auth.keep_alive(&token)).await
        {
            Ok(result) => result,
            Err(_) => Err(RawFailure::network("keep-alive timed out")),
        };

        match result {
            Ok(()) => {
                let mut session = self.write();
                if session.holds(&token) {
                    session.status = SessionStatus::Active;
                    session.last_keep_alive = Some(Instant::now());
                }
                drop(session);
                self.keep_alive_failures.store(0, Ordering::Relaxed);
                debug!(target: targets::SESSION, "Keep-alive succeeded");
                KeepAliveOutcome::Refreshed
            }
            Err(failure) => {
                let verdict = classify(&failure);
                let failures = self.keep_alive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if verdict.is_session_expired() {
                    self.expire(&token);
                } else {
                    let mut session = self.write();
                    if session.holds(&token) && session.status == SessionStatus::Active {
                        session.status = SessionStatus::Expiring;
                    }
                }
                warn!(
                    target: targets::SESSION,
                    code = %verdict.code,
                    consecutive_failures = failures,
                    "Keep-alive failed, session expiring"
                );
                KeepAliveOutcome::Failed(verdict)
            }
        }
    }

    /// Background keep-alive. Runs until `shutdown` flips to `true` or its
    /// sender is dropped.
    ///
    /// After `max_keep_alive_failures` consecutive failures the loop re-logs
    /// in itself instead of waiting for the next foreground call.
    pub async fn run_keep_alive(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.keep_alive_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the immediate first tick
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.keep_alive_round().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(target: targets::SESSION, "Keep-alive loop stopped");
                        break;
                    }
                }
            }
        }
    }

    async fn keep_alive_round(&self) {
        if let KeepAliveOutcome::Failed(_) = self.keep_alive().await {
            let failures = self.keep_alive_failures.load(Ordering::Relaxed);
            if failures < self.config.max_keep_alive_failures {
                return;
            }
            if self.status() == SessionStatus::Invalid {
                return;
            }
            info!(
                target: targets::SESSION,
                consecutive_failures = failures,
                "Keep-alive keeps failing, re-logging in"
            );
            if let Err(e) = self.login().await {
                warn!(target: targets::SESSION, error = %e, "Eager re-login failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credentials, RateLimitConfig, RetryConfig, SessionConfig};
    use crate::rate_limit::RateLimiterRegistry;
    use crate::tests::fakes::ScriptedAuth;
    use std::time::Duration;

    fn manager(auth: Arc<ScriptedAuth>) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            Credentials::new("user", "pw", "key"),
            SessionConfig {
                keep_alive_interval_secs: 60,
                max_keep_alive_failures: 3,
            },
            RetryConfig::default(),
            Duration::from_secs(30),
            auth,
            Arc::new(RateLimiterRegistry::new(RateLimitConfig::default())),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_success_records_timestamp() {
        let auth = Arc::new(ScriptedAuth::new());
        let session = manager(auth.clone());
        session.ensure_active().await.unwrap();

        assert_eq!(session.keep_alive().await, KeepAliveOutcome::Refreshed);
        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, SessionStatus::Active);
        assert!(snapshot.last_keep_alive.is_some());
        assert_eq!(auth.keep_alive_tokens(), vec!["token-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_failure_moves_to_expiring() {
        let auth = Arc::new(ScriptedAuth::new());
        auth.push_keep_alive(Err(RawFailure::http(503, "")));
        let session = manager(auth.clone());
        session.ensure_active().await.unwrap();

        assert!(matches!(
            session.keep_alive().await,
            KeepAliveOutcome::Failed(_)
        ));
        assert_eq!(session.status(), SessionStatus::Expiring);
        assert_eq!(session.snapshot().consecutive_keep_alive_failures, 1);

        // Next use re-logs in eagerly
        assert_eq!(session.ensure_active().await.unwrap(), "token-2");
        assert_eq!(session.status(), SessionStatus::Active);
        assert_eq!(session.snapshot().consecutive_keep_alive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_rejected_token_drops_session() {
        let auth = Arc::new(ScriptedAuth::new());
        auth.push_keep_alive(Err(RawFailure::api("NO_SESSION", "")));
        let session = manager(auth.clone());
        session.ensure_active().await.unwrap();

        session.keep_alive().await;
        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, SessionStatus::Unauthenticated);
        assert!(snapshot.token.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_skipped_without_token() {
        let auth = Arc::new(ScriptedAuth::new());
        let session = manager(auth.clone());
        assert_eq!(session.keep_alive().await, KeepAliveOutcome::Skipped);
        assert_eq!(auth.keep_alive_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_relogs_after_repeated_failures() {
        let auth = Arc::new(ScriptedAuth::new());
        for _ in 0..3 {
            auth.push_keep_alive(Err(RawFailure::http(503, "")));
        }
        let session = manager(auth.clone());
        session.ensure_active().await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(session.clone().run_keep_alive(rx));

        // Two failed rounds: still waiting
        tokio::time::sleep(Duration::from_secs(121)).await;
        assert_eq!(auth.keep_alive_calls(), 2);
        assert_eq!(auth.login_calls(), 1);
        assert_eq!(session.status(), SessionStatus::Expiring);

        // Third failure triggers the eager re-login
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(auth.keep_alive_calls(), 3);
        assert_eq!(auth.login_calls(), 2);
        assert_eq!(session.status(), SessionStatus::Active);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_when_sender_dropped() {
        let auth = Arc::new(ScriptedAuth::new());
        let session = manager(auth);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(session.run_keep_alive(rx));
        drop(tx);
        handle.await.unwrap();
    }
}
