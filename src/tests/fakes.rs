//! Scripted in-memory stand-ins for the remote collaborators.
//!
//! Each fake pops queued outcomes first and falls back to success once the
//! queue is empty. Every call is recorded with its paused-clock timestamp.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::Credentials;
use crate::remote::{AuthApi, OperationKind, OperationParams, RawFailure, RawResponse, RemoteApi};

/// Issues `token-1`, `token-2`, ... unless a scripted outcome is queued.
#[derive(Default)]
pub(crate) struct ScriptedAuth {
    logins: Mutex<VecDeque<Result<String, RawFailure>>>,
    keep_alives: Mutex<VecDeque<Result<(), RawFailure>>>,
    login_calls: AtomicU32,
    logout_calls: AtomicU32,
    keep_alive_tokens: Mutex<Vec<String>>,
}

impl ScriptedAuth {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_login(&self, outcome: Result<String, RawFailure>) {
        self.logins.lock().unwrap().push_back(outcome);
    }

    pub(crate) fn push_keep_alive(&self, outcome: Result<(), RawFailure>) {
        self.keep_alives.lock().unwrap().push_back(outcome);
    }

    pub(crate) fn login_calls(&self) -> u32 {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn logout_calls(&self) -> u32 {
        self.logout_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn keep_alive_calls(&self) -> usize {
        self.keep_alive_tokens.lock().unwrap().len()
    }

    pub(crate) fn keep_alive_tokens(&self) -> Vec<String> {
        self.keep_alive_tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuthApi for ScriptedAuth {
    async fn login(&self, _credentials: &Credentials) -> Result<String, RawFailure> {
        let n = self.login_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let scripted = self.logins.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(format!("token-{n}")))
    }

    async fn keep_alive(&self, session_token: &str) -> Result<(), RawFailure> {
        self.keep_alive_tokens
            .lock()
            .unwrap()
            .push(session_token.to_string());
        let scripted = self.keep_alives.lock().unwrap().pop_front();
        scripted.unwrap_or(Ok(()))
    }

    async fn logout(&self, _session_token: &str) -> Result<(), RawFailure> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One recorded remote invocation.
#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub(crate) kind: OperationKind,
    pub(crate) token: String,
    pub(crate) at: Instant,
}

/// Answers `{"ok": true}` unless a scripted outcome is queued or the token
/// has been marked expired.
#[derive(Default)]
pub(crate) struct ScriptedRemote {
    outcomes: Mutex<VecDeque<Result<RawResponse, RawFailure>>>,
    expired_tokens: Mutex<HashSet<String>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedRemote {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, outcome: Result<RawResponse, RawFailure>) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub(crate) fn push_failures(&self, failure: RawFailure, count: usize) {
        for _ in 0..count {
            self.push(Err(failure.clone()));
        }
    }

    /// Reject `token` with `INVALID_SESSION_TOKEN` from now on.
    pub(crate) fn expire_token(&self, token: &str) {
        self.expired_tokens.lock().unwrap().insert(token.to_string());
    }

    pub(crate) fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn tokens(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.token).collect()
    }
}

#[async_trait]
impl RemoteApi for ScriptedRemote {
    async fn invoke(
        &self,
        kind: OperationKind,
        _params: &OperationParams,
        session_token: &str,
    ) -> Result<RawResponse, RawFailure> {
        self.calls.lock().unwrap().push(RecordedCall {
            kind,
            token: session_token.to_string(),
            at: Instant::now(),
        });
        if self.expired_tokens.lock().unwrap().contains(session_token) {
            return Err(RawFailure::api(
                "INVALID_SESSION_TOKEN",
                "session token is no longer valid",
            ));
        }
        let scripted = self.outcomes.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(serde_json::json!({ "ok": true })))
    }
}
