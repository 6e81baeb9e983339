use std::fmt;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Session lifecycle.
///
/// ```text
/// Unauthenticated -> Active -> Expiring -> (re-login) -> Active
///        any state -> Invalid   (credentials rejected; terminal until reset)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionStatus {
    #[default]
    Unauthenticated,
    Active,
    /// Keep-alive failed; the next use re-logs in
    Expiring,
    Invalid,
}

impl SessionStatus {
    /// A token exists and may still be accepted by the remote.
    pub fn has_token(&self) -> bool {
        matches!(self, SessionStatus::Active | SessionStatus::Expiring)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Unauthenticated => "unauthenticated",
            SessionStatus::Active => "active",
            SessionStatus::Expiring => "expiring",
            SessionStatus::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

/// The process-wide session. Written only by the session manager.
#[derive(Debug, Clone, Default)]
pub(crate) struct Session {
    pub(crate) token: Option<String>,
    pub(crate) status: SessionStatus,
    pub(crate) issued_at: Option<Instant>,
    pub(crate) issued_at_utc: Option<DateTime<Utc>>,
    pub(crate) last_keep_alive: Option<Instant>,
}

impl Session {
    pub(crate) fn activate(&mut self, token: String) {
        let now = Instant::now();
        self.token = Some(token);
        self.status = SessionStatus::Active;
        self.issued_at = Some(now);
        self.issued_at_utc = Some(Utc::now());
        self.last_keep_alive = None;
    }

    /// Drop the token and fall back to `status`.
    pub(crate) fn clear(&mut self, status: SessionStatus) {
        self.token = None;
        self.status = status;
        self.issued_at = None;
        self.issued_at_utc = None;
        self.last_keep_alive = None;
    }

    pub(crate) fn holds(&self, token: &str) -> bool {
        self.token.as_deref() == Some(token)
    }
}

/// Point-in-time view of the session.
///
/// Valid only at the instant it was read: a concurrent keep-alive failure or
/// foreground expiry can change it right after.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub token: Option<String>,
    pub status: SessionStatus,
    pub issued_at: Option<Instant>,
    /// Wall-clock issuance time, for display
    pub issued_at_utc: Option<DateTime<Utc>>,
    pub last_keep_alive: Option<Instant>,
    pub consecutive_keep_alive_failures: u32,
}

impl SessionSnapshot {
    /// Token, if the status says it is usable.
    pub fn usable_token(&self) -> Option<&str> {
        if self.status.has_token() {
            self.token.as_deref()
        } else {
            None
        }
    }
}
