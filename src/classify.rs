//! Error classification.
//!
//! Maps a [`RawFailure`] into a closed set of verdicts, each carrying the
//! retry policy the executor applies. The mapping lives in one table,
//! [`CODE_TABLE`]; anything it does not recognise is `Fatal`, so an unknown
//! condition is never retried.

use std::time::Duration;

use crate::remote::RawFailure;

/// Failure classes the retry executor distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Session token invalid or expired
    SessionExpired,
    /// Too many requests / throttled
    RateLimited,
    /// Request exceeds the remote's data budget
    CostExceeded,
    /// Network or server fault likely to clear on its own
    Transient,
    /// Anything else
    Fatal,
}

/// What to do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Re-login, then retry the original operation once
    ReloginThenRetryOnce,
    /// Exponential backoff, retry up to the bound
    Backoff,
    /// Surface immediately
    NoRetry,
}

impl ErrorKind {
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            ErrorKind::SessionExpired => RetryPolicy::ReloginThenRetryOnce,
            ErrorKind::RateLimited | ErrorKind::Transient => RetryPolicy::Backoff,
            ErrorKind::CostExceeded | ErrorKind::Fatal => RetryPolicy::NoRetry,
        }
    }
}

/// Recognised remote error codes.
///
/// Order matters when a code is found by scanning a free-form message:
/// the first entry contained in the message wins.
pub const CODE_TABLE: &[(&str, ErrorKind)] = &[
    ("INVALID_SESSION_TOKEN", ErrorKind::SessionExpired),
    ("INVALID_SESSION_INFORMATION", ErrorKind::SessionExpired),
    ("NO_SESSION", ErrorKind::SessionExpired),
    ("SESSION_EXPIRED", ErrorKind::SessionExpired),
    ("TEMPORARY_BAN_TOO_MANY_REQUESTS", ErrorKind::RateLimited),
    ("TOO_MANY_REQUESTS", ErrorKind::RateLimited),
    ("THROTTLED", ErrorKind::RateLimited),
    ("EXCEEDED_THROTTLE", ErrorKind::RateLimited),
    ("TOO_MUCH_DATA", ErrorKind::CostExceeded),
    ("SERVICE_BUSY", ErrorKind::Transient),
    ("TIMEOUT_ERROR", ErrorKind::Transient),
    ("SERVICE_UNAVAILABLE", ErrorKind::Transient),
];

/// HTTP statuses recognised when the failure has no structured code.
const RATE_LIMITED_STATUS: u16 = 429;
const TRANSIENT_STATUSES: &[u16] = &[500, 502, 503, 504];

/// Classification of one failed call. Ephemeral, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorVerdict {
    pub kind: ErrorKind,
    /// Server-suggested wait, if any
    pub backoff_hint: Option<Duration>,
    /// Code that drove the decision (or the status/`UNKNOWN` fallback)
    pub code: String,
    pub message: String,
}

impl ErrorVerdict {
    pub fn retry_policy(&self) -> RetryPolicy {
        self.kind.retry_policy()
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self.kind, ErrorKind::SessionExpired)
    }

    /// Returns true if this verdict is retried with backoff.
    pub fn should_backoff(&self) -> bool {
        matches!(self.retry_policy(), RetryPolicy::Backoff)
    }
}

fn lookup_code(code: &str) -> Option<ErrorKind> {
    let upper = code.trim().to_ascii_uppercase();
    CODE_TABLE
        .iter()
        .find(|(known, _)| *known == upper)
        .map(|(_, kind)| *kind)
}

fn scan_message(message: &str) -> Option<(&'static str, ErrorKind)> {
    let upper = message.to_ascii_uppercase();
    CODE_TABLE
        .iter()
        .find(|(known, _)| upper.contains(known))
        .copied()
}

/// Classify a raw failure. Total and deterministic.
pub fn classify(failure: &RawFailure) -> ErrorVerdict {
    let verdict = |kind: ErrorKind, code: String| ErrorVerdict {
        kind,
        backoff_hint: failure.retry_after,
        code,
        message: failure.message.clone(),
    };

    // A structured code is authoritative when present.
    if let Some(code) = &failure.code {
        if let Some(kind) = lookup_code(code) {
            return verdict(kind, code.trim().to_ascii_uppercase());
        }
    }

    if let Some(status) = failure.status {
        if status == RATE_LIMITED_STATUS {
            return verdict(ErrorKind::RateLimited, failure.code_or_status());
        }
        if TRANSIENT_STATUSES.contains(&status) && failure.code.is_none() {
            return verdict(ErrorKind::Transient, failure.code_or_status());
        }
    }

    if failure.code.is_none() {
        if let Some((code, kind)) = scan_message(&failure.message) {
            return verdict(kind, code.to_string());
        }
        if failure.network {
            return verdict(ErrorKind::Transient, failure.code_or_status());
        }
    }

    verdict(ErrorKind::Fatal, failure.code_or_status())
}
