use std::time::Duration;

use thiserror::Error;

/// Main error type surfaced by the gate.
///
/// The first six variants are the outcomes a caller of
/// [`Dispatcher::call`](crate::Dispatcher::call) can observe. Everything the
/// remote API throws at us is either recovered internally (session expiry,
/// throttling, transient faults) or folded into one of them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Request cost exceeds the per-request weight budget.
    /// Never retried; the caller must shrink the request.
    #[error("{operation} weight ({cost}) exceeds maximum allowed ({budget}); reduce the number of markets or requested data fields")]
    CostExceeded {
        operation: String,
        cost: u32,
        budget: u32,
    },

    /// A projection or parameter the operation does not accept.
    #[error("{operation} does not support parameter {parameter}")]
    UnsupportedParameter {
        operation: String,
        parameter: String,
    },

    /// Retry budget exhausted while the remote kept throttling or failing
    /// transiently. The caller may try again later.
    #[error("retry budget exhausted after {attempts} attempts (last error: {last_code})")]
    RateLimitExceededPermanently { attempts: u32, last_code: String },

    /// Credentials rejected or re-login failed. Operator action required.
    #[error("session invalid: {0}")]
    SessionInvalid(String),

    /// Remote business error, passed through verbatim.
    #[error("remote error {code}: {message}")]
    Fatal { code: String, message: String },

    /// Overall deadline exceeded while waiting on permits, backoff or network.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid or incomplete configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem error (config or credential files)
    #[error("io error: {0}")]
    Io(String),

    /// Transport-level failure outside the retry path (client construction etc.)
    #[error("http error: {0}")]
    Http(String),

    /// JSON parse error
    #[error("json parse error: {0}")]
    JsonParse(String),
}

// Convenience constructors for common error patterns
impl Error {
    pub fn cost_exceeded(operation: impl Into<String>, cost: u32, budget: u32) -> Self {
        Error::CostExceeded {
            operation: operation.into(),
            cost,
            budget,
        }
    }

    pub fn unsupported(operation: impl Into<String>, parameter: impl Into<String>) -> Self {
        Error::UnsupportedParameter {
            operation: operation.into(),
            parameter: parameter.into(),
        }
    }

    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Fatal {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn session_invalid(msg: impl Into<String>) -> Self {
        Error::SessionInvalid(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::JsonParse(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
