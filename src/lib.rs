#![deny(unreachable_pub)]

// Core modules
mod errors;
pub mod classify;
pub mod config;
pub mod logging;
pub mod rate_limit;
pub mod remote;
pub mod retry;
pub mod session;
pub mod weight;

// Facade and transport
mod dispatcher;
pub mod http;

#[cfg(test)]
mod tests;

// Re-exports
pub use classify::{classify, ErrorKind, ErrorVerdict, RetryPolicy};
pub use config::{
    BucketConfig, Credentials, DispatchConfig, EndpointConfig, GateConfig, RateLimitConfig,
    RetryConfig, SessionConfig, WeightConfig,
};
pub use dispatcher::{BackgroundTasks, DispatchMetrics, Dispatcher};
pub use errors::{Error, Result};
pub use http::BetfairHttpClient;
pub use logging::{init_logging, LogConfig, LogFormat};
pub use rate_limit::{RateLimitMetrics, RateLimiterRegistry, RateScope};
pub use remote::{AuthApi, OperationKind, OperationParams, RawFailure, RawResponse, RemoteApi};
pub use retry::{RetryAttempt, RetryExecutor};
pub use session::{KeepAliveOutcome, SessionManager, SessionSnapshot, SessionStatus};
pub use weight::{OperationCost, WeightValidator};
