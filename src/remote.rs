//! Boundary contracts with the remote exchange.
//!
//! The gate never parses business payloads. A remote call either succeeds
//! with an opaque JSON value or fails with a [`RawFailure`] carrying
//! whatever structured code/message the transport could extract.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Credentials;

/// Opaque success payload.
pub type RawResponse = serde_json::Value;

/// Operations the gate knows how to cost and scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    ListEventTypes,
    ListCompetitions,
    ListEvents,
    ListMarketCatalogue,
    ListMarketBook,
    GetAccountFunds,
    GetAccountDetails,
}

impl OperationKind {
    /// Remote method name (JSON-RPC operation).
    pub fn method(&self) -> &'static str {
        match self {
            OperationKind::ListEventTypes => "listEventTypes",
            OperationKind::ListCompetitions => "listCompetitions",
            OperationKind::ListEvents => "listEvents",
            OperationKind::ListMarketCatalogue => "listMarketCatalogue",
            OperationKind::ListMarketBook => "listMarketBook",
            OperationKind::GetAccountFunds => "getAccountFunds",
            OperationKind::GetAccountDetails => "getAccountDetails",
        }
    }

    /// Whether the operation goes to the account API rather than betting.
    pub fn is_account(&self) -> bool {
        matches!(
            self,
            OperationKind::GetAccountFunds | OperationKind::GetAccountDetails
        )
    }

    /// Whether the operation is subject to the market data weight budget.
    pub fn is_market_data(&self) -> bool {
        matches!(
            self,
            OperationKind::ListMarketCatalogue | OperationKind::ListMarketBook
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method())
    }
}

/// Request parameters.
///
/// Only the fields that drive cost and rate scoping are typed; the market
/// filter is forwarded to the remote untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationParams {
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub filter: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub market_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub market_projection: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub price_projection: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_projection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_projection: Option<String>,
}

impl OperationParams {
    pub fn with_filter(mut self, filter: serde_json::Value) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_market_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.market_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_results(mut self, max_results: u32) -> Self {
        self.max_results = Some(max_results);
        self
    }

    pub fn with_market_projection<I, S>(mut self, projection: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.market_projection = projection.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_price_projection<I, S>(mut self, projection: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.price_projection = projection.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_order_projection(mut self, projection: impl Into<String>) -> Self {
        self.order_projection = Some(projection.into());
        self
    }

    pub fn with_match_projection(mut self, projection: impl Into<String>) -> Self {
        self.match_projection = Some(projection.into());
        self
    }
}

/// A failed remote interaction, before classification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFailure {
    /// HTTP status, if the failure came with one
    pub status: Option<u16>,
    /// Structured remote error code (e.g. `INVALID_SESSION_INFORMATION`)
    pub code: Option<String>,
    /// Free-form message
    pub message: String,
    /// Server-suggested wait (`Retry-After`)
    pub retry_after: Option<Duration>,
    /// Connection-level failure (no response at all)
    pub network: bool,
}

impl RawFailure {
    /// Remote API error with a structured code.
    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
            ..Default::default()
        }
    }

    /// HTTP-level error without a structured body.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            ..Default::default()
        }
    }

    /// Connection refused, reset, DNS failure and the like.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            network: true,
            ..Default::default()
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Best identifier for logs and surfaced errors.
    pub fn code_or_status(&self) -> String {
        match (&self.code, self.status) {
            (Some(code), _) => code.clone(),
            (None, Some(status)) => format!("HTTP_{status}"),
            (None, None) if self.network => "NETWORK_ERROR".to_string(),
            (None, None) => "UNKNOWN".to_string(),
        }
    }
}

impl fmt::Display for RawFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code_or_status(), self.message)
    }
}

/// Authenticated data calls.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn invoke(
        &self,
        kind: OperationKind,
        params: &OperationParams,
        session_token: &str,
    ) -> Result<RawResponse, RawFailure>;
}

/// Session issuing and refresh.
#[async_trait]
pub trait AuthApi: Send + Sync {
    /// Exchange credentials for a session token.
    async fn login(&self, credentials: &Credentials) -> Result<String, RawFailure>;

    /// Extend the validity of `session_token`.
    async fn keep_alive(&self, session_token: &str) -> Result<(), RawFailure>;

    /// End the session. Best effort; the default does nothing.
    async fn logout(&self, _session_token: &str) -> Result<(), RawFailure> {
        Ok(())
    }
}
