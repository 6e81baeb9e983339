//! HTTP transport for the identity SSO and JSON-RPC endpoints.
//!
//! A thin adapter: it shapes requests, and on failure extracts the status,
//! `Retry-After` and exception error code into a [`RawFailure`]. Result
//! payloads are passed back untouched.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, RETRY_AFTER};
use reqwest::{Client, Identity, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::{Credentials, EndpointConfig};
use crate::remote::{AuthApi, OperationKind, OperationParams, RawFailure, RawResponse, RemoteApi};
use crate::{Error, Result};

const APPLICATION_HEADER: &str = "x-application";
const AUTHENTICATION_HEADER: &str = "x-authentication";
const SUCCESS: &str = "SUCCESS";

/// Identity SSO reply (`/login`, `/keepAlive`, `/logout`).
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct IdentityResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<String>,
    // certlogin uses different field names
    #[serde(default)]
    session_token: Option<String>,
    #[serde(default)]
    login_status: Option<String>,
}

impl IdentityResponse {
    fn status(&self) -> &str {
        self.status
            .as_deref()
            .or(self.login_status.as_deref())
            .unwrap_or("")
    }

    fn into_token(self) -> std::result::Result<String, RawFailure> {
        if self.status() != SUCCESS {
            return Err(self.failure());
        }
        self.token
            .or(self.session_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RawFailure::api("UNKNOWN", "login succeeded without a token"))
    }

    fn into_unit(self) -> std::result::Result<(), RawFailure> {
        if self.status() != SUCCESS {
            return Err(self.failure());
        }
        Ok(())
    }

    fn failure(&self) -> RawFailure {
        // certlogin reports the reason in loginStatus itself
        let code = self
            .error
            .clone()
            .filter(|e| !e.is_empty())
            .or_else(|| self.login_status.clone())
            .unwrap_or_else(|| "UNKNOWN".to_string());
        RawFailure::api(code, format!("identity request failed: {}", self.status()))
    }
}

/// reqwest-backed [`RemoteApi`] and [`AuthApi`].
#[derive(Debug)]
pub struct BetfairHttpClient {
    client: Client,
    /// Client carrying the TLS identity, for certificate login
    cert_client: Option<Client>,
    endpoints: EndpointConfig,
    app_key: String,
}

impl BetfairHttpClient {
    pub fn new(credentials: &Credentials, endpoints: EndpointConfig) -> Result<Self> {
        let timeout = Duration::from_millis(endpoints.request_timeout_ms);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        let cert_client = match (&credentials.cert_file, &credentials.key_file) {
            (Some(cert), Some(key)) => {
                credentials.verify_key_permissions()?;
                let mut pem = std::fs::read(cert)?;
                pem.push(b'\n');
                pem.extend(std::fs::read(key)?);
                let identity = Identity::from_pem(&pem).map_err(|e| Error::Http(e.to_string()))?;
                Some(
                    Client::builder()
                        .timeout(timeout)
                        .identity(identity)
                        .build()
                        .map_err(|e| Error::Http(e.to_string()))?,
                )
            }
            _ => None,
        };

        Ok(Self {
            client,
            cert_client,
            endpoints,
            app_key: credentials.app_key.clone(),
        })
    }

    fn headers(&self, session_token: Option<&str>) -> std::result::Result<HeaderMap, RawFailure> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(APPLICATION_HEADER, header_value(&self.app_key)?);
        if let Some(token) = session_token {
            headers.insert(AUTHENTICATION_HEADER, header_value(token)?);
        }
        Ok(headers)
    }

    async fn identity_call(
        &self,
        path: &str,
        session_token: &str,
    ) -> std::result::Result<IdentityResponse, RawFailure> {
        let url = format!("{}/{path}", self.endpoints.identity_url);
        let response = self
            .client
            .post(&url)
            .headers(self.headers(Some(session_token))?)
            .send()
            .await
            .map_err(transport_failure)?;
        read_identity(response).await
    }
}

fn header_value(value: &str) -> std::result::Result<HeaderValue, RawFailure> {
    HeaderValue::from_str(value)
        .map_err(|e| RawFailure::api("INVALID_HEADER", format!("unusable header value: {e}")))
}

fn transport_failure(e: reqwest::Error) -> RawFailure {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        RawFailure::network(e.to_string())
    } else {
        RawFailure {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
            ..Default::default()
        }
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

async fn read_identity(response: Response) -> std::result::Result<IdentityResponse, RawFailure> {
    let status = response.status().as_u16();
    let hint = retry_after(response.headers());
    let text = response.text().await.map_err(transport_failure)?;
    if status >= 400 {
        let mut failure = RawFailure::http(status, text);
        failure.retry_after = hint;
        return Err(failure);
    }
    serde_json::from_str(&text)
        .map_err(|e| RawFailure::api("UNKNOWN", format!("unreadable identity response: {e}")))
}

/// JSON-RPC method for an operation.
pub fn rpc_method(kind: OperationKind) -> String {
    let service = if kind.is_account() {
        "AccountAPING"
    } else {
        "SportsAPING"
    };
    format!("{service}/v1.0/{}", kind.method())
}

/// JSON-RPC `params` object for an operation.
pub fn rpc_params(kind: OperationKind, params: &OperationParams) -> Value {
    let filter = if params.filter.is_null() {
        json!({})
    } else {
        params.filter.clone()
    };

    let mut out = serde_json::Map::new();
    match kind {
        OperationKind::ListMarketBook => {
            out.insert("marketIds".into(), json!(params.market_ids));
            if !params.price_projection.is_empty() {
                out.insert(
                    "priceProjection".into(),
                    json!({ "priceData": params.price_projection }),
                );
            }
            if let Some(order) = &params.order_projection {
                out.insert("orderProjection".into(), json!(order));
            }
            if let Some(matched) = &params.match_projection {
                out.insert("matchProjection".into(), json!(matched));
            }
        }
        OperationKind::ListMarketCatalogue => {
            let mut filter = filter;
            if let (false, Value::Object(map)) = (params.market_ids.is_empty(), &mut filter) {
                map.insert("marketIds".into(), json!(params.market_ids));
            }
            out.insert("filter".into(), filter);
            out.insert(
                "maxResults".into(),
                json!(params
                    .max_results
                    .unwrap_or(params.market_ids.len() as u32)),
            );
            if !params.market_projection.is_empty() {
                out.insert("marketProjection".into(), json!(params.market_projection));
            }
        }
        OperationKind::ListEventTypes | OperationKind::ListCompetitions | OperationKind::ListEvents => {
            out.insert("filter".into(), filter);
        }
        OperationKind::GetAccountFunds | OperationKind::GetAccountDetails => {}
    }
    Value::Object(out)
}

/// Split a JSON-RPC reply into its result or a failure.
pub fn parse_rpc_response(
    status: u16,
    body: &str,
    hint: Option<Duration>,
) -> std::result::Result<RawResponse, RawFailure> {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    // Batch replies come back as a one-element array
    let reply = match parsed {
        Some(Value::Array(mut items)) if !items.is_empty() => Some(items.swap_remove(0)),
        other => other,
    };

    if let Some(reply) = &reply {
        if let Some(error) = reply.get("error") {
            let data = error.get("data");
            let code = data
                .and_then(|d| {
                    d.get("APINGException")
                        .or_else(|| d.get("AccountAPINGException"))
                })
                .and_then(|e| e.get("errorCode"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Err(RawFailure {
                status: (status >= 400).then_some(status),
                code,
                message,
                retry_after: hint,
                network: false,
            });
        }
    }

    if status >= 400 {
        let mut failure = RawFailure::http(status, body.to_string());
        failure.retry_after = hint;
        return Err(failure);
    }

    match reply.and_then(|r| r.get("result").cloned()) {
        Some(result) => Ok(result),
        None => Err(RawFailure::api(
            "UNKNOWN",
            "JSON-RPC reply carried neither result nor error",
        )),
    }
}

#[async_trait]
impl AuthApi for BetfairHttpClient {
    async fn login(&self, credentials: &Credentials) -> std::result::Result<String, RawFailure> {
        let form = [
            ("username", credentials.username.as_str()),
            ("password", credentials.password.as_str()),
        ];
        let (client, url) = match &self.cert_client {
            Some(cert_client) => (
                cert_client,
                format!("{}/certlogin", self.endpoints.identity_cert_url),
            ),
            None => (&self.client, format!("{}/login", self.endpoints.identity_url)),
        };
        debug!(certificate = self.cert_client.is_some(), "Sending login request");

        let response = client
            .post(&url)
            .headers(self.headers(None)?)
            .form(&form)
            .send()
            .await
            .map_err(transport_failure)?;
        read_identity(response).await?.into_token()
    }

    async fn keep_alive(&self, session_token: &str) -> std::result::Result<(), RawFailure> {
        self.identity_call("keepAlive", session_token)
            .await?
            .into_unit()
    }

    async fn logout(&self, session_token: &str) -> std::result::Result<(), RawFailure> {
        self.identity_call("logout", session_token).await?.into_unit()
    }
}

#[async_trait]
impl RemoteApi for BetfairHttpClient {
    async fn invoke(
        &self,
        kind: OperationKind,
        params: &OperationParams,
        session_token: &str,
    ) -> std::result::Result<RawResponse, RawFailure> {
        let url = if kind.is_account() {
            &self.endpoints.account_url
        } else {
            &self.endpoints.betting_url
        };
        let body = json!({
            "jsonrpc": "2.0",
            "method": rpc_method(kind),
            "params": rpc_params(kind, params),
            "id": 1,
        });

        let response = self
            .client
            .post(url)
            .headers(self.headers(Some(session_token))?)
            .json(&body)
            .send()
            .await
            .map_err(transport_failure)?;

        let status = response.status().as_u16();
        let hint = retry_after(response.headers());
        let text = response.text().await.map_err(transport_failure)?;
        parse_rpc_response(status, &text, hint)
    }
}
