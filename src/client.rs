//! Remote-poll client for the hosted LetsPing API.
//!
//! Submits an ask over HTTPS, then polls its status with backoff until a
//! reviewer decides or the local deadline passes.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::config::Config;
use crate::errors::{LetsPingError, Result};
use crate::models::ask::REQUEST_ID_PREFIX;
use crate::models::decision::StatusResponse;
use crate::models::{AskRequest, Decision, Priority};
use crate::poller::{poll_until_decided, BackoffConfig};
use crate::protocol::DecisionChannel;

pub const DEFAULT_BASE_URL: &str = "https://letsping.co/api";

const SDK_NAME: &str = "rust";
const DEFAULT_DESCRIPTION: &str = "Incoming AI Agent Request";

/// Which pair of hosted endpoints the client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApiFlavor {
    /// `POST /ingest` + `GET /status/{id}`.
    #[default]
    Ingest,
    /// `POST /ask` + `GET /requests/{id}`.
    Ask,
}

impl ApiFlavor {
    pub fn submit_path(self) -> &'static str {
        match self {
            ApiFlavor::Ingest => "/ingest",
            ApiFlavor::Ask => "/ask",
        }
    }

    pub fn status_path(self, request_id: &str) -> String {
        let id = urlencoding::encode(request_id);
        match self {
            ApiFlavor::Ingest => format!("/status/{}", id),
            ApiFlavor::Ask => format!("/requests/{}", id),
        }
    }

    /// How long a blocking ask waits when the caller gives no timeout.
    pub fn default_timeout(self) -> Duration {
        match self {
            ApiFlavor::Ingest => Duration::from_secs(24 * 60 * 60),
            ApiFlavor::Ask => Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub base_url: String,
    pub flavor: ApiFlavor,
    pub backoff: BackoffConfig,
    /// Per-HTTP-call timeout, distinct from the overall decision wait.
    pub request_timeout: Duration,
    /// Overrides the flavour's default decision wait.
    pub default_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            flavor: ApiFlavor::default(),
            backoff: BackoffConfig::default(),
            request_timeout: Duration::from_secs(30),
            default_timeout: None,
        }
    }
}

impl ClientOptions {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_flavor(mut self, flavor: ApiFlavor) -> Self {
        self.flavor = flavor;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    id: Option<String>,
}

/// Hosted-API client. Cheap to clone; clones share one connection pool.
#[derive(Clone)]
pub struct LetsPing {
    http: Client,
    base_url: String,
    options: ClientOptions,
}

impl LetsPing {
    pub fn new(api_key: &str) -> Result<Self> {
        Self::with_options(api_key, ClientOptions::default())
    }

    pub fn with_options(api_key: &str, options: ClientOptions) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(LetsPingError::Configuration(
                "missing API key, set LETSPING_API_KEY".into(),
            ));
        }

        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|_| LetsPingError::Configuration("API key is not a valid header value".into()))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("letsping-rust/", env!("CARGO_PKG_VERSION"))),
        );

        let http = Client::builder()
            .default_headers(headers)
            .timeout(options.request_timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| LetsPingError::Configuration(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: options.base_url.trim_end_matches('/').to_string(),
            options,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let options = ClientOptions::default().with_base_url(cfg.base_url.clone());
        Self::with_options(cfg.require_api_key()?, options)
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        requested
            .or(self.options.default_timeout)
            .unwrap_or_else(|| self.options.flavor.default_timeout())
    }

    fn submit_body(&self, ask: &AskRequest) -> Result<Value> {
        match self.options.flavor {
            ApiFlavor::Ingest => {
                let mut body = serde_json::to_value(ask)?;
                if let Value::Object(map) = &mut body {
                    let metadata = map
                        .entry("metadata")
                        .or_insert_with(|| Value::Object(Map::new()));
                    if let Value::Object(meta) = metadata {
                        meta.insert("sdk".into(), Value::String(SDK_NAME.into()));
                    }
                }
                Ok(body)
            }
            ApiFlavor::Ask => Ok(json!({
                "id": ask.id,
                "channel": ask.service,
                "action": ask.action,
                "payload": ask.payload,
                "priority": ask.priority,
                "description": ask.description.as_deref().unwrap_or(DEFAULT_DESCRIPTION),
                "timeout": ask.timeout,
            })),
        }
    }

    /// Submits the ask without waiting for a decision.
    pub async fn defer(&self, ask: &AskRequest) -> Result<String> {
        ask.validate()?;
        ask.check_schema();

        let mut ask = ask.clone();
        let local_id = ask.ensure_id(REQUEST_ID_PREFIX);
        let body = self.submit_body(&ask)?;

        let resp = self
            .http
            .post(self.url(self.options.flavor.submit_path()))
            .json(&body)
            .send()
            .await?;
        let resp = check_status(resp, &local_id).await?;

        let accepted: SubmitResponse = resp.json().await?;
        let id = accepted.id.unwrap_or(local_id);
        info!(request_id = %id, service = %ask.service_name(), action = %ask.action, "ask submitted");
        Ok(id)
    }

    /// Single status fetch.
    pub async fn get_status(&self, request_id: &str) -> Result<Decision> {
        let resp = self
            .http
            .get(self.url(&self.options.flavor.status_path(request_id)))
            .send()
            .await?;
        let resp = check_status(resp, request_id).await?;
        let status: StatusResponse = resp.json().await?;
        Ok(status.into_decision(request_id))
    }

    /// Waits on an already submitted ask. `timeout` defaults to the
    /// flavour's default wait.
    pub async fn wait(&self, request_id: &str, timeout: Option<Duration>) -> Result<Decision> {
        let timeout = self.effective_timeout(timeout);
        debug!(request_id = %request_id, timeout_secs = timeout.as_secs(), "waiting for decision");
        let decision = poll_until_decided(request_id, timeout, &self.options.backoff, || {
            self.get_status(request_id)
        })
        .await?;
        let server_payload = decision.payload.clone();
        Ok(decision.with_original_payload(server_payload.as_ref()))
    }

    /// Submits the ask; returns as soon as it is accepted, with a PENDING
    /// decision carrying the assigned id.
    pub async fn ask_nonblocking(&self, ask: &AskRequest) -> Result<Decision> {
        let id = self.defer(ask).await?;
        Ok(Decision::pending(id))
    }

    /// Wraps this client as an agent tool that gates `action` on `service`.
    pub fn tool(&self, service: impl Into<String>, action: impl Into<String>) -> ApprovalTool {
        ApprovalTool {
            client: self.clone(),
            service: service.into(),
            action: action.into(),
            priority: Priority::High,
        }
    }
}

async fn check_status(resp: Response, request_id: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(LetsPingError::Authentication),
        StatusCode::NOT_FOUND => Err(LetsPingError::NotFound {
            id: request_id.to_string(),
        }),
        StatusCode::TOO_MANY_REQUESTS => Err(LetsPingError::RateLimited),
        _ => {
            let text = resp.text().await.unwrap_or_default();
            Err(LetsPingError::Api {
                status: status.as_u16(),
                message: error_message(&text, status),
            })
        }
    }
}

/// Pulls `message` or `error` out of a JSON error body, else the raw text.
fn error_message(body: &str, status: StatusCode) -> String {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) {
        for key in ["message", "error"] {
            if let Some(Value::String(msg)) = map.get(key) {
                return msg.clone();
            }
        }
    }
    if body.trim().is_empty() {
        status
            .canonical_reason()
            .unwrap_or("unexpected response")
            .to_string()
    } else {
        body.trim().to_string()
    }
}

#[async_trait]
impl DecisionChannel for LetsPing {
    async fn submit(&self, ask: &AskRequest) -> Result<String> {
        self.defer(ask).await
    }

    async fn fetch_status(&self, request_id: &str) -> Result<Decision> {
        self.get_status(request_id).await
    }

    async fn ask(&self, ask: AskRequest) -> Result<Decision> {
        let id = self.defer(&ask).await?;
        let decision = self.wait(&id, ask.timeout_duration()).await?;
        Ok(decision.with_original_payload(ask.payload.as_ref()))
    }
}

/// Gate an agent tool call on human approval. The result is always a
/// string so it can be handed straight back to the agent.
#[derive(Clone)]
pub struct ApprovalTool {
    client: LetsPing,
    service: String,
    action: String,
    priority: Priority,
}

impl ApprovalTool {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Runs one ask built from `context` (JSON if it parses as an object,
    /// else `{"raw_context": context}`) and renders the outcome.
    pub async fn call(&self, context: &str) -> String {
        let payload = match serde_json::from_str::<Value>(context) {
            Ok(v @ Value::Object(_)) => v,
            _ => json!({ "raw_context": context }),
        };
        let ask = AskRequest::new(self.service.clone(), self.action.clone(), payload)
            .with_priority(self.priority);

        match self.client.ask(ask).await {
            Ok(decision) if decision.is_approved() => {
                let payload = decision.payload.unwrap_or_else(|| json!({}));
                serde_json::to_string(&payload).unwrap_or_else(|e| format!("ERROR: {}", e))
            }
            Ok(decision) => format!(
                "ACTION_REJECTED: {}",
                decision.reason.as_deref().unwrap_or("no reason given")
            ),
            Err(e) => format!("ERROR: {}", e),
        }
    }
}
