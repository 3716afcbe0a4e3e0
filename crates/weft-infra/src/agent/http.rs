//! HttpAgentInvoker -- posts agent calls to an HTTP endpoint.
//!
//! The endpoint receives the serialized [`AgentRequest`] and answers with
//! either `{"output": ...}`, `{"tool_error": {"tool": ..., "message": ...}}`
//! or any other JSON value, which is taken as the output itself.
//!
//! Failures are classified here, where the raw status and body are visible.
//! The engine only sees [`AgentError`] variants.

use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use weft_core::agent::invoker::AgentInvoker;
use weft_types::agent::{AgentError, AgentRequest, FatalKind};
use weft_types::config::AgentEndpointConfig;

/// Body fragments that mark a throttling response regardless of status.
const THROTTLE_MARKERS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "quota",
    "throttl",
];

/// Errors building an invoker from configuration.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("no agent endpoint url configured")]
    MissingUrl,

    #[error("environment variable {0} holding the agent api key is not set")]
    MissingApiKey(String),

    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Agent invoker backed by a JSON-over-HTTP endpoint.
///
/// Does not derive Debug: the bearer token must never reach logs.
pub struct HttpAgentInvoker {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpAgentInvoker {
    pub fn new(
        url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, EndpointError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            api_key,
        })
    }

    /// Build from the `[agent]` section of `weft.toml`.
    pub fn from_config(config: &AgentEndpointConfig) -> Result<Self, EndpointError> {
        let url = config.url.clone().ok_or(EndpointError::MissingUrl)?;
        let api_key = match &config.api_key_env {
            Some(var) => Some(
                std::env::var(var).map_err(|_| EndpointError::MissingApiKey(var.clone()))?,
            ),
            None => None,
        };
        Self::new(url, api_key, Duration::from_secs(config.request_timeout_secs))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl AgentInvoker for HttpAgentInvoker {
    async fn invoke(&self, request: &AgentRequest) -> Result<Value, AgentError> {
        let mut builder = self.client.post(&self.url).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            let err = classify_response(status.as_u16(), retry_after.as_deref(), &body);
            tracing::debug!(
                step_id = request.step_id.as_str(),
                backend = %request.backend,
                status = status.as_u16(),
                error = %err,
                "agent endpoint returned an error"
            );
            return Err(err);
        }

        let value: Value = serde_json::from_str(&body).map_err(|e| AgentError::FatalBackend {
            kind: FatalKind::Other,
            message: format!("failed to parse agent response: {e}"),
        })?;
        unwrap_output(value)
    }
}

/// Classify a non-success response.
pub fn classify_response(status: u16, retry_after: Option<&str>, body: &str) -> AgentError {
    let message = summarize_body(status, body);

    // A tool's own message may mention quotas or rate limits.
    if let Some(err) = tool_error(body) {
        return err;
    }
    if status == 429 || is_throttle_body(body) {
        return AgentError::Throttled {
            retry_after_ms: retry_after.and_then(parse_retry_after),
            message,
        };
    }

    let kind = match status {
        401 => FatalKind::Authentication,
        403 => FatalKind::Permission,
        400 | 404 | 422 => FatalKind::InvalidRequest,
        408 | 504 => FatalKind::Timeout,
        _ => FatalKind::Other,
    };
    AgentError::FatalBackend { kind, message }
}

/// Parse a `Retry-After` header: delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        return (secs >= 0.0).then(|| (secs * 1000.0) as u64);
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let ms = (at.with_timezone(&Utc) - Utc::now()).num_milliseconds();
    Some(ms.max(0) as u64)
}

fn is_throttle_body(body: &str) -> bool {
    let lower = body.to_lowercase();
    THROTTLE_MARKERS.iter().any(|m| lower.contains(m))
}

fn tool_error(body: &str) -> Option<AgentError> {
    let value: Value = serde_json::from_str(body).ok()?;
    tool_error_value(&value)
}

fn tool_error_value(value: &Value) -> Option<AgentError> {
    let err = value.get("tool_error")?;
    Some(AgentError::ToolFailure {
        tool: err
            .get("tool")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        message: err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("tool failed")
            .to_string(),
    })
}

fn unwrap_output(value: Value) -> Result<Value, AgentError> {
    if let Some(err) = tool_error_value(&value) {
        return Err(err);
    }
    match value {
        Value::Object(mut map) if map.contains_key("output") => {
            Ok(map.remove("output").unwrap_or(Value::Null))
        }
        other => Ok(other),
    }
}

fn summarize_body(status: u16, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        return format!("HTTP {status}");
    }
    let mut snippet: String = body.chars().take(200).collect();
    if body.chars().count() > 200 {
        snippet.push_str("...");
    }
    format!("HTTP {status}: {snippet}")
}

fn transport_error(err: reqwest::Error) -> AgentError {
    let kind = if err.is_timeout() {
        FatalKind::Timeout
    } else {
        FatalKind::Other
    };
    AgentError::FatalBackend {
        kind,
        message: format!("HTTP request failed: {err}"),
    }
}
