//! Google Gemini `generateContent` client.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{Enrichment, EnrichmentClient};
use crate::error::{ErrorKind, KuralError, Result, StageError, StageResult};

pub const DEFAULT_GEMINI_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent";

/// Shortest key accepted before a request is even attempted.
const MIN_KEY_LEN: usize = 10;

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    pub url: String,
    pub timeout: Duration,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            url: DEFAULT_GEMINI_URL.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl GeminiConfig {
    /// Defaults overlaid with `GEMINI_API_KEY` / `GEMINI_API_URL`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            if !key.trim().is_empty() {
                cfg.api_key = Some(key.trim().to_string());
            }
        }
        if let Ok(url) = std::env::var("GEMINI_API_URL") {
            if !url.trim().is_empty() {
                cfg.url = url.trim().to_string();
            }
        }
        cfg
    }
}

pub struct GeminiClient {
    config: GeminiConfig,
    http: Client,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| KuralError::Config(format!("gemini http client: {e}")))?;
        Ok(Self { config, http })
    }

    fn api_key(&self) -> StageResult<&str> {
        match self.config.api_key.as_deref() {
            Some(key) if key.len() >= MIN_KEY_LEN => Ok(key),
            Some(_) => Err(StageError::new(
                ErrorKind::AuthError,
                "GEMINI_API_KEY looks invalid (too short)",
            )),
            None => Err(StageError::new(ErrorKind::AuthError, "GEMINI_API_KEY is not set")),
        }
    }
}

impl EnrichmentClient for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn enrich(&self, text: &str) -> StageResult<Enrichment> {
        let key = self.api_key()?;
        let body = json!({ "contents": [{ "parts": [{ "text": text }] }] });
        debug!(chars = text.chars().count(), url = %self.config.url, "gemini request");

        let response = self
            .http
            .post(&self.config.url)
            .header("X-goog-api-key", key)
            .json(&body)
            .send()
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            warn!(status = %status, "gemini request rejected");
            return Err(classify_status(status, &detail));
        }

        let payload: Value = response.json().map_err(|e| {
            StageError::new(ErrorKind::BadRequest, format!("gemini response not JSON: {e}"))
        })?;
        parse_response(&payload)
    }
}

/// Map a non-success HTTP status to a typed failure.
pub(crate) fn classify_status(status: StatusCode, detail: &str) -> StageError {
    let detail: String = detail.chars().take(200).collect();
    let kind = match status {
        StatusCode::TOO_MANY_REQUESTS => ErrorKind::RateLimited,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::AuthError,
        StatusCode::BAD_REQUEST => ErrorKind::BadRequest,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ErrorKind::NetworkTimeout,
        s if s.is_server_error() => ErrorKind::ServiceUnavailable,
        _ => ErrorKind::BadRequest,
    };
    StageError::new(kind, format!("gemini returned {status}: {detail}"))
}

pub(crate) fn transport_error(e: reqwest::Error) -> StageError {
    if e.is_timeout() {
        StageError::new(ErrorKind::NetworkTimeout, format!("gemini timed out: {e}"))
    } else {
        StageError::new(ErrorKind::Network, format!("gemini transport: {e}"))
    }
}

/// Extract `candidates[0].content.parts[0].text` and keep finish reason and
/// usage metadata as structured output.
pub(crate) fn parse_response(payload: &Value) -> StageResult<Enrichment> {
    let candidate = payload
        .pointer("/candidates/0")
        .ok_or_else(|| StageError::new(ErrorKind::EmptyOutput, "no candidates in gemini response"))?;
    let text = candidate
        .pointer("/content/parts/0/text")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string();

    let raw = json!({
        "generatedText": text,
        "finishReason": candidate.get("finishReason").cloned().unwrap_or(Value::Null),
        "usageMetadata": payload.get("usageMetadata").cloned().unwrap_or(Value::Null),
        "modelVersion": payload.get("modelVersion").cloned().unwrap_or(Value::Null),
    });
    Ok(Enrichment { text, raw })
}
