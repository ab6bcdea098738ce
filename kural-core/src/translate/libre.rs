//! LibreTranslate-compatible HTTP translator.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::Translator;
use crate::error::{ErrorKind, KuralError, Result, StageError, StageResult};

#[derive(Debug, Clone)]
pub struct LibreConfig {
    /// Full `/translate` endpoint.
    pub url: String,
    pub api_key: Option<String>,
    /// Language of the incoming text; `auto` lets the server detect it.
    pub source_language: String,
    /// Target codes this deployment serves. Empty means "ask the server".
    pub supported_targets: Vec<String>,
    pub timeout: Duration,
}

impl Default for LibreConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:5000/translate".to_string(),
            api_key: None,
            source_language: "en".to_string(),
            supported_targets: vec!["ta".to_string(), "en".to_string()],
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Serialize)]
struct TranslateRequest<'a> {
    q: &'a str,
    source: &'a str,
    target: &'a str,
    format: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranslateResponse {
    translated_text: String,
}

pub struct LibreTranslator {
    config: LibreConfig,
    http: Client,
}

impl LibreTranslator {
    pub fn new(config: LibreConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| KuralError::Config(format!("translator http client: {e}")))?;
        Ok(Self { config, http })
    }
}

impl Translator for LibreTranslator {
    fn name(&self) -> &str {
        "libretranslate"
    }

    fn translate(&self, text: &str, target_language: &str) -> StageResult<String> {
        let targets = &self.config.supported_targets;
        if !targets.is_empty() && !targets.iter().any(|t| t == target_language) {
            return Err(StageError::new(
                ErrorKind::UnsupportedLanguage,
                format!(
                    "target '{target_language}' not in configured set [{}]",
                    targets.join(", ")
                ),
            ));
        }

        let request = TranslateRequest {
            q: text,
            source: &self.config.source_language,
            target: target_language,
            format: "text",
            api_key: self.config.api_key.as_deref(),
        };
        debug!(chars = text.chars().count(), target = target_language, "translate request");

        let response = self
            .http
            .post(&self.config.url)
            .json(&request)
            .send()
            .map_err(|e| {
                StageError::service_unavailable(format!("translator unreachable: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            warn!(status = %status, "translate request rejected");
            return Err(classify_status(status, &detail));
        }

        let parsed: TranslateResponse = response.json().map_err(|e| {
            StageError::service_unavailable(format!("translator returned malformed JSON: {e}"))
        })?;
        Ok(parsed.translated_text.trim().to_string())
    }
}

fn classify_status(status: StatusCode, detail: &str) -> StageError {
    let detail: String = detail.chars().take(200).collect();
    let lowered = detail.to_ascii_lowercase();
    let kind = match status {
        StatusCode::BAD_REQUEST if lowered.contains("language") => ErrorKind::UnsupportedLanguage,
        StatusCode::BAD_REQUEST => ErrorKind::BadRequest,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::AuthError,
        StatusCode::TOO_MANY_REQUESTS => ErrorKind::RateLimited,
        _ => ErrorKind::ServiceUnavailable,
    };
    StageError::new(kind, format!("translator returned {status}: {detail}"))
}
