//! Persistent host settings (JSON file in the app data directory).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kural_core::{EngineConfig, RetryPolicy, Stage};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetrySettings {
    fn normalize(&mut self) {
        self.max_attempts = self.max_attempts.clamp(1, 10);
        self.base_delay_ms = self.base_delay_ms.min(60_000);
        self.multiplier = if self.multiplier.is_finite() {
            self.multiplier.clamp(1.0, 10.0)
        } else {
            2.0
        };
        self.max_delay_ms = self.max_delay_ms.clamp(self.base_delay_ms, 600_000);
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.max_attempts)
            .with_delays(
                Duration::from_millis(self.base_delay_ms),
                self.multiplier,
                Duration::from_millis(self.max_delay_ms),
            )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    /// `native` (external tools and HTTP services) or `stub` (offline, deterministic).
    pub backend: String,
    /// `auto` (built-in decoder for WAV, ffmpeg for the rest), `wav` or `ffmpeg`.
    pub normalizer: String,
    pub output_dir: Option<PathBuf>,
    pub ledger_path: Option<PathBuf>,
    pub source_language: String,
    pub target_language: String,
    pub enrichment_enabled: bool,
    pub translate_enriched: bool,
    pub max_parallel_runs: usize,
    pub ffmpeg_binary: String,
    pub whisper_binary: String,
    pub whisper_model: Option<PathBuf>,
    pub whisper_threads: Option<u16>,
    pub espeak_binary: String,
    pub gemini_api_key: Option<String>,
    pub gemini_api_url: Option<String>,
    pub translate_url: String,
    pub translate_api_key: Option<String>,
    pub retry: RetrySettings,
    /// Per-stage overrides keyed by stage label (`translate`, ...).
    pub stage_retry: BTreeMap<String, RetrySettings>,
    /// Per-stage call timeouts in seconds, keyed by stage label.
    pub call_timeout_secs: BTreeMap<String, u64>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            backend: "native".into(),
            normalizer: "auto".into(),
            output_dir: None,
            ledger_path: None,
            source_language: "ta".into(),
            target_language: "ta".into(),
            enrichment_enabled: true,
            translate_enriched: false,
            max_parallel_runs: 2,
            ffmpeg_binary: "ffmpeg".into(),
            whisper_binary: "whisper-cli".into(),
            whisper_model: None,
            whisper_threads: None,
            espeak_binary: "espeak-ng".into(),
            gemini_api_key: None,
            gemini_api_url: None,
            translate_url: "http://127.0.0.1:5000/translate".into(),
            translate_api_key: None,
            retry: RetrySettings::default(),
            stage_retry: BTreeMap::new(),
            call_timeout_secs: BTreeMap::new(),
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.backend = normalize_backend(&self.backend);
        self.normalizer = normalize_normalizer(&self.normalizer);
        self.source_language = normalize_language(&self.source_language, "ta");
        self.target_language = normalize_language(&self.target_language, "ta");
        self.max_parallel_runs = self.max_parallel_runs.clamp(1, 16);
        self.whisper_threads = self.whisper_threads.filter(|t| *t > 0);
        self.gemini_api_key = trimmed(self.gemini_api_key.take());
        self.gemini_api_url = trimmed(self.gemini_api_url.take());
        self.translate_api_key = trimmed(self.translate_api_key.take());
        self.retry.normalize();

        let stage_retry = std::mem::take(&mut self.stage_retry);
        for (label, mut retry) in stage_retry {
            match Stage::parse(&label.trim().to_ascii_lowercase()) {
                Some(stage) => {
                    retry.normalize();
                    self.stage_retry.insert(stage.label().to_string(), retry);
                }
                None => warn!(stage = %label, "ignoring retry override for unknown stage"),
            }
        }

        let timeouts = std::mem::take(&mut self.call_timeout_secs);
        for (label, secs) in timeouts {
            match Stage::parse(&label.trim().to_ascii_lowercase()) {
                Some(stage) => {
                    self.call_timeout_secs
                        .insert(stage.label().to_string(), secs.clamp(1, 7_200));
                }
                None => warn!(stage = %label, "ignoring call timeout for unknown stage"),
            }
        }
    }

    /// Overlay `KURAL_*` variables, plus `GEMINI_API_KEY` / `GEMINI_API_URL`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| var(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("KURAL_BACKEND") {
            self.backend = v;
        }
        if let Some(v) = get("KURAL_NORMALIZER") {
            self.normalizer = v;
        }
        if let Some(v) = get("KURAL_OUTPUT_DIR") {
            self.output_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("KURAL_LEDGER_PATH") {
            self.ledger_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("KURAL_TARGET_LANGUAGE") {
            self.target_language = v;
        }
        if let Some(v) = get("KURAL_WHISPER_MODEL") {
            self.whisper_model = Some(PathBuf::from(v));
        }
        if let Some(v) = get("KURAL_TRANSLATE_URL") {
            self.translate_url = v;
        }
        if let Some(v) = get("KURAL_MAX_PARALLEL_RUNS") {
            match v.parse() {
                Ok(n) => self.max_parallel_runs = n,
                Err(_) => warn!(value = %v, "KURAL_MAX_PARALLEL_RUNS is not a number"),
            }
        }
        if let Some(v) = get("GEMINI_API_KEY") {
            self.gemini_api_key = Some(v);
        }
        if let Some(v) = get("GEMINI_API_URL") {
            self.gemini_api_url = Some(v);
        }
        self.normalize();
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("kural-output"))
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.ledger_path
            .clone()
            .unwrap_or_else(|| data_dir().join("ledger.db"))
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::default().with_retry_all(self.retry.policy());
        config.source_language = self.source_language.clone();
        for (label, retry) in &self.stage_retry {
            if let Some(stage) = Stage::parse(label) {
                config = config.with_retry(stage, retry.policy());
            }
        }
        for (label, secs) in &self.call_timeout_secs {
            if let Some(stage) = Stage::parse(label) {
                config = config.with_call_timeout(stage, Some(Duration::from_secs(*secs)));
            }
        }
        config
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

pub fn normalize_backend(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "stub" | "stubs" | "offline" => "stub".into(),
        _ => "native".into(),
    }
}

pub fn normalize_normalizer(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "ffmpeg" => "ffmpeg".into(),
        "wav" => "wav".into(),
        _ => "auto".into(),
    }
}

pub fn normalize_language(raw: &str, fallback: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => fallback.into(),
        "tamil" | "tam" => "ta".into(),
        "english" | "eng" => "en".into(),
        "hindi" | "hin" => "hi".into(),
        other => other.into(),
    }
}

fn data_dir() -> PathBuf {
    std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local")
                .join("share")
        })
        .join("kural")
}

pub fn default_settings_path() -> PathBuf {
    data_dir().join("settings.json")
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<AppSettings>(&raw).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "settings file unreadable; using defaults");
            AppSettings::default()
        }),
        Err(_) => AppSettings::default(),
    };
    settings.normalize();
    settings
}
