use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors produced by kural-core outside of a stage's own failure path.
#[derive(Debug, Error)]
pub enum KuralError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, KuralError>;

/// Stage ledger storage failures.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("ledger row decode failed: {0}")]
    Decode(String),

    #[error("refusing to move {stage} of run {run_id} from {from} to {to}")]
    Regression {
        run_id: String,
        stage: String,
        from: String,
        to: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Failure classes a collaborator (or the orchestrator on its behalf) can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Audio normalizer
    UnsupportedFormat,
    IoFailure,
    // Transcriber
    ModelUnavailable,
    DecodingFailure,
    // Enrichment client
    RateLimited,
    AuthError,
    NetworkTimeout,
    BadRequest,
    // Translator / synthesizer
    UnsupportedLanguage,
    ServiceUnavailable,
    UnsupportedVoice,
    // Raised by the orchestrator itself
    InvalidInput,
    EmptyOutput,
    Timeout,
    Network,
    ArtifactIo,
    Ledger,
    Panicked,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 18] = [
        Self::UnsupportedFormat,
        Self::IoFailure,
        Self::ModelUnavailable,
        Self::DecodingFailure,
        Self::RateLimited,
        Self::AuthError,
        Self::NetworkTimeout,
        Self::BadRequest,
        Self::UnsupportedLanguage,
        Self::ServiceUnavailable,
        Self::UnsupportedVoice,
        Self::InvalidInput,
        Self::EmptyOutput,
        Self::Timeout,
        Self::Network,
        Self::ArtifactIo,
        Self::Ledger,
        Self::Panicked,
    ];

    /// Stable label used in log records and ledger rows.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnsupportedFormat => "unsupported_format",
            Self::IoFailure => "io_failure",
            Self::ModelUnavailable => "model_unavailable",
            Self::DecodingFailure => "decoding_failure",
            Self::RateLimited => "rate_limited",
            Self::AuthError => "auth_error",
            Self::NetworkTimeout => "network_timeout",
            Self::BadRequest => "bad_request",
            Self::UnsupportedLanguage => "unsupported_language",
            Self::ServiceUnavailable => "service_unavailable",
            Self::UnsupportedVoice => "unsupported_voice",
            Self::InvalidInput => "invalid_input",
            Self::EmptyOutput => "empty_output",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::ArtifactIo => "artifact_io",
            Self::Ledger => "ledger",
            Self::Panicked => "panicked",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == raw)
    }

    /// Transient failures worth another attempt unless a policy says otherwise.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::RateLimited
                | Self::NetworkTimeout
                | Self::ServiceUnavailable
                | Self::Timeout
                | Self::Network
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed collaborator failure.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct StageError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unsupported_format(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedFormat, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IoFailure, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, message)
    }
}

impl From<LedgerError> for StageError {
    fn from(e: LedgerError) -> Self {
        Self::new(ErrorKind::Ledger, e.to_string())
    }
}

pub type StageResult<T> = std::result::Result<T, StageError>;
