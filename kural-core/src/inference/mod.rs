//! Speech-to-text contract.
//!
//! The orchestrator hands the transcriber the normalized WAV and a source
//! language hint, and gets back English text with a confidence indicator.

pub mod stub;
pub mod whisper_cli;

pub use stub::StubTranscriber;
pub use whisper_cli::{WhisperCliConfig, WhisperCliTranscriber};

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::StageResult;

/// Recognized text plus the backend's confidence indicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    pub text: String,
    /// Backend-specific scale; whisper reports mean log-probability (≤ 0).
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Implemented by each speech-to-text backend.
pub trait Transcriber: Send + Sync {
    fn name(&self) -> &str;

    /// Fails with `ModelUnavailable` or `DecodingFailure`.
    fn transcribe(&self, audio: &Path, language_hint: &str) -> StageResult<Transcript>;
}
