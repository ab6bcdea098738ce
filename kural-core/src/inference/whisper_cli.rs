//! whisper.cpp command-line transcriber.
//!
//! Runs `whisper-cli` with translate-to-English enabled and JSON output, then
//! reads the JSON back. Confidence is taken, in order of preference, from
//! the mean segment `avg_logprob`, the mean token probability `p`, or 0.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tracing::{debug, warn};

use super::{Transcriber, Transcript};
use crate::error::{ErrorKind, StageError, StageResult};
use crate::process::run_tool;

const DEFAULT_WHISPER_BIN: &str = "whisper-cli";

#[derive(Debug, Clone)]
pub struct WhisperCliConfig {
    pub binary: String,
    pub model: PathBuf,
    /// Translate to English while decoding (`--translate`).
    pub translate: bool,
    pub threads: Option<u16>,
}

impl WhisperCliConfig {
    pub fn new(model: impl Into<PathBuf>) -> Self {
        Self {
            binary: DEFAULT_WHISPER_BIN.to_string(),
            model: model.into(),
            translate: true,
            threads: None,
        }
    }
}

pub struct WhisperCliTranscriber {
    config: WhisperCliConfig,
    calls: AtomicU64,
}

impl WhisperCliTranscriber {
    pub fn new(config: WhisperCliConfig) -> Self {
        Self {
            config,
            calls: AtomicU64::new(0),
        }
    }

    /// Scratch output prefix next to `audio`, unique per call so an abandoned
    /// call still running in the background never shares files with a retry.
    fn scratch_prefix(&self, audio: &Path) -> PathBuf {
        let n = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        let stem = audio
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());
        audio.with_file_name(format!("{stem}.whisper-{}-{n}", std::process::id()))
    }

    fn build_args(&self, audio: &Path, language_hint: &str, output_prefix: &Path) -> Vec<String> {
        let mut args = vec![
            "-m".to_owned(),
            self.config.model.display().to_string(),
            "-f".to_owned(),
            audio.display().to_string(),
            "-of".to_owned(),
            output_prefix.display().to_string(),
            "-oj".to_owned(),
            "-np".to_owned(),
        ];
        if !language_hint.is_empty() {
            args.push("-l".to_owned());
            args.push(language_hint.to_owned());
        }
        if self.config.translate {
            args.push("--translate".to_owned());
        }
        if let Some(threads) = self.config.threads {
            args.push("-t".to_owned());
            args.push(threads.to_string());
        }
        args
    }
}

impl Transcriber for WhisperCliTranscriber {
    fn name(&self) -> &str {
        "whisper-cli"
    }

    fn transcribe(&self, audio: &Path, language_hint: &str) -> StageResult<Transcript> {
        if !self.config.model.is_file() {
            return Err(StageError::new(
                ErrorKind::ModelUnavailable,
                format!("model file {} not found", self.config.model.display()),
            ));
        }

        let output_prefix = self.scratch_prefix(audio);
        let args = self.build_args(audio, language_hint, &output_prefix);
        run_tool(
            &self.config.binary,
            &args,
            ErrorKind::ModelUnavailable,
            ErrorKind::DecodingFailure,
        )?;

        let json_path = PathBuf::from(format!("{}.json", output_prefix.display()));
        let raw = fs::read_to_string(&json_path).map_err(|e| {
            StageError::new(
                ErrorKind::DecodingFailure,
                format!("whisper output {} unreadable: {e}", json_path.display()),
            )
        })?;
        if let Err(e) = fs::remove_file(&json_path) {
            warn!(path = %json_path.display(), error = %e, "could not remove whisper scratch output");
        }

        let value: Value = serde_json::from_str(&raw).map_err(|e| {
            StageError::new(ErrorKind::DecodingFailure, format!("whisper JSON: {e}"))
        })?;
        let transcript = parse_whisper_json(&value, language_hint);
        debug!(
            chars = transcript.text.chars().count(),
            confidence = transcript.confidence,
            "whisper transcript parsed"
        );
        Ok(transcript)
    }
}

/// Pull text and confidence out of whisper.cpp (`transcription[]`) or
/// openai-whisper style (`segments[]`) JSON.
pub(crate) fn parse_whisper_json(root: &Value, language_hint: &str) -> Transcript {
    let segments = root
        .get("transcription")
        .or_else(|| root.get("segments"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let text = root
        .get("text")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| {
            segments
                .iter()
                .filter_map(|s| s.get("text").and_then(Value::as_str))
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        });

    let logprobs: Vec<f64> = segments
        .iter()
        .filter_map(|s| s.get("avg_logprob").and_then(Value::as_f64))
        .collect();
    let token_ps: Vec<f64> = segments
        .iter()
        .filter_map(|s| s.get("tokens").and_then(Value::as_array))
        .flatten()
        .filter_map(|t| t.get("p").and_then(Value::as_f64))
        .collect();
    let confidence = mean(&logprobs).or_else(|| mean(&token_ps)).unwrap_or(0.0) as f32;

    let language = root
        .pointer("/result/language")
        .or_else(|| root.get("language"))
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or_else(|| (!language_hint.is_empty()).then(|| language_hint.to_owned()));

    Transcript {
        text,
        confidence,
        language,
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn whisper_cpp_json_joins_segments_and_averages_token_p() {
        let raw = json!({
            "result": {"language": "ta"},
            "transcription": [
                {"text": " Hello there.", "tokens": [{"p": 0.9}, {"p": 0.7}]},
                {"text": " How are you?", "tokens": [{"p": 0.8}]}
            ]
        });
        let t = parse_whisper_json(&raw, "ta");
        assert_eq!(t.text, "Hello there. How are you?");
        approx::assert_relative_eq!(t.confidence, 0.8, epsilon = 1e-5);
        assert_eq!(t.language.as_deref(), Some("ta"));
    }

    #[test]
    fn avg_logprob_wins_over_token_probabilities() {
        let raw = json!({
            "text": "  vanakkam  ",
            "segments": [
                {"text": "vanakkam", "avg_logprob": -0.2, "tokens": [{"p": 0.99}]},
                {"text": "", "avg_logprob": -0.4}
            ]
        });
        let t = parse_whisper_json(&raw, "");
        assert_eq!(t.text, "vanakkam");
        approx::assert_relative_eq!(t.confidence, -0.3, epsilon = 1e-5);
        assert_eq!(t.language, None);
    }

    #[test]
    fn empty_document_yields_empty_text_and_zero_confidence() {
        let t = parse_whisper_json(&json!({}), "ta");
        assert!(t.text.is_empty());
        assert_eq!(t.confidence, 0.0);
    }

    #[test]
    fn missing_model_is_model_unavailable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tr = WhisperCliTranscriber::new(WhisperCliConfig::new(dir.path().join("nope.bin")));
        let err = tr
            .transcribe(&dir.path().join("a.wav"), "ta")
            .expect_err("no model");
        assert_eq!(err.kind, ErrorKind::ModelUnavailable);
    }

    #[test]
    fn every_call_gets_its_own_scratch_prefix() {
        let tr = WhisperCliTranscriber::new(WhisperCliConfig::new("/models/ggml-small.bin"));
        let audio = Path::new("/work/run-1_normalized.wav");
        let first = tr.scratch_prefix(audio);
        let second = tr.scratch_prefix(audio);
        assert_ne!(first, second);
        for prefix in [&first, &second] {
            assert_eq!(prefix.parent(), audio.parent());
            let name = prefix.file_name().and_then(|n| n.to_str()).expect("utf-8 name");
            assert!(name.starts_with("run-1_normalized.whisper-"), "{name}");
        }
    }

    #[test]
    fn args_include_translate_language_and_json_output() {
        let tr = WhisperCliTranscriber::new(WhisperCliConfig::new("/models/ggml-small.bin"));
        let args = tr.build_args(Path::new("/w/a.wav"), "ta", Path::new("/w/a.whisper"));
        let joined = args.join(" ");
        assert!(joined.contains("-m /models/ggml-small.bin"));
        assert!(joined.contains("-l ta"));
        assert!(joined.contains("--translate"));
        assert!(joined.contains("-oj"));
    }
}
