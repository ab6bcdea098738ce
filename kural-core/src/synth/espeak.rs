//! `espeak-ng` synthesizer.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::Synthesizer;
use crate::error::{ErrorKind, StageError, StageResult};
use crate::process::run_tool;

#[derive(Debug, Clone)]
pub struct EspeakConfig {
    pub binary: String,
    /// Language code → espeak voice name. Languages absent here are refused.
    pub voices: BTreeMap<String, String>,
    /// Words per minute.
    pub rate: u32,
}

impl Default for EspeakConfig {
    fn default() -> Self {
        let voices = [("ta", "ta"), ("en", "en-us"), ("hi", "hi")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            binary: "espeak-ng".to_string(),
            voices,
            rate: 150,
        }
    }
}

pub struct EspeakSynthesizer {
    config: EspeakConfig,
}

impl EspeakSynthesizer {
    pub fn new(config: EspeakConfig) -> Self {
        Self { config }
    }

    fn voice_for(&self, language: &str) -> StageResult<&str> {
        self.config
            .voices
            .get(language)
            .map(String::as_str)
            .ok_or_else(|| {
                StageError::new(
                    ErrorKind::UnsupportedVoice,
                    format!("no espeak voice configured for '{language}'"),
                )
            })
    }
}

impl Synthesizer for EspeakSynthesizer {
    fn name(&self) -> &str {
        "espeak-ng"
    }

    fn file_extension(&self) -> &str {
        "wav"
    }

    fn synthesize(&self, text: &str, language: &str, output: &Path) -> StageResult<PathBuf> {
        let voice = self.voice_for(language)?;
        let args = vec![
            "-v".to_owned(),
            voice.to_owned(),
            "-s".to_owned(),
            self.config.rate.to_string(),
            "-w".to_owned(),
            output.display().to_string(),
            text.to_owned(),
        ];
        run_tool(
            &self.config.binary,
            &args,
            ErrorKind::ServiceUnavailable,
            ErrorKind::ServiceUnavailable,
        )
        .map_err(|e| {
            // espeak-ng exits non-zero with "voice does not exist" for unknown voices.
            if e.message.to_ascii_lowercase().contains("voice") {
                StageError::new(ErrorKind::UnsupportedVoice, e.message)
            } else {
                e
            }
        })?;
        if !output.exists() {
            return Err(StageError::service_unavailable(format!(
                "espeak-ng wrote nothing to {}",
                output.display()
            )));
        }
        Ok(output.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_language_is_unsupported_voice() {
        let s = EspeakSynthesizer::new(EspeakConfig::default());
        let dir = tempfile::tempdir().expect("tempdir");
        let err = s
            .synthesize("hello", "xx", &dir.path().join("o.wav"))
            .expect_err("no voice");
        assert_eq!(err.kind, ErrorKind::UnsupportedVoice);
    }

    #[test]
    fn missing_binary_is_retryable_service_unavailable() {
        let s = EspeakSynthesizer::new(EspeakConfig {
            binary: "kural-no-such-espeak".to_string(),
            ..EspeakConfig::default()
        });
        let dir = tempfile::tempdir().expect("tempdir");
        let err = s
            .synthesize("vanakkam", "ta", &dir.path().join("o.wav"))
            .expect_err("binary missing");
        assert_eq!(err.kind, ErrorKind::ServiceUnavailable);
    }
}
