//! `StubTranscriber`: deterministic backend for tests and dry runs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;

use super::{Transcriber, Transcript};
use crate::error::{ErrorKind, StageResult};
use crate::scripted::Script;

/// Returns a fixed transcript for every call unless scripted to fail.
#[derive(Debug)]
pub struct StubTranscriber {
    response: String,
    confidence: f32,
    script: Script,
    inputs: Mutex<Vec<PathBuf>>,
}

impl Default for StubTranscriber {
    fn default() -> Self {
        Self::new()
    }
}

impl StubTranscriber {
    pub fn new() -> Self {
        Self {
            response: "stub transcript of the recording".to_string(),
            confidence: -0.25,
            script: Script::default(),
            inputs: Mutex::new(Vec::new()),
        }
    }

    pub fn with_response(mut self, response: &str) -> Self {
        self.response = response.to_string();
        self
    }

    pub fn with_failures(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.script = self.script.failures(kinds);
        self
    }

    pub fn always_failing(mut self, kind: ErrorKind) -> Self {
        self.script = self.script.always(kind);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.script = self.script.delay(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.script.calls()
    }

    pub fn inputs(&self) -> Vec<PathBuf> {
        self.inputs.lock().clone()
    }
}

impl Transcriber for StubTranscriber {
    fn name(&self) -> &str {
        "stub"
    }

    fn transcribe(&self, audio: &Path, language_hint: &str) -> StageResult<Transcript> {
        self.inputs.lock().push(audio.to_path_buf());
        self.script.step("stub transcriber")?;
        Ok(Transcript {
            text: self.response.clone(),
            confidence: self.confidence,
            language: Some(language_hint.to_string()),
        })
    }
}
