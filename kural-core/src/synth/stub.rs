use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;

use super::Synthesizer;
use crate::audio::wav::write_pcm16;
use crate::error::{ErrorKind, StageResult};
use crate::scripted::Script;

const STUB_RATE: u32 = 16_000;

/// Writes silence, 50 ms per character of input.
#[derive(Debug, Default)]
pub struct StubSynthesizer {
    script: Script,
    inputs: Mutex<Vec<String>>,
}

impl StubSynthesizer {
    pub fn new() -> Self {
        Self::default()
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

    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().clone()
    }
}

impl Synthesizer for StubSynthesizer {
    fn name(&self) -> &str {
        "stub"
    }

    fn file_extension(&self) -> &str {
        "wav"
    }

    fn synthesize(&self, text: &str, _language: &str, output: &Path) -> StageResult<PathBuf> {
        self.inputs.lock().push(text.to_string());
        self.script.step("stub synthesizer")?;
        let frames = text.chars().count() * (STUB_RATE as usize / 20);
        write_pcm16(output, &vec![0.0; frames.max(1)], STUB_RATE, 1)?;
        Ok(output.to_path_buf())
    }
}
