//! Normalizer stub: writes a short silent WAV instead of decoding anything.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;

use super::wav::write_pcm16;
use super::AudioNormalizer;
use crate::error::{ErrorKind, StageResult};
use crate::scripted::Script;

#[derive(Debug, Default)]
pub struct StubNormalizer {
    script: Script,
    seconds: f32,
    inputs: Mutex<Vec<PathBuf>>,
}

impl StubNormalizer {
    pub fn new() -> Self {
        Self {
            seconds: 0.1,
            ..Self::default()
        }
    }

    /// Length of the silent output, in seconds.
    pub fn with_duration(mut self, seconds: f32) -> Self {
        self.seconds = seconds;
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

    /// Inputs seen so far, in call order.
    pub fn inputs(&self) -> Vec<PathBuf> {
        self.inputs.lock().clone()
    }
}

impl AudioNormalizer for StubNormalizer {
    fn name(&self) -> &str {
        "stub"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["wav", "mp3"]
    }

    fn normalize(
        &self,
        input: &Path,
        output: &Path,
        sample_rate: u32,
        channels: u16,
    ) -> StageResult<PathBuf> {
        self.inputs.lock().push(input.to_path_buf());
        self.script.step("stub normalizer")?;
        let frames = (sample_rate as f32 * self.seconds) as usize;
        write_pcm16(output, &vec![0.0; frames], sample_rate, channels)?;
        Ok(output.to_path_buf())
    }
}
