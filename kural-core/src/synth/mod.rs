//! Speech synthesis contract.

pub mod espeak;
pub mod stub;

pub use espeak::{EspeakConfig, EspeakSynthesizer};
pub use stub::StubSynthesizer;

use std::path::{Path, PathBuf};

use crate::error::StageResult;

pub trait Synthesizer: Send + Sync {
    fn name(&self) -> &str;

    /// Extension (without dot) of the audio this backend writes.
    fn file_extension(&self) -> &str;

    /// Speak `text` in `language` into `output`.
    ///
    /// Fails with `UnsupportedVoice` (terminal) or `ServiceUnavailable` (retryable).
    fn synthesize(&self, text: &str, language: &str, output: &Path) -> StageResult<PathBuf>;
}
