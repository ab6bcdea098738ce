//! Extension-routed normalizer: WAV in-process, everything else through ffmpeg.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::{AudioNormalizer, FfmpegNormalizer, WavNormalizer};
use crate::error::StageResult;

#[derive(Debug, Clone, Default)]
pub struct AutoNormalizer {
    wav: WavNormalizer,
    ffmpeg: FfmpegNormalizer,
}

impl AutoNormalizer {
    pub fn new(ffmpeg_binary: impl Into<String>) -> Self {
        Self {
            wav: WavNormalizer::new(),
            ffmpeg: FfmpegNormalizer::new(ffmpeg_binary),
        }
    }

    fn route(&self, input: &Path) -> &dyn AudioNormalizer {
        let is_wav = input
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("wav"));
        if is_wav {
            &self.wav
        } else {
            &self.ffmpeg
        }
    }
}

impl AudioNormalizer for AutoNormalizer {
    fn name(&self) -> &str {
        "auto"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        self.ffmpeg.supported_extensions()
    }

    fn normalize(
        &self,
        input: &Path,
        output: &Path,
        sample_rate: u32,
        channels: u16,
    ) -> StageResult<PathBuf> {
        let backend = self.route(input);
        debug!(input = %input.display(), backend = backend.name(), "normalizing");
        backend.normalize(input, output, sample_rate, channels)
    }
}
