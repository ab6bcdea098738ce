//! ffmpeg-backed normalizer for compressed inputs (mp3, m4a, ...).

use std::path::{Path, PathBuf};

use super::AudioNormalizer;
use crate::error::{ErrorKind, StageError, StageResult};
use crate::process::run_tool;

const DEFAULT_FFMPEG_BIN: &str = "ffmpeg";

#[derive(Debug, Clone)]
pub struct FfmpegNormalizer {
    binary: String,
}

impl Default for FfmpegNormalizer {
    fn default() -> Self {
        Self {
            binary: DEFAULT_FFMPEG_BIN.to_string(),
        }
    }
}

impl FfmpegNormalizer {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub(crate) fn build_args(
        input: &Path,
        output: &Path,
        sample_rate: u32,
        channels: u16,
    ) -> Vec<String> {
        vec![
            "-hide_banner".to_owned(),
            "-loglevel".to_owned(),
            "error".to_owned(),
            "-y".to_owned(),
            "-i".to_owned(),
            input.display().to_string(),
            "-vn".to_owned(),
            "-ar".to_owned(),
            sample_rate.to_string(),
            "-ac".to_owned(),
            channels.to_string(),
            "-c:a".to_owned(),
            "pcm_s16le".to_owned(),
            "-f".to_owned(),
            "wav".to_owned(),
            output.display().to_string(),
        ]
    }
}

impl AudioNormalizer for FfmpegNormalizer {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["mp3", "wav", "m4a", "flac", "ogg", "opus", "aac"]
    }

    fn normalize(
        &self,
        input: &Path,
        output: &Path,
        sample_rate: u32,
        channels: u16,
    ) -> StageResult<PathBuf> {
        let args = Self::build_args(input, output, sample_rate, channels);
        // ffmpeg reports undecodable input through a non-zero exit.
        run_tool(
            &self.binary,
            &args,
            ErrorKind::IoFailure,
            ErrorKind::UnsupportedFormat,
        )?;
        if !output.exists() {
            return Err(StageError::io(format!(
                "ffmpeg reported success but {} is missing",
                output.display()
            )));
        }
        Ok(output.to_path_buf())
    }
}
