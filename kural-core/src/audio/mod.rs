//! Audio normalization: any supported recording → canonical PCM WAV.
//!
//! Backends:
//! - [`WavNormalizer`]: in-process, hound decode + rubato resampling. WAV only.
//! - [`FfmpegNormalizer`]: shells out to `ffmpeg`, handles mp3 and friends.
//! - [`AutoNormalizer`]: picks one of the two by input extension.
//!
//! All write 16-bit PCM at the requested rate and channel count.

pub mod auto;
pub mod ffmpeg;
pub mod resample;
pub mod stub;
pub mod wav;

pub use auto::AutoNormalizer;
pub use ffmpeg::FfmpegNormalizer;
pub use resample::RateConverter;
pub use stub::StubNormalizer;
pub use wav::WavNormalizer;

use std::path::{Path, PathBuf};

use crate::error::{StageError, StageResult};

/// Converts a raw recording to the canonical format.
pub trait AudioNormalizer: Send + Sync {
    /// Human-readable backend name, used in logs.
    fn name(&self) -> &str;

    /// Lower-case file extensions this backend can decode.
    fn supported_extensions(&self) -> &[&'static str];

    /// Write `input` to `output` at `sample_rate` Hz with `channels` channels.
    ///
    /// Returns the path actually written (always `output` for the bundled
    /// backends). Fails with `UnsupportedFormat` or `IoFailure`.
    fn normalize(
        &self,
        input: &Path,
        output: &Path,
        sample_rate: u32,
        channels: u16,
    ) -> StageResult<PathBuf>;
}

/// Reject inputs before any decoding is attempted.
///
/// Missing, empty or oversized files are `InvalidInput`; an extension the
/// backend cannot decode is `UnsupportedFormat`.
pub fn validate_input(
    input: &Path,
    max_bytes: u64,
    supported_extensions: &[&str],
) -> StageResult<()> {
    let meta = std::fs::metadata(input).map_err(|e| {
        StageError::invalid_input(format!("cannot read {}: {e}", input.display()))
    })?;
    if !meta.is_file() {
        return Err(StageError::invalid_input(format!(
            "{} is not a regular file",
            input.display()
        )));
    }
    if meta.len() == 0 {
        return Err(StageError::invalid_input(format!("{} is empty", input.display())));
    }
    if meta.len() > max_bytes {
        return Err(StageError::invalid_input(format!(
            "{} is {:.1} MiB, limit is {:.1} MiB",
            input.display(),
            meta.len() as f64 / (1024.0 * 1024.0),
            max_bytes as f64 / (1024.0 * 1024.0)
        )));
    }

    let ext = input
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if !supported_extensions.iter().any(|s| *s == ext) {
        return Err(StageError::unsupported_format(format!(
            "extension '.{ext}' not supported (expected one of: {})",
            supported_extensions.join(", ")
        )));
    }
    Ok(())
}

/// Average interleaved frames down to one channel.
pub(crate) fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn validate_rejects_missing_file_as_invalid_input() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = validate_input(&dir.path().join("gone.wav"), 1024, &["wav"])
            .expect_err("missing");
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[test]
    fn validate_rejects_oversized_and_unknown_extension() {
        let dir = tempfile::tempdir().expect("tempdir");
        let big = dir.path().join("big.wav");
        std::fs::write(&big, vec![0u8; 2048]).expect("write");
        let err = validate_input(&big, 1024, &["wav"]).expect_err("too big");
        assert_eq!(err.kind, ErrorKind::InvalidInput);

        let odd = dir.path().join("clip.xyz");
        std::fs::write(&odd, b"data").expect("write");
        let err = validate_input(&odd, 1024, &["wav", "mp3"]).expect_err("bad ext");
        assert_eq!(err.kind, ErrorKind::UnsupportedFormat);
    }

    #[test]
    fn validate_accepts_upper_case_extension() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clip = dir.path().join("CLIP.WAV");
        std::fs::write(&clip, b"RIFF").expect("write");
        validate_input(&clip, 1024, &["wav"]).expect("accepted");
    }

    #[test]
    fn downmix_averages_frames() {
        let stereo = [1.0, 0.0, 0.5, 0.5, -1.0, 1.0];
        assert_eq!(downmix(&stereo, 2), vec![0.5, 0.5, 0.0]);
        assert_eq!(downmix(&[0.1, 0.2], 1), vec![0.1, 0.2]);
    }
}
