//! In-process WAV normalizer.

use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use tracing::debug;

use super::{downmix, AudioNormalizer, RateConverter};
use crate::error::{StageError, StageResult};

const RESAMPLE_CHUNK: usize = 1024;

/// Decodes PCM or float WAV with hound, downmixes, resamples with rubato and
/// writes 16-bit PCM.
#[derive(Debug, Clone, Default)]
pub struct WavNormalizer;

impl WavNormalizer {
    pub fn new() -> Self {
        Self
    }
}

impl AudioNormalizer for WavNormalizer {
    fn name(&self) -> &str {
        "wav"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["wav"]
    }

    fn normalize(
        &self,
        input: &Path,
        output: &Path,
        sample_rate: u32,
        channels: u16,
    ) -> StageResult<PathBuf> {
        let (mono, source_rate) = read_mono(input)?;
        if mono.is_empty() {
            return Err(StageError::unsupported_format(format!(
                "{} contains no audio frames",
                input.display()
            )));
        }

        let mut rc = RateConverter::new(source_rate, sample_rate, RESAMPLE_CHUNK)?;
        let mut resampled = rc.process(&mono)?;
        resampled.extend(rc.flush()?);

        debug!(
            input = %input.display(),
            source_rate,
            target_rate = sample_rate,
            frames_in = mono.len(),
            frames_out = resampled.len(),
            "wav normalized"
        );

        write_pcm16(output, &resampled, sample_rate, channels)?;
        Ok(output.to_path_buf())
    }
}

/// Decode a WAV file into mono f32 in [-1, 1] plus its sample rate.
pub(crate) fn read_mono(path: &Path) -> StageResult<(Vec<f32>, u32)> {
    let reader = WavReader::open(path).map_err(|e| hound_error(path, e))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| hound_error(path, e))?,
        SampleFormat::Int => {
            if spec.bits_per_sample == 0 || spec.bits_per_sample > 32 {
                return Err(StageError::unsupported_format(format!(
                    "{} uses {} bits per sample",
                    path.display(),
                    spec.bits_per_sample
                )));
            }
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| hound_error(path, e))?
        }
    };

    Ok((downmix(&interleaved, channels), spec.sample_rate))
}

/// Write mono samples as 16-bit PCM, duplicating into every output channel.
pub(crate) fn write_pcm16(
    path: &Path,
    mono: &[f32],
    sample_rate: u32,
    channels: u16,
) -> StageResult<()> {
    let spec = WavSpec {
        channels: channels.max(1),
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec).map_err(|e| hound_error(path, e))?;
    for &sample in mono {
        let pcm = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
        for _ in 0..spec.channels {
            writer.write_sample(pcm).map_err(|e| hound_error(path, e))?;
        }
    }
    writer.finalize().map_err(|e| hound_error(path, e))
}

fn hound_error(path: &Path, e: hound::Error) -> StageError {
    match e {
        hound::Error::IoError(io) => StageError::io(format!("{}: {io}", path.display())),
        other => StageError::unsupported_format(format!("{}: {other}", path.display())),
    }
}
