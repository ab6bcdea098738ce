//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! Recordings arrive at whatever rate the device used (44.1 kHz and 48 kHz
//! are common). The transcriber wants 16 kHz. `RateConverter` feeds rubato in
//! fixed-size chunks, strips the filter delay from the head of the output and
//! drains the tail on [`RateConverter::flush`], so a whole file converts to
//! `round(len * target / source)` frames.
//!
//! When source rate == target rate no rubato session is created at all.
//!
//! ```ignore
//! let mut rc = RateConverter::new(48_000, 16_000, 1024)?;
//! let mut out = rc.process(&samples)?;
//! out.extend(rc.flush()?);
//! ```

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::debug;

use crate::error::{StageError, StageResult};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when source rate == target rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Holds partial input chunks between calls.
    input_buf: Vec<f32>,
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
    ratio: f64,
    /// Output frames still to discard from the head (filter delay).
    delay_remaining: usize,
    frames_in: usize,
    frames_out: usize,
}

impl RateConverter {
    /// Create a converter for mono audio.
    ///
    /// Fails with `UnsupportedFormat` when rubato rejects the rate pair.
    pub fn new(source_rate: u32, target_rate: u32, chunk_size: usize) -> StageResult<Self> {
        let ratio = target_rate as f64 / source_rate as f64;
        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
                ratio,
                delay_remaining: 0,
                frames_in: 0,
                frames_out: 0,
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio
            PolynomialDegree::Cubic,
            chunk_size,
            1, // mono
        )
        .map_err(|e| StageError::unsupported_format(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        let delay = resampler.output_delay();
        debug!(source_rate, target_rate, chunk_size, max_out, delay, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::new(),
            chunk_size,
            output_buf: vec![vec![0f32; max_out]; 1],
            ratio,
            delay_remaining: delay,
            frames_in: 0,
            frames_out: 0,
        })
    }

    /// Process incoming samples, returning whatever output is ready (may be empty).
    ///
    /// Samples accumulate until a full `chunk_size` block is available; the
    /// remainder is kept for the next call or for [`RateConverter::flush`].
    pub fn process(&mut self, samples: &[f32]) -> StageResult<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(samples.to_vec());
        };

        self.input_buf.extend_from_slice(samples);
        self.frames_in += samples.len();

        let mut result = Vec::new();
        while self.input_buf.len() >= self.chunk_size {
            let (_consumed, produced) = resampler
                .process_into_buffer(&[&self.input_buf[..self.chunk_size]], &mut self.output_buf, None)
                .map_err(|e| StageError::unsupported_format(format!("resample: {e}")))?;
            take_output(
                &self.output_buf[0][..produced],
                &mut self.delay_remaining,
                &mut result,
            );
            self.input_buf.drain(..self.chunk_size);
        }
        self.frames_out += result.len();
        Ok(result)
    }

    /// Push the buffered remainder and the filter tail through rubato.
    ///
    /// After this the converter has emitted `round(frames_in * ratio)` frames.
    pub fn flush(&mut self) -> StageResult<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(Vec::new());
        };

        let expected = (self.frames_in as f64 * self.ratio).round() as usize;
        let mut result = Vec::new();

        if !self.input_buf.is_empty() {
            let (_, produced) = resampler
                .process_partial_into_buffer(
                    Some(&[&self.input_buf[..]][..]),
                    &mut self.output_buf,
                    None,
                )
                .map_err(|e| StageError::unsupported_format(format!("resample tail: {e}")))?;
            take_output(
                &self.output_buf[0][..produced],
                &mut self.delay_remaining,
                &mut result,
            );
            self.input_buf.clear();
        }

        // Zero-input calls drain the delay line until the expected length is reached.
        while self.frames_out + result.len() < expected {
            let (_, produced) = resampler
                .process_partial_into_buffer(None::<&[&[f32]]>, &mut self.output_buf, None)
                .map_err(|e| StageError::unsupported_format(format!("resample drain: {e}")))?;
            if produced == 0 {
                break;
            }
            take_output(
                &self.output_buf[0][..produced],
                &mut self.delay_remaining,
                &mut result,
            );
        }

        result.truncate(expected.saturating_sub(self.frames_out));
        self.frames_out += result.len();
        Ok(result)
    }

    /// Returns `true` when source rate == target rate (no resampling occurs).
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

fn take_output(produced: &[f32], delay_remaining: &mut usize, out: &mut Vec<f32>) {
    let skip = (*delay_remaining).min(produced.len());
    *delay_remaining -= skip;
    out.extend_from_slice(&produced[skip..]);
}
