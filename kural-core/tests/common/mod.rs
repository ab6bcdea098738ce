//! Shared fixtures for the orchestrator integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kural_core::audio::{StubNormalizer, WavNormalizer};
use kural_core::enrich::StubEnricher;
use kural_core::inference::StubTranscriber;
use kural_core::synth::StubSynthesizer;
use kural_core::translate::StubTranslator;
use kural_core::{
    Collaborators, EngineConfig, MemoryLedger, Orchestrator, RetryPolicy, RunOptions, Stage,
    StageLedger, StageStatus, StageTransition,
};

/// Write a mono 16-bit sine recording of `seconds` at `rate`.
pub fn write_recording(path: &Path, seconds: f32, rate: u32) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).expect("create wav");
    let frames = (seconds * rate as f32) as usize;
    for i in 0..frames {
        let t = i as f32 / rate as f32;
        let s = (t * 220.0 * std::f32::consts::TAU).sin() * 0.3;
        writer
            .write_sample((s * i16::MAX as f32) as i16)
            .expect("write sample");
    }
    writer.finalize().expect("finalize wav");
}

/// Backoff short enough to keep tests fast.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(max_attempts)
        .with_delays(Duration::from_millis(1), 2.0, Duration::from_millis(5))
}

/// Stub collaborators kept as concrete types so tests can inspect calls.
pub struct Stubs {
    pub normalizer: Arc<StubNormalizer>,
    pub transcriber: Arc<StubTranscriber>,
    pub enricher: Arc<StubEnricher>,
    pub translator: Arc<StubTranslator>,
    pub synthesizer: Arc<StubSynthesizer>,
}

impl Default for Stubs {
    fn default() -> Self {
        Self {
            normalizer: Arc::new(StubNormalizer::new()),
            transcriber: Arc::new(StubTranscriber::new()),
            enricher: Arc::new(StubEnricher::new()),
            translator: Arc::new(StubTranslator::new()),
            synthesizer: Arc::new(StubSynthesizer::new()),
        }
    }
}

impl Stubs {
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            normalizer: self.normalizer.clone(),
            transcriber: self.transcriber.clone(),
            enricher: self.enricher.clone(),
            translator: self.translator.clone(),
            synthesizer: self.synthesizer.clone(),
        }
    }

    /// Same stubs, but with the native WAV normalizer in front.
    pub fn collaborators_with_wav(&self) -> Collaborators {
        Collaborators {
            normalizer: Arc::new(WavNormalizer::new()),
            ..self.collaborators()
        }
    }

    pub fn call_counts(&self) -> [usize; 5] {
        [
            self.normalizer.calls(),
            self.transcriber.calls(),
            self.enricher.calls(),
            self.translator.calls(),
            self.synthesizer.calls(),
        ]
    }
}

/// A scratch directory holding one input recording and an output directory.
pub struct Workspace {
    pub dir: tempfile::TempDir,
    pub input: PathBuf,
    pub output: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("kural_sample.wav");
        write_recording(&input, 1.0, 16_000);
        let output = dir.path().join("out");
        Self { dir, input, output }
    }

    pub fn options(&self) -> RunOptions {
        RunOptions::new(&self.output)
    }
}

pub fn orchestrator(
    collaborators: Collaborators,
    ledger: Arc<dyn StageLedger>,
    config: EngineConfig,
) -> Orchestrator {
    Orchestrator::new(config, collaborators, ledger)
}

pub fn memory_ledger() -> Arc<MemoryLedger> {
    Arc::new(MemoryLedger::new())
}

pub fn fast_config() -> EngineConfig {
    EngineConfig::default().with_retry_all(fast_retry(3))
}

/// A succeeded event for a required stage is always preceded by succeeded
/// events for every earlier required stage.
pub fn assert_stage_order(events: &[StageTransition]) {
    let mut succeeded: Vec<Stage> = Vec::new();
    for event in events {
        if event.status != StageStatus::Succeeded {
            continue;
        }
        for earlier in Stage::ORDER.iter().take_while(|s| **s != event.stage) {
            if earlier.is_optional() {
                continue;
            }
            assert!(
                succeeded.contains(earlier),
                "{} succeeded before {}",
                event.stage,
                earlier
            );
        }
        succeeded.push(event.stage);
    }
}
