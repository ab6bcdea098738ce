//! `Orchestrator`: drives one recording through the fixed stage order.
//!
//! ## Per-stage protocol
//!
//! ```text
//! ledger record ── succeeded ──► reuse artifact, next stage
//!       │
//!       ├─ skipped / failed-terminal ──► final, no collaborator call
//!       │
//!       └─ otherwise:  upsert in-progress ─► call (timeout) ─► upsert outcome
//!                            ▲                                   │
//!                            └──── backoff ◄── failed-retryable ─┘
//! ```
//!
//! Every upsert is followed by one [`StageTransition`] (tracing event,
//! JSON-lines file, broadcast channel, ledger event row).
//!
//! ## Threading
//!
//! `run` is synchronous and blocks for the whole pipeline. Hosts running many
//! recordings call it from `tokio::task::spawn_blocking`, one task per run;
//! the `Orchestrator` itself is `Send + Sync` and shared behind an `Arc`.
//! Each collaborator call runs on its own short-lived thread so a caller
//! timeout can be enforced without cooperation from the adapter.

pub mod artifacts;
pub mod cancel;
pub mod result;
pub mod retry;
mod stages;

pub use cancel::CancelToken;
pub use result::{PipelineResult, RunOptions, StageFailure};
pub use retry::RetryPolicy;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::audio::{AudioNormalizer, StubNormalizer};
use crate::enrich::{Enrichment, EnrichmentClient, StubEnricher};
use crate::error::{ErrorKind, KuralError, Result};
use crate::events::{StageTransition, TransitionLog};
use crate::inference::{StubTranscriber, Transcriber, Transcript};
use crate::ledger::StageLedger;
use crate::run::{input_fingerprint, path_fingerprint, PipelineRun, RunId, RunStatus};
use crate::stage::Stage;
use crate::synth::{StubSynthesizer, Synthesizer};
use crate::translate::{StubTranslator, Translator};

use artifacts::ArtifactStore;
use stages::StageOutcome;

/// Transition channel capacity: slow subscribers lag rather than block runs.
const BROADCAST_CAP: usize = 256;

/// Configuration for `Orchestrator`. Immutable once the orchestrator is built.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sample rate of the normalized audio (Hz). Default: 16000.
    pub target_sample_rate: u32,
    /// Channel count of the normalized audio. Default: 1.
    pub target_channels: u16,
    /// Language hint handed to the transcriber. Default: "ta".
    pub source_language: String,
    /// Retry policy per stage; stages missing here use `RetryPolicy::default()`.
    pub retry: BTreeMap<Stage, RetryPolicy>,
    /// Caller-side timeout per collaborator call. `None` waits forever.
    pub call_timeouts: BTreeMap<Stage, Duration>,
    /// Transcripts shorter than this (after trimming) are rejected. Default: 10.
    pub min_transcript_chars: usize,
    /// Inputs larger than this are rejected before decoding. Default: 50 MiB.
    pub max_input_bytes: u64,
    /// Translations shorter than this (after trimming) are rejected. Default: 5.
    pub min_translation_chars: usize,
    /// Speech files smaller than this are rejected. Default: 1 KiB.
    pub min_speech_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let call_timeouts = [
            (Stage::Normalize, 120),
            (Stage::Transcribe, 600),
            (Stage::Enrich, 60),
            (Stage::Translate, 60),
            (Stage::Synthesize, 120),
        ]
        .into_iter()
        .map(|(stage, secs)| (stage, Duration::from_secs(secs)))
        .collect();

        Self {
            target_sample_rate: 16_000,
            target_channels: 1,
            source_language: "ta".to_string(),
            retry: Stage::ORDER
                .into_iter()
                .map(|s| (s, RetryPolicy::default()))
                .collect(),
            call_timeouts,
            min_transcript_chars: 10,
            max_input_bytes: 50 * 1024 * 1024,
            min_translation_chars: 5,
            min_speech_bytes: 1024,
        }
    }
}

impl EngineConfig {
    pub fn retry_policy(&self, stage: Stage) -> RetryPolicy {
        self.retry.get(&stage).cloned().unwrap_or_default()
    }

    pub fn call_timeout(&self, stage: Stage) -> Option<Duration> {
        self.call_timeouts.get(&stage).copied()
    }

    pub fn with_retry(mut self, stage: Stage, policy: RetryPolicy) -> Self {
        self.retry.insert(stage, policy);
        self
    }

    /// Apply `policy` to every stage.
    pub fn with_retry_all(mut self, policy: RetryPolicy) -> Self {
        for stage in Stage::ORDER {
            self.retry.insert(stage, policy.clone());
        }
        self
    }

    pub fn with_call_timeout(mut self, stage: Stage, timeout: Option<Duration>) -> Self {
        match timeout {
            Some(t) => self.call_timeouts.insert(stage, t),
            None => self.call_timeouts.remove(&stage),
        };
        self
    }
}

/// The five capability backends a run needs.
#[derive(Clone)]
pub struct Collaborators {
    pub normalizer: Arc<dyn AudioNormalizer>,
    pub transcriber: Arc<dyn Transcriber>,
    pub enricher: Arc<dyn EnrichmentClient>,
    pub translator: Arc<dyn Translator>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

impl Collaborators {
    /// Deterministic in-process backends; no external tools or network.
    pub fn stubs() -> Self {
        Self {
            normalizer: Arc::new(StubNormalizer::new()),
            transcriber: Arc::new(StubTranscriber::new()),
            enricher: Arc::new(StubEnricher::new()),
            translator: Arc::new(StubTranslator::new()),
            synthesizer: Arc::new(StubSynthesizer::new()),
        }
    }
}

/// Per-run state threaded through every stage. Owned by one `run` call.
pub(crate) struct RunContext<'a> {
    pub run_id: RunId,
    pub input: PathBuf,
    pub options: &'a RunOptions,
    pub artifacts: ArtifactStore,
    pub transitions: TransitionLog,
    pub cancel: &'a CancelToken,
}

/// Artifacts of completed stages, as consumed by the next stage.
#[derive(Default)]
pub(crate) struct Carried {
    pub normalized: Option<PathBuf>,
    pub transcript: Option<Transcript>,
    pub enrichment: Option<Enrichment>,
    pub translation: Option<String>,
}

pub struct Orchestrator {
    config: EngineConfig,
    collaborators: Collaborators,
    ledger: Arc<dyn StageLedger>,
    transition_tx: broadcast::Sender<StageTransition>,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        collaborators: Collaborators,
        ledger: Arc<dyn StageLedger>,
    ) -> Self {
        let (transition_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            config,
            collaborators,
            ledger,
            transition_tx,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<dyn StageLedger> {
        &self.ledger
    }

    /// Receive every stage transition of every run driven by this orchestrator.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StageTransition> {
        self.transition_tx.subscribe()
    }

    /// Run (or resume) the pipeline for `input` to completion.
    pub fn run(&self, input: &Path, options: &RunOptions) -> Result<PipelineResult> {
        self.run_with_cancel(input, options, &CancelToken::new())
    }

    /// As [`Orchestrator::run`], checking `cancel` before each stage and
    /// during retry backoff.
    ///
    /// `Err` is returned only when no run could be opened (unknown resume id,
    /// unusable output directory, ledger unreachable). Once a run exists,
    /// every failure is reported inside the `PipelineResult`.
    pub fn run_with_cancel(
        &self,
        input: &Path,
        options: &RunOptions,
        cancel: &CancelToken,
    ) -> Result<PipelineResult> {
        std::fs::create_dir_all(&options.output_dir)?;
        let mut run = self.open_run(input, options)?;
        let started_at = Utc::now();

        run.status = RunStatus::Running;
        run.updated_at = started_at;
        self.ledger.put_run(&run)?;

        let artifacts = ArtifactStore::new(options.output_dir.clone(), run.run_id.clone());
        let ctx = RunContext {
            run_id: run.run_id.clone(),
            input: run.input.clone(),
            options,
            transitions: TransitionLog::new(artifacts.path(artifacts::TRANSITIONS_JSONL)),
            artifacts,
            cancel,
        };
        info!(
            run_id = %ctx.run_id,
            input = %ctx.input.display(),
            resumed = options.resume.is_some(),
            enrichment = options.enrichment_enabled,
            target_language = %options.target_language,
            "pipeline run starting"
        );

        let mut carried = Carried::default();
        let mut produced = BTreeMap::new();
        let mut last_completed = None;
        let mut failure = None;
        let mut degraded = Vec::new();
        let mut halted = None;

        for stage in Stage::ORDER {
            if cancel.is_cancelled() {
                info!(run_id = %ctx.run_id, stage = %stage, "run cancelled before stage");
                halted = Some(RunStatus::Cancelled);
                break;
            }

            run.current_stage = Some(stage);
            run.updated_at = Utc::now();
            let outcome = self
                .ledger
                .put_run(&run)
                .and_then(|()| self.drive_stage(&ctx, stage, &mut carried));

            match outcome {
                Ok(StageOutcome::Done(artifact)) => {
                    produced.insert(stage, artifact);
                    last_completed = Some(stage);
                }
                Ok(StageOutcome::Skipped) => {}
                Ok(StageOutcome::Failed(f)) if stage.is_optional() => {
                    warn!(
                        run_id = %ctx.run_id,
                        stage = %stage,
                        kind = %f.kind,
                        "optional stage failed; continuing without it"
                    );
                    degraded.push(f);
                }
                Ok(StageOutcome::Failed(f)) => {
                    error!(
                        run_id = %ctx.run_id,
                        stage = %stage,
                        kind = %f.kind,
                        attempts = f.attempts,
                        message = %f.message,
                        "stage failed; halting run"
                    );
                    failure = Some(f);
                    halted = Some(RunStatus::Failed);
                    break;
                }
                Ok(StageOutcome::Cancelled) => {
                    info!(run_id = %ctx.run_id, stage = %stage, "run cancelled during backoff");
                    halted = Some(RunStatus::Cancelled);
                    break;
                }
                Err(e) => {
                    error!(run_id = %ctx.run_id, stage = %stage, error = %e, "ledger failure; abandoning run attempt");
                    failure = Some(StageFailure {
                        stage,
                        kind: ErrorKind::Ledger,
                        message: e.to_string(),
                        attempts: 0,
                    });
                    halted = Some(RunStatus::Failed);
                    break;
                }
            }
        }

        let status = halted.unwrap_or(if degraded.is_empty() {
            RunStatus::Succeeded
        } else {
            RunStatus::PartiallySucceeded
        });
        run.status = status;
        run.updated_at = Utc::now();
        if let Err(e) = self.ledger.put_run(&run) {
            error!(run_id = %ctx.run_id, error = %e, "could not record final run status");
        }

        let stages = self.ledger.records_for_run(&ctx.run_id).unwrap_or_else(|e| {
            warn!(run_id = %ctx.run_id, error = %e, "could not read stage records for summary");
            Vec::new()
        });

        let result = PipelineResult {
            run_id: ctx.run_id.clone(),
            input: ctx.input.clone(),
            status,
            stages,
            artifacts: produced,
            last_completed_stage: last_completed,
            failure,
            degraded,
            transcript: carried.transcript,
            enriched_text: carried.enrichment.map(|e| e.text),
            translation: carried.translation,
            started_at,
            finished_at: Utc::now(),
        };

        if let Err(e) = ctx.artifacts.write_json(artifacts::SUMMARY_JSON, &result) {
            warn!(run_id = %ctx.run_id, error = %e, "could not write run summary");
        }
        info!(
            run_id = %ctx.run_id,
            status = %result.status,
            last_completed = result.last_completed_stage.map(Stage::label),
            duration_seconds = result.duration_seconds(),
            "pipeline run finished"
        );
        Ok(result)
    }

    /// Load the run named by `options.resume`, or register a fresh one.
    fn open_run(&self, input: &Path, options: &RunOptions) -> Result<PipelineRun> {
        if let Some(run_id) = &options.resume {
            let run = self
                .ledger
                .get_run(run_id)?
                .ok_or_else(|| KuralError::RunNotFound(run_id.to_string()))?;
            if run.input != input {
                warn!(
                    run_id = %run_id,
                    recorded = %run.input.display(),
                    given = %input.display(),
                    "resuming with the recorded input, not the one given"
                );
            }
            return Ok(run);
        }

        let now = Utc::now();
        let fingerprint = input_fingerprint(input).unwrap_or_else(|e| {
            debug!(input = %input.display(), error = %e, "input not readable; fingerprinting path only");
            path_fingerprint(input)
        });
        let stem = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("input");

        // Same file started more than once within one second: the first
        // caller claims the base id, later ones take `-2`, `-3`, ...
        let base = RunId::derive(stem, &fingerprint, now);
        let mut run = PipelineRun::new(base.clone(), input.to_path_buf(), fingerprint, now);
        let mut n = 1;
        while !self.ledger.create_run(&run)? {
            n += 1;
            run.run_id = RunId::from(format!("{base}-{n}"));
        }
        Ok(run)
    }
}
