//! Stage execution: the bounded attempt loop and one invocation per stage.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::artifacts::{self, discard, promote, read_text, speech_suffix};
use super::retry::call_with_timeout;
use super::{Carried, Orchestrator, RunContext, StageFailure};
use crate::audio::validate_input;
use crate::enrich::Enrichment;
use crate::error::{ErrorKind, LedgerResult, StageError, StageResult};
use crate::events::StageTransition;
use crate::inference::Transcript;
use crate::stage::{Stage, StageRecord, StageStatus};

pub(crate) enum StageOutcome {
    Done(PathBuf),
    Skipped,
    Failed(StageFailure),
    Cancelled,
}

/// What a successful invocation hands to the following stages.
enum Payload {
    Normalized,
    Transcript(Transcript),
    Enrichment(Enrichment),
    Translation(String),
    Speech,
}

struct Produced {
    artifact: PathBuf,
    payload: Payload,
}

impl Payload {
    fn apply(self, artifact: &Path, carried: &mut Carried) {
        match self {
            Payload::Normalized => carried.normalized = Some(artifact.to_path_buf()),
            Payload::Transcript(t) => carried.transcript = Some(t),
            Payload::Enrichment(e) => carried.enrichment = Some(e),
            Payload::Translation(t) => carried.translation = Some(t),
            Payload::Speech => {}
        }
    }
}

impl Orchestrator {
    /// Bring one stage to a final state for this invocation.
    ///
    /// `Err` means the ledger itself failed; the run attempt must stop.
    pub(super) fn drive_stage(
        &self,
        ctx: &RunContext<'_>,
        stage: Stage,
        carried: &mut Carried,
    ) -> LedgerResult<StageOutcome> {
        let mut record = self
            .ledger
            .get_record(&ctx.run_id, stage)?
            .unwrap_or_else(|| StageRecord::new(ctx.run_id.clone(), stage));

        match record.status {
            StageStatus::Succeeded => return Ok(self.reuse(ctx, &record, carried)),
            StageStatus::Skipped => {
                debug!(run_id = %ctx.run_id, stage = %stage, "stage previously skipped");
                return Ok(StageOutcome::Skipped);
            }
            StageStatus::FailedTerminal => {
                let error = record.last_error.clone().unwrap_or_else(|| {
                    StageError::new(ErrorKind::InvalidInput, "stage previously failed")
                });
                info!(
                    run_id = %ctx.run_id,
                    stage = %stage,
                    kind = %error.kind,
                    "stage failed terminally on an earlier invocation; not retrying"
                );
                return Ok(StageOutcome::Failed(StageFailure::new(
                    stage,
                    &error,
                    record.attempts,
                )));
            }
            StageStatus::NotStarted | StageStatus::InProgress | StageStatus::FailedRetryable => {}
        }

        if stage.is_optional() && !ctx.options.enrichment_enabled {
            if record.status == StageStatus::NotStarted {
                record.skip(Utc::now());
                self.persist(ctx, &record, Duration::ZERO)?;
            } else {
                debug!(
                    run_id = %ctx.run_id,
                    stage = %stage,
                    status = %record.status,
                    "stage disabled for this invocation; earlier record left as is"
                );
            }
            return Ok(StageOutcome::Skipped);
        }

        let policy = self.config.retry_policy(stage);
        let timeout = self.config.call_timeout(stage);

        loop {
            if record.attempts >= policy.max_attempts {
                // Budget spent by earlier invocations (including interrupted ones).
                let error = record.last_error.clone().unwrap_or_else(|| {
                    StageError::new(ErrorKind::Timeout, "attempt interrupted before completing")
                });
                record.fail(error.clone(), false, Utc::now());
                self.persist(ctx, &record, Duration::ZERO)?;
                return Ok(StageOutcome::Failed(StageFailure::new(
                    stage,
                    &error,
                    record.attempts,
                )));
            }

            record.begin_attempt(Utc::now());
            self.persist(ctx, &record, Duration::ZERO)?;

            let started = Instant::now();
            let result = self.invoke(ctx, stage, record.attempts, carried, timeout);
            let elapsed = started.elapsed();

            match result {
                Ok(Produced { artifact, payload }) => {
                    record.succeed(artifact.clone(), Utc::now());
                    self.persist(ctx, &record, elapsed)?;
                    payload.apply(&artifact, carried);
                    return Ok(StageOutcome::Done(artifact));
                }
                Err(error) => {
                    let retryable = policy.is_retryable(error.kind)
                        && record.attempts < policy.max_attempts;
                    warn!(
                        run_id = %ctx.run_id,
                        stage = %stage,
                        attempt = record.attempts,
                        kind = %error.kind,
                        retryable,
                        error = %error.message,
                        "stage attempt failed"
                    );
                    record.fail(error.clone(), retryable, Utc::now());
                    self.persist(ctx, &record, elapsed)?;
                    if !retryable {
                        return Ok(StageOutcome::Failed(StageFailure::new(
                            stage,
                            &error,
                            record.attempts,
                        )));
                    }

                    let delay = policy.delay_after(record.attempts);
                    debug!(
                        run_id = %ctx.run_id,
                        stage = %stage,
                        delay_ms = delay.as_millis() as u64,
                        "backing off before retry"
                    );
                    if ctx.cancel.sleep(delay) {
                        return Ok(StageOutcome::Cancelled);
                    }
                }
            }
        }
    }

    /// Upsert `record`, then emit its transition on every sink.
    fn persist(
        &self,
        ctx: &RunContext<'_>,
        record: &StageRecord,
        elapsed: Duration,
    ) -> LedgerResult<()> {
        self.ledger.upsert(record)?;

        let failed = matches!(
            record.status,
            StageStatus::FailedRetryable | StageStatus::FailedTerminal
        );
        let transition = StageTransition {
            run_id: record.run_id.clone(),
            stage: record.stage,
            status: record.status,
            attempt: record.attempts,
            duration_seconds: elapsed.as_secs_f64(),
            error_kind: if failed { record.error_kind() } else { None },
            at: Utc::now(),
        };
        transition.trace();
        if let Err(e) = ctx.transitions.append(&transition) {
            warn!(path = %ctx.transitions.path().display(), error = %e, "could not append transition log");
        }
        self.ledger.append_event(&transition)?;
        // No subscribers is not an error.
        let _ = self.transition_tx.send(transition);
        Ok(())
    }

    /// Reuse the artifact of an already-succeeded stage.
    fn reuse(&self, ctx: &RunContext<'_>, record: &StageRecord, carried: &mut Carried) -> StageOutcome {
        let loaded = record
            .artifact
            .clone()
            .ok_or_else(|| {
                StageError::new(ErrorKind::ArtifactIo, "succeeded record has no artifact")
            })
            .and_then(|artifact| {
                load_artifact(record.stage, &artifact).map(|payload| (artifact, payload))
            });

        match loaded {
            Ok((artifact, payload)) => {
                info!(
                    run_id = %ctx.run_id,
                    stage = %record.stage,
                    artifact = %artifact.display(),
                    "stage already succeeded; reusing artifact"
                );
                payload.apply(&artifact, carried);
                StageOutcome::Done(artifact)
            }
            Err(error) => {
                warn!(
                    run_id = %ctx.run_id,
                    stage = %record.stage,
                    error = %error,
                    "succeeded stage's artifact is unusable"
                );
                StageOutcome::Failed(StageFailure::new(record.stage, &error, record.attempts))
            }
        }
    }

    fn invoke(
        &self,
        ctx: &RunContext<'_>,
        stage: Stage,
        attempt: u32,
        carried: &Carried,
        timeout: Option<Duration>,
    ) -> StageResult<Produced> {
        match stage {
            Stage::Normalize => {
                let final_path = ctx.artifacts.path(artifacts::NORMALIZED);
                let staging = ctx.artifacts.staging(&final_path, attempt);
                let normalizer = Arc::clone(&self.collaborators.normalizer);
                let input = ctx.input.clone();
                let target = staging.clone();
                let max_bytes = self.config.max_input_bytes;
                let rate = self.config.target_sample_rate;
                let channels = self.config.target_channels;

                let written = call_with_timeout(timeout, move || {
                    validate_input(&input, max_bytes, normalizer.supported_extensions())?;
                    normalizer.normalize(&input, &target, rate, channels)
                })
                .inspect_err(|_| discard(&staging))?;
                promote(&written, &final_path)?;
                Ok(Produced {
                    artifact: final_path,
                    payload: Payload::Normalized,
                })
            }

            Stage::Transcribe => {
                let audio = carried
                    .normalized
                    .clone()
                    .ok_or_else(|| missing_input(Stage::Normalize))?;
                let transcriber = Arc::clone(&self.collaborators.transcriber);
                let hint = self.config.source_language.clone();

                let transcript =
                    call_with_timeout(timeout, move || transcriber.transcribe(&audio, &hint))?;
                let chars = transcript.text.trim().chars().count();
                if chars < self.config.min_transcript_chars {
                    return Err(StageError::new(
                        ErrorKind::EmptyOutput,
                        format!(
                            "transcript has {chars} characters, need at least {}",
                            self.config.min_transcript_chars
                        ),
                    ));
                }
                ctx.artifacts
                    .write_text(artifacts::TRANSCRIPT_TXT, transcript.text.trim())?;
                let artifact = ctx
                    .artifacts
                    .write_json(artifacts::TRANSCRIPT_JSON, &transcript)?;
                Ok(Produced {
                    artifact,
                    payload: Payload::Transcript(transcript),
                })
            }

            Stage::Enrich => {
                let text = carried
                    .transcript
                    .as_ref()
                    .map(|t| t.text.clone())
                    .ok_or_else(|| missing_input(Stage::Transcribe))?;
                let enricher = Arc::clone(&self.collaborators.enricher);

                let enrichment = call_with_timeout(timeout, move || enricher.enrich(&text))?;
                if enrichment.text.trim().is_empty() {
                    return Err(StageError::new(
                        ErrorKind::EmptyOutput,
                        "enrichment returned no text",
                    ));
                }
                ctx.artifacts
                    .write_json(artifacts::ENRICHED_JSON, &enrichment.raw)?;
                let artifact = ctx
                    .artifacts
                    .write_text(artifacts::ENRICHED_TXT, &enrichment.text)?;
                Ok(Produced {
                    artifact,
                    payload: Payload::Enrichment(enrichment),
                })
            }

            Stage::Translate => {
                let (source, from_enrichment) = translation_source(ctx, carried)?;
                let translator = Arc::clone(&self.collaborators.translator);
                let translator_name = translator.name().to_string();
                let target = ctx.options.target_language.clone();
                let text = source.clone();

                let translation =
                    call_with_timeout(timeout, move || translator.translate(&text, &target))?;
                let translation = translation.trim().to_string();
                let chars = translation.chars().count();
                if chars < self.config.min_translation_chars {
                    return Err(StageError::new(
                        ErrorKind::EmptyOutput,
                        format!(
                            "translation has {chars} characters, need at least {}",
                            self.config.min_translation_chars
                        ),
                    ));
                }
                ctx.artifacts.write_json(
                    artifacts::TRANSLATION_JSON,
                    &TranslationDetails {
                        original_text: &source,
                        translated_text: &translation,
                        target_language: &ctx.options.target_language,
                        translator: &translator_name,
                        from_enrichment,
                    },
                )?;
                let artifact = ctx
                    .artifacts
                    .write_text(artifacts::TRANSLATION_TXT, &translation)?;
                Ok(Produced {
                    artifact,
                    payload: Payload::Translation(translation),
                })
            }

            Stage::Synthesize => {
                let text = carried
                    .translation
                    .clone()
                    .ok_or_else(|| missing_input(Stage::Translate))?;
                let synthesizer = Arc::clone(&self.collaborators.synthesizer);
                let synthesizer_name = synthesizer.name().to_string();
                let final_path = ctx
                    .artifacts
                    .path(&speech_suffix(synthesizer.file_extension()));
                let staging = ctx.artifacts.staging(&final_path, attempt);
                let target = staging.clone();
                let language = ctx.options.target_language.clone();
                let spoken = text.clone();

                let written = call_with_timeout(timeout, move || {
                    synthesizer.synthesize(&spoken, &language, &target)
                })
                .inspect_err(|_| discard(&staging))?;
                let audio_bytes = self
                    .check_speech(&written)
                    .inspect_err(|_| discard(&written))?;
                promote(&written, &final_path)?;
                ctx.artifacts.write_json(
                    artifacts::SPEECH_JSON,
                    &SpeechDetails {
                        text: &text,
                        language: &ctx.options.target_language,
                        audio_path: &final_path,
                        audio_bytes,
                        synthesizer: &synthesizer_name,
                        created_at: Utc::now(),
                    },
                )?;
                Ok(Produced {
                    artifact: final_path,
                    payload: Payload::Speech,
                })
            }
        }
    }
}

/// Text handed to the translator: the transcript, or the enrichment output
/// when the run wires it in and enrichment produced something. The flag is
/// true in the latter case.
fn translation_source(ctx: &RunContext<'_>, carried: &Carried) -> StageResult<(String, bool)> {
    if ctx.options.translate_enriched {
        if let Some(enrichment) = &carried.enrichment {
            return Ok((enrichment.text.clone(), true));
        }
    }
    carried
        .transcript
        .as_ref()
        .map(|t| (t.text.clone(), false))
        .ok_or_else(|| missing_input(Stage::Transcribe))
}

impl Orchestrator {
    /// Size of a synthesized file, or `EmptyOutput` if it is missing or too
    /// small to hold any speech.
    fn check_speech(&self, written: &Path) -> StageResult<u64> {
        let bytes = std::fs::metadata(written).map(|m| m.len()).map_err(|e| {
            StageError::new(
                ErrorKind::EmptyOutput,
                format!("synthesizer produced no file at {}: {e}", written.display()),
            )
        })?;
        if bytes < self.config.min_speech_bytes {
            return Err(StageError::new(
                ErrorKind::EmptyOutput,
                format!(
                    "speech file is {bytes} bytes, need at least {}",
                    self.config.min_speech_bytes
                ),
            ));
        }
        Ok(bytes)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TranslationDetails<'a> {
    original_text: &'a str,
    translated_text: &'a str,
    target_language: &'a str,
    translator: &'a str,
    from_enrichment: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechDetails<'a> {
    text: &'a str,
    language: &'a str,
    audio_path: &'a Path,
    audio_bytes: u64,
    synthesizer: &'a str,
    created_at: DateTime<Utc>,
}

/// Rebuild the payload of a succeeded stage from its artifact on disk.
fn load_artifact(stage: Stage, artifact: &Path) -> StageResult<Payload> {
    if !artifact.is_file() {
        return Err(StageError::new(
            ErrorKind::ArtifactIo,
            format!("artifact {} is missing", artifact.display()),
        ));
    }
    Ok(match stage {
        Stage::Normalize => Payload::Normalized,
        Stage::Transcribe => {
            let raw = read_text(artifact)?;
            let transcript: Transcript = serde_json::from_str(&raw)
                .map_err(|e| artifacts::artifact_error(artifact, e))?;
            Payload::Transcript(transcript)
        }
        Stage::Enrich => Payload::Enrichment(Enrichment {
            text: read_text(artifact)?,
            raw: serde_json::Value::Null,
        }),
        Stage::Translate => Payload::Translation(read_text(artifact)?),
        Stage::Synthesize => Payload::Speech,
    })
}

fn missing_input(predecessor: Stage) -> StageError {
    StageError::new(
        ErrorKind::ArtifactIo,
        format!("no {predecessor} artifact available"),
    )
}
