mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use approx::assert_abs_diff_eq;
use kural_core::engine::artifacts::{self, read_text};
use kural_core::enrich::StubEnricher;
use kural_core::error::StageResult;
use kural_core::events::TransitionLog;
use kural_core::inference::StubTranscriber;
use kural_core::synth::Synthesizer;
use kural_core::translate::{StubTranslator, Translator};
use kural_core::{
    Collaborators, EngineConfig, ErrorKind, PipelineResult, RunStatus, Stage, StageLedger,
    StageStatus,
};
use tokio::sync::broadcast::error::TryRecvError;

use common::*;

#[test]
fn ninety_second_recording_without_enrichment_succeeds() {
    let ws = Workspace::new();
    let input = ws.dir.path().join("interview.wav");
    write_recording(&input, 90.0, 22_050);

    let stubs = Stubs::default();
    let ledger = memory_ledger();
    let orch = orchestrator(stubs.collaborators_with_wav(), ledger.clone(), fast_config());

    let result = orch
        .run(&input, &ws.options().enrichment(false).target_language("ta"))
        .expect("run");

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.stages.len(), 5);
    let statuses: Vec<_> = result.stages.iter().map(|r| (r.stage, r.status)).collect();
    assert_eq!(
        statuses,
        vec![
            (Stage::Normalize, StageStatus::Succeeded),
            (Stage::Transcribe, StageStatus::Succeeded),
            (Stage::Enrich, StageStatus::Skipped),
            (Stage::Translate, StageStatus::Succeeded),
            (Stage::Synthesize, StageStatus::Succeeded),
        ]
    );
    assert_eq!(result.last_completed_stage, Some(Stage::Synthesize));
    assert!(result.failure.is_none());
    assert_eq!(stubs.enricher.calls(), 0);

    let normalized = &result.artifacts[&Stage::Normalize];
    let reader = hound::WavReader::open(normalized).expect("open normalized");
    let spec = reader.spec();
    assert_eq!(spec.sample_rate, 16_000);
    assert_eq!(spec.channels, 1);
    let seconds = reader.duration() as f64 / spec.sample_rate as f64;
    assert_abs_diff_eq!(seconds, 90.0, epsilon = 0.01);

    let transcript = read_text(&result.artifacts[&Stage::Transcribe]).expect("transcript");
    assert!(!transcript.trim().is_empty());
    let translation = read_text(&result.artifacts[&Stage::Translate]).expect("translation");
    assert!(!translation.trim().is_empty());
    let speech = &result.artifacts[&Stage::Synthesize];
    assert!(speech.is_file());
    assert!(std::fs::metadata(speech).expect("speech metadata").len() > 44);
}

#[test]
fn translator_recovers_on_third_attempt() {
    let ws = Workspace::new();
    let stubs = Stubs {
        translator: Arc::new(StubTranslator::new().with_failures([
            ErrorKind::ServiceUnavailable,
            ErrorKind::ServiceUnavailable,
        ])),
        ..Stubs::default()
    };
    let orch = orchestrator(stubs.collaborators(), memory_ledger(), fast_config());

    let result = orch.run(&ws.input, &ws.options()).expect("run");

    assert_eq!(result.status, RunStatus::Succeeded);
    let translate = result.record(Stage::Translate).expect("translate record");
    assert_eq!(translate.status, StageStatus::Succeeded);
    assert_eq!(translate.attempts, 3);
    assert!(translate.last_error.is_none());
    assert_eq!(stubs.translator.calls(), 3);
}

#[test]
fn always_retryable_failure_stops_at_max_attempts() {
    let ws = Workspace::new();
    let stubs = Stubs {
        translator: Arc::new(StubTranslator::new().always_failing(ErrorKind::RateLimited)),
        ..Stubs::default()
    };
    let config = EngineConfig::default()
        .with_retry_all(fast_retry(3))
        .with_retry(Stage::Translate, fast_retry(4));
    let orch = orchestrator(stubs.collaborators(), memory_ledger(), config);

    let result = orch.run(&ws.input, &ws.options()).expect("run");

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(stubs.translator.calls(), 4);
    let record = result.record(Stage::Translate).expect("translate record");
    assert_eq!(record.status, StageStatus::FailedTerminal);
    assert_eq!(record.attempts, 4);
    let failure = result.failure.expect("failure");
    assert_eq!(failure.stage, Stage::Translate);
    assert_eq!(failure.kind, ErrorKind::RateLimited);
    assert_eq!(failure.attempts, 4);
}

#[test]
fn terminal_error_halts_downstream_stages() {
    let ws = Workspace::new();
    let stubs = Stubs {
        transcriber: Arc::new(StubTranscriber::new().always_failing(ErrorKind::ModelUnavailable)),
        ..Stubs::default()
    };
    let orch = orchestrator(stubs.collaborators(), memory_ledger(), fast_config());

    let result = orch.run(&ws.input, &ws.options()).expect("run");

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.last_completed_stage, Some(Stage::Normalize));
    let failure = result.failure.as_ref().expect("failure");
    assert_eq!(failure.stage, Stage::Transcribe);
    assert_eq!(failure.kind, ErrorKind::ModelUnavailable);
    assert_eq!(failure.attempts, 1);

    assert_eq!(stubs.call_counts(), [1, 1, 0, 0, 0]);
    assert!(result.record(Stage::Translate).is_none());
    assert!(result.record(Stage::Synthesize).is_none());
    let store = ws.output.read_dir().expect("read output").filter_map(|e| e.ok());
    for entry in store {
        let name = entry.file_name().to_string_lossy().into_owned();
        assert!(!name.ends_with(artifacts::TRANSLATION_TXT), "unexpected {name}");
        assert!(!name.contains("_speech."), "unexpected {name}");
    }
}

#[test]
fn disabled_enrichment_passes_transcript_through_unchanged() {
    let ws = Workspace::new();
    let stubs = Stubs {
        transcriber: Arc::new(
            StubTranscriber::new().with_response("  vanakkam, this is the morning news  "),
        ),
        ..Stubs::default()
    };
    let orch = orchestrator(stubs.collaborators(), memory_ledger(), fast_config());

    let result = orch
        .run(&ws.input, &ws.options().enrichment(false).translate_enriched(true))
        .expect("run");

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(
        stubs.translator.inputs(),
        vec!["  vanakkam, this is the morning news  ".to_string()]
    );
    let enrich = result.record(Stage::Enrich).expect("enrich record");
    assert_eq!(enrich.status, StageStatus::Skipped);
    assert_eq!(enrich.attempts, 0);
}

#[test]
fn enrichment_output_is_informational_unless_wired() {
    let ws = Workspace::new();
    let stubs = Stubs::default();
    let orch = orchestrator(stubs.collaborators(), memory_ledger(), fast_config());

    let informational = orch.run(&ws.input, &ws.options()).expect("run");
    let wired = orch
        .run(&ws.input, &ws.options().translate_enriched(true))
        .expect("run");

    assert_eq!(informational.status, RunStatus::Succeeded);
    assert_eq!(wired.status, RunStatus::Succeeded);
    let inputs = stubs.translator.inputs();
    assert_eq!(inputs.len(), 2);
    assert_eq!(inputs[0], "stub transcript of the recording");
    assert_eq!(inputs[1], "[enriched] stub transcript of the recording");
    assert_eq!(
        informational.enriched_text.as_deref(),
        Some("[enriched] stub transcript of the recording")
    );
}

#[test]
fn failing_enrichment_degrades_run_to_partial_success() {
    let ws = Workspace::new();
    let stubs = Stubs {
        enricher: Arc::new(StubEnricher::new().always_failing(ErrorKind::AuthError)),
        ..Stubs::default()
    };
    let orch = orchestrator(stubs.collaborators(), memory_ledger(), fast_config());

    let result = orch
        .run(&ws.input, &ws.options().translate_enriched(true))
        .expect("run");

    assert_eq!(result.status, RunStatus::PartiallySucceeded);
    assert!(result.is_success());
    assert!(result.failure.is_none());
    assert_eq!(result.degraded.len(), 1);
    assert_eq!(result.degraded[0].stage, Stage::Enrich);
    assert_eq!(result.degraded[0].kind, ErrorKind::AuthError);
    assert_eq!(
        result.record(Stage::Enrich).map(|r| r.status),
        Some(StageStatus::FailedTerminal)
    );
    assert_eq!(
        stubs.translator.inputs(),
        vec!["stub transcript of the recording".to_string()]
    );
    assert_eq!(result.last_completed_stage, Some(Stage::Synthesize));
}

#[test]
fn short_transcript_is_rejected_as_empty_output() {
    let ws = Workspace::new();
    let stubs = Stubs {
        transcriber: Arc::new(StubTranscriber::new().with_response("  ok  ")),
        ..Stubs::default()
    };
    let orch = orchestrator(stubs.collaborators(), memory_ledger(), fast_config());

    let result = orch.run(&ws.input, &ws.options()).expect("run");

    assert_eq!(result.status, RunStatus::Failed);
    let failure = result.failure.expect("failure");
    assert_eq!(failure.stage, Stage::Transcribe);
    assert_eq!(failure.kind, ErrorKind::EmptyOutput);
    assert_eq!(stubs.transcriber.calls(), 1);
}

/// Answers every request with a bare acknowledgement.
struct CurtTranslator;

impl Translator for CurtTranslator {
    fn name(&self) -> &str {
        "curt"
    }

    fn translate(&self, _text: &str, _target_language: &str) -> StageResult<String> {
        Ok(" சரி ".to_string())
    }
}

/// Writes a few header bytes and no audio.
struct TruncatingSynthesizer;

impl Synthesizer for TruncatingSynthesizer {
    fn name(&self) -> &str {
        "truncating"
    }

    fn file_extension(&self) -> &str {
        "wav"
    }

    fn synthesize(&self, _text: &str, _language: &str, output: &Path) -> StageResult<PathBuf> {
        std::fs::write(output, b"RIFF\0\0\0\0WAVE").expect("write stub header");
        Ok(output.to_path_buf())
    }
}

#[test]
fn short_translation_is_rejected_as_empty_output() {
    let ws = Workspace::new();
    let stubs = Stubs::default();
    let collaborators = Collaborators {
        translator: Arc::new(CurtTranslator),
        ..stubs.collaborators()
    };
    let orch = orchestrator(collaborators, memory_ledger(), fast_config());

    let result = orch.run(&ws.input, &ws.options()).expect("run");

    assert_eq!(result.status, RunStatus::Failed);
    let failure = result.failure.expect("failure");
    assert_eq!(failure.stage, Stage::Translate);
    assert_eq!(failure.kind, ErrorKind::EmptyOutput);
    assert_eq!(failure.attempts, 1);
    assert_eq!(stubs.synthesizer.calls(), 0);
    assert!(!ws
        .output
        .join(format!("{}_{}", result.run_id, artifacts::TRANSLATION_TXT))
        .exists());
}

#[test]
fn undersized_speech_file_is_rejected_as_empty_output() {
    let ws = Workspace::new();
    let stubs = Stubs::default();
    let collaborators = Collaborators {
        synthesizer: Arc::new(TruncatingSynthesizer),
        ..stubs.collaborators()
    };
    let orch = orchestrator(collaborators, memory_ledger(), fast_config());

    let result = orch.run(&ws.input, &ws.options()).expect("run");

    assert_eq!(result.status, RunStatus::Failed);
    let failure = result.failure.expect("failure");
    assert_eq!(failure.stage, Stage::Synthesize);
    assert_eq!(failure.kind, ErrorKind::EmptyOutput);
    assert_eq!(failure.attempts, 1);
    let leftovers: Vec<_> = std::fs::read_dir(&ws.output)
        .expect("output dir")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains("speech"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

#[test]
fn translation_and_speech_details_are_recorded() {
    let ws = Workspace::new();
    let stubs = Stubs::default();
    let orch = orchestrator(stubs.collaborators(), memory_ledger(), fast_config());

    let result = orch
        .run(&ws.input, &ws.options().target_language("ta"))
        .expect("run");
    assert_eq!(result.status, RunStatus::Succeeded);

    let detail = |suffix: &str| -> serde_json::Value {
        let path = ws.output.join(format!("{}_{suffix}", result.run_id));
        serde_json::from_str(&read_text(&path).expect("details file")).expect("details json")
    };

    let translation = detail(artifacts::TRANSLATION_JSON);
    assert_eq!(translation["originalText"], "stub transcript of the recording");
    assert_eq!(
        translation["translatedText"],
        "[ta] stub transcript of the recording"
    );
    assert_eq!(translation["targetLanguage"], "ta");
    assert_eq!(translation["translator"], "stub");
    assert_eq!(translation["fromEnrichment"], false);

    let speech = detail(artifacts::SPEECH_JSON);
    let audio = &result.artifacts[&Stage::Synthesize];
    assert_eq!(speech["audioPath"], audio.to_string_lossy().as_ref());
    assert_eq!(
        speech["audioBytes"].as_u64(),
        Some(std::fs::metadata(audio).expect("speech metadata").len())
    );
    assert_eq!(speech["language"], "ta");
    assert_eq!(speech["text"], "[ta] stub transcript of the recording");
}

#[test]
fn missing_input_fails_normalize_without_calling_the_normalizer() {
    let ws = Workspace::new();
    let stubs = Stubs::default();
    let orch = orchestrator(stubs.collaborators(), memory_ledger(), fast_config());

    let missing = ws.dir.path().join("missing.wav");
    let result = orch.run(&missing, &ws.options()).expect("run");

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.last_completed_stage, None);
    let failure = result.failure.expect("failure");
    assert_eq!(failure.stage, Stage::Normalize);
    assert_eq!(failure.kind, ErrorKind::InvalidInput);
    assert_eq!(stubs.normalizer.calls(), 0);
}

#[test]
fn unsupported_extension_is_terminal() {
    let ws = Workspace::new();
    let notes = ws.dir.path().join("notes.txt");
    std::fs::write(&notes, "not audio").expect("write");
    let stubs = Stubs::default();
    let orch = orchestrator(stubs.collaborators(), memory_ledger(), fast_config());

    let result = orch.run(&notes, &ws.options()).expect("run");

    let failure = result.failure.expect("failure");
    assert_eq!(failure.kind, ErrorKind::UnsupportedFormat);
    assert_eq!(failure.attempts, 1);
}

#[test]
fn overrunning_call_times_out_and_is_retried() {
    let ws = Workspace::new();
    let stubs = Stubs {
        translator: Arc::new(StubTranslator::new().with_delay(Duration::from_millis(400))),
        ..Stubs::default()
    };
    let config = fast_config()
        .with_retry(Stage::Translate, fast_retry(2))
        .with_call_timeout(Stage::Translate, Some(Duration::from_millis(50)));
    let orch = orchestrator(stubs.collaborators(), memory_ledger(), config);

    let result = orch.run(&ws.input, &ws.options()).expect("run");

    assert_eq!(result.status, RunStatus::Failed);
    let record = result.record(Stage::Translate).expect("translate record");
    assert_eq!(record.status, StageStatus::FailedTerminal);
    assert_eq!(record.attempts, 2);
    assert_eq!(record.error_kind(), Some(ErrorKind::Timeout));
}

#[test]
fn transitions_reach_every_sink_in_the_same_order() {
    let ws = Workspace::new();
    let stubs = Stubs {
        translator: Arc::new(StubTranslator::new().with_failures([ErrorKind::Network])),
        ..Stubs::default()
    };
    let ledger = memory_ledger();
    let orch = orchestrator(stubs.collaborators(), ledger.clone(), fast_config());
    let mut rx = orch.subscribe_transitions();

    let result = orch.run(&ws.input, &ws.options()).expect("run");

    let from_ledger = ledger.events_for_run(&result.run_id).expect("events");
    let log_path = ws
        .output
        .join(format!("{}_{}", result.run_id, artifacts::TRANSITIONS_JSONL));
    let from_file = TransitionLog::new(log_path).read_all().expect("read log");
    let mut from_channel = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(t) => from_channel.push(t),
            Err(TryRecvError::Empty) => break,
            Err(e) => panic!("broadcast error: {e}"),
        }
    }

    let key = |t: &kural_core::StageTransition| (t.stage, t.status, t.attempt, t.error_kind, t.at);
    assert_eq!(
        from_ledger.iter().map(key).collect::<Vec<_>>(),
        from_file.iter().map(key).collect::<Vec<_>>()
    );
    assert_eq!(from_ledger, from_channel);
    let translate: Vec<_> = from_file
        .iter()
        .filter(|t| t.stage == Stage::Translate)
        .map(|t| (t.status, t.attempt, t.error_kind))
        .collect();
    assert_eq!(
        translate,
        vec![
            (StageStatus::InProgress, 1, None),
            (StageStatus::FailedRetryable, 1, Some(ErrorKind::Network)),
            (StageStatus::InProgress, 2, None),
            (StageStatus::Succeeded, 2, None),
        ]
    );
    // in-progress + succeeded per stage, plus one failed attempt and its retry
    assert_eq!(from_file.len(), 5 * 2 + 2);
    assert_stage_order(&from_file);
}

#[test]
fn summary_file_mirrors_the_returned_result() {
    let ws = Workspace::new();
    let orch = orchestrator(Stubs::default().collaborators(), memory_ledger(), fast_config());

    let result = orch.run(&ws.input, &ws.options()).expect("run");

    let summary = ws
        .output
        .join(format!("{}_{}", result.run_id, artifacts::SUMMARY_JSON));
    let raw = std::fs::read_to_string(summary).expect("summary");
    let parsed: PipelineResult = serde_json::from_str(&raw).expect("parse summary");
    assert_eq!(parsed.run_id, result.run_id);
    assert_eq!(parsed.status, RunStatus::Succeeded);
    assert_eq!(parsed.stages.len(), 5);
    assert_eq!(parsed.artifacts, result.artifacts);

    let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
    assert_eq!(value["status"], "succeeded");
    assert!(value.get("lastCompletedStage").is_some());
}

#[test]
fn pre_cancelled_run_touches_no_stage() {
    let ws = Workspace::new();
    let stubs = Stubs::default();
    let ledger = memory_ledger();
    let orch = orchestrator(stubs.collaborators(), ledger.clone(), fast_config());
    let cancel = kural_core::CancelToken::new();
    cancel.cancel();

    let result = orch
        .run_with_cancel(&ws.input, &ws.options(), &cancel)
        .expect("run");

    assert_eq!(result.status, RunStatus::Cancelled);
    assert!(result.stages.is_empty());
    assert_eq!(stubs.call_counts(), [0; 5]);
    let run = ledger
        .get_run(&result.run_id)
        .expect("get run")
        .expect("run exists");
    assert_eq!(run.status, RunStatus::Cancelled);
}
