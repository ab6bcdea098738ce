//! Subcommand handlers.
//!
//! `run_batch` fans inputs out over `spawn_blocking`, one orchestrator run per
//! task, bounded by a semaphore. Everything else is a read-only ledger query.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use kural_core::run::input_fingerprint;
use kural_core::{
    CancelToken, PipelineResult, RunId, RunOptions, RunStatus, SqliteLedger, StageLedger,
    StageTransition,
};
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, warn};

use crate::state::AppState;

/// Extensions picked up by `--input-dir`.
pub const AUDIO_EXTENSIONS: [&str; 5] = ["wav", "mp3", "m4a", "flac", "ogg"];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Runs that could not even be opened.
    pub errored: usize,
}

impl BatchSummary {
    fn record(&mut self, status: RunStatus) {
        match status {
            RunStatus::Succeeded => self.succeeded += 1,
            RunStatus::PartiallySucceeded => self.partial += 1,
            RunStatus::Cancelled => self.cancelled += 1,
            RunStatus::Failed | RunStatus::Pending | RunStatus::Running => self.failed += 1,
        }
    }

    /// Exit code 0 only when nothing failed, errored or was cancelled.
    pub fn all_ok(&self) -> bool {
        self.failed == 0 && self.cancelled == 0 && self.errored == 0
    }
}

/// Explicit files first, then every audio file in `input_dir`, sorted.
pub fn collect_inputs(files: &[PathBuf], input_dir: Option<&Path>) -> anyhow::Result<Vec<PathBuf>> {
    let mut inputs = files.to_vec();
    if let Some(dir) = input_dir {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("reading input directory {}", dir.display()))?
        {
            let path = entry?.path();
            let is_audio = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| AUDIO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if path.is_file() && is_audio {
                found.push(path);
            }
        }
        found.sort();
        inputs.extend(found);
    }
    if inputs.is_empty() {
        anyhow::bail!("no input recordings given");
    }
    Ok(inputs)
}

/// Resume the newest unfinished run of `input`, if any.
fn resume_target(ledger: &SqliteLedger, input: &Path) -> Option<RunId> {
    let fingerprint = input_fingerprint(input).ok()?;
    match ledger.latest_run_for_input(&fingerprint) {
        Ok(Some(run)) if !run.status.is_success() => Some(run.run_id),
        Ok(_) => None,
        Err(e) => {
            warn!(input = %input.display(), error = %e, "could not look up earlier runs");
            None
        }
    }
}

pub async fn run_batch(
    state: &AppState,
    inputs: Vec<PathBuf>,
    template: RunOptions,
    resume_latest: bool,
) -> anyhow::Result<BatchSummary> {
    let limit = state.settings.max_parallel_runs;
    let semaphore = Arc::new(Semaphore::new(limit));
    let tokens: Vec<CancelToken> = inputs.iter().map(|_| CancelToken::new()).collect();

    let interrupt = {
        let tokens = tokens.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; cancelling runs after their current stage");
                for token in &tokens {
                    token.cancel();
                }
            }
        })
    };
    let progress = tokio::spawn(report_progress(
        state.orchestrator.subscribe_transitions(),
    ));

    info!(runs = inputs.len(), max_parallel_runs = limit, "starting batch");
    let mut handles = Vec::with_capacity(inputs.len());
    for (input, token) in inputs.into_iter().zip(tokens) {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .context("run semaphore closed")?;
        let orchestrator = state.orchestrator.clone();
        let ledger = state.ledger.clone();
        let mut options = template.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            if resume_latest {
                if let Some(run_id) = resume_target(&ledger, &input) {
                    info!(input = %input.display(), run_id = %run_id, "resuming earlier run");
                    options = options.resume(run_id);
                }
            }
            let outcome = orchestrator.run_with_cancel(&input, &options, &token);
            (input, outcome)
        }));
    }

    let mut summary = BatchSummary::default();
    for handle in handles {
        let (input, outcome) = handle.await.context("run task panicked")?;
        match outcome {
            Ok(result) => {
                print_result(&result);
                summary.record(result.status);
            }
            Err(e) => {
                error!(input = %input.display(), error = %e, "run could not start");
                println!("{}  error  {e}", input.display());
                summary.errored += 1;
            }
        }
    }

    interrupt.abort();
    progress.abort();
    info!(
        succeeded = summary.succeeded,
        partial = summary.partial,
        failed = summary.failed,
        cancelled = summary.cancelled,
        errored = summary.errored,
        "batch finished"
    );
    Ok(summary)
}

async fn report_progress(mut rx: broadcast::Receiver<StageTransition>) {
    loop {
        match rx.recv().await {
            Ok(t) => debug!(
                run_id = %t.run_id,
                stage = %t.stage,
                status = %t.status,
                attempt = t.attempt,
                "progress"
            ),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!(skipped = n, "progress reporter lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_result(result: &PipelineResult) {
    let last = result
        .last_completed_stage
        .map(|s| s.label())
        .unwrap_or("-");
    println!(
        "{}  {}  last={}  {:.1}s",
        result.run_id,
        result.status,
        last,
        result.duration_seconds()
    );
    if let Some(failure) = &result.failure {
        println!(
            "    {} failed after {} attempt(s): {} ({})",
            failure.stage, failure.attempts, failure.kind, failure.message
        );
    }
    for degraded in &result.degraded {
        println!("    {} degraded: {} ({})", degraded.stage, degraded.kind, degraded.message);
    }
    for (stage, path) in &result.artifacts {
        println!("    {:<10} {}", stage.label(), path.display());
    }
}

pub fn list_runs(ledger: &dyn StageLedger, limit: usize) -> anyhow::Result<()> {
    let runs = ledger.recent_runs(limit)?;
    if runs.is_empty() {
        println!("no runs recorded");
        return Ok(());
    }
    for run in runs {
        println!(
            "{}  {:<19}  {:<10}  {}  {}",
            run.run_id,
            run.status.as_str(),
            run.current_stage.map(|s| s.label()).unwrap_or("-"),
            run.updated_at.format("%Y-%m-%d %H:%M:%S"),
            run.input.display()
        );
    }
    Ok(())
}

pub fn show_status(ledger: &dyn StageLedger, run_id: &RunId, json: bool) -> anyhow::Result<()> {
    let run = ledger
        .get_run(run_id)?
        .with_context(|| format!("run {run_id} not found"))?;
    let records = ledger.records_for_run(run_id)?;

    if json {
        let body = serde_json::json!({ "run": run, "stages": records });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!("{}  {}  {}", run.run_id, run.status, run.input.display());
    for record in records {
        let error = record
            .last_error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default();
        println!(
            "    {:<10} {:<16} attempts={}  {}",
            record.stage.label(),
            record.status.as_str(),
            record.attempts,
            error
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kural_core::{MemoryLedger, PipelineRun};

    #[test]
    fn input_dir_contributes_sorted_audio_files_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["b.wav", "a.MP3", "notes.txt", "c.flac"] {
            std::fs::write(dir.path().join(name), b"x").expect("write");
        }
        let explicit = PathBuf::from("/elsewhere/first.wav");

        let inputs = collect_inputs(&[explicit.clone()], Some(dir.path())).expect("collect");
        assert_eq!(
            inputs,
            vec![
                explicit,
                dir.path().join("a.MP3"),
                dir.path().join("b.wav"),
                dir.path().join("c.flac"),
            ]
        );
    }

    #[test]
    fn no_inputs_is_an_error() {
        assert!(collect_inputs(&[], None).is_err());
    }

    #[test]
    fn summary_counts_failures_and_cancellations_as_not_ok() {
        let mut summary = BatchSummary::default();
        summary.record(RunStatus::Succeeded);
        summary.record(RunStatus::PartiallySucceeded);
        assert!(summary.all_ok());
        summary.record(RunStatus::Cancelled);
        assert!(!summary.all_ok());
        assert_eq!(summary.cancelled, 1);
    }

    #[test]
    fn status_of_unknown_run_is_an_error() {
        let ledger = MemoryLedger::new();
        assert!(show_status(&ledger, &RunId::from("missing"), false).is_err());
    }

    #[test]
    fn resume_target_skips_finished_runs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("clip.wav");
        std::fs::write(&input, b"RIFF").expect("write");
        let ledger = SqliteLedger::new(dir.path().join("ledger.db")).expect("ledger");
        let fingerprint = input_fingerprint(&input).expect("fingerprint");

        assert_eq!(resume_target(&ledger, &input), None);

        let mut run = PipelineRun::new(
            RunId::from("clip-1"),
            input.clone(),
            fingerprint,
            chrono::Utc::now(),
        );
        run.status = RunStatus::Cancelled;
        ledger.put_run(&run).expect("put");
        assert_eq!(resume_target(&ledger, &input), Some(RunId::from("clip-1")));

        run.status = RunStatus::Succeeded;
        ledger.put_run(&run).expect("put");
        assert_eq!(resume_target(&ledger, &input), None);
    }
}
