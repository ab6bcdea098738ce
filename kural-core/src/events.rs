//! Stage transition records.
//!
//! Every status change of a stage record produces one [`StageTransition`].
//! It is emitted three ways, synchronously and in this order:
//!
//! | Sink | Consumer |
//! |------|----------|
//! | `tracing` event, target `kural::transition` | log collectors |
//! | `<output_dir>/<run_id>_transitions.jsonl` | external tooling, offline replay |
//! | `tokio::sync::broadcast` | in-process subscribers (CLI progress) |
//!
//! The JSON shape is stable: `runId, stage, status, attempt,
//! durationSeconds, errorKind?, at`.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ErrorKind;
use crate::run::RunId;
use crate::stage::{Stage, StageStatus};

/// One structured log record per stage transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTransition {
    pub run_id: RunId,
    pub stage: Stage,
    pub status: StageStatus,
    pub attempt: u32,
    /// Wall-clock time spent in the attempt that produced this transition.
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub at: DateTime<Utc>,
}

impl StageTransition {
    /// Emit the record on the `kural::transition` tracing target.
    pub fn trace(&self) {
        info!(
            target: "kural::transition",
            run_id = %self.run_id,
            stage = %self.stage,
            status = %self.status,
            attempt = self.attempt,
            duration_seconds = self.duration_seconds,
            error_kind = self.error_kind.map(ErrorKind::as_str),
            "stage transition"
        );
    }
}

/// Append-only JSON-lines file of transitions for a single run.
#[derive(Debug, Clone)]
pub struct TransitionLog {
    path: PathBuf,
}

impl TransitionLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, transition: &StageTransition) -> std::io::Result<()> {
        let line = serde_json::to_string(transition).map_err(std::io::Error::other)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        file.flush()
    }

    /// Read every record back. Torn trailing lines (crash mid-write) are skipped.
    pub fn read_all(&self) -> std::io::Result<Vec<StageTransition>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut out = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StageTransition>(&line) {
                Ok(t) => out.push(t),
                Err(e) => warn!(path = %self.path.display(), error = %e, "skipping torn transition line"),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(status: StageStatus, error_kind: Option<ErrorKind>) -> StageTransition {
        StageTransition {
            run_id: RunId::from("clip-abcdef01-20240101T000000Z"),
            stage: Stage::Translate,
            status,
            attempt: 2,
            duration_seconds: 0.25,
            error_kind,
            at: Utc::now(),
        }
    }

    #[test]
    fn transition_serializes_with_camel_case_fields() {
        let t = sample(StageStatus::FailedRetryable, Some(ErrorKind::ServiceUnavailable));
        let json = serde_json::to_value(&t).expect("serialize transition");
        assert_eq!(json["runId"], "clip-abcdef01-20240101T000000Z");
        assert_eq!(json["stage"], "translate");
        assert_eq!(json["status"], "failed-retryable");
        assert_eq!(json["attempt"], 2);
        assert_eq!(json["errorKind"], "service_unavailable");
        let d = json["durationSeconds"]
            .as_f64()
            .expect("duration should serialize as number");
        approx::assert_relative_eq!(d, 0.25);
    }

    #[test]
    fn error_kind_is_omitted_when_absent() {
        let json = serde_json::to_value(sample(StageStatus::Succeeded, None)).expect("serialize");
        assert!(json.get("errorKind").is_none());
    }

    #[test]
    fn log_appends_and_reads_back_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = TransitionLog::new(dir.path().join("run_transitions.jsonl"));
        log.append(&sample(StageStatus::InProgress, None)).expect("append");
        log.append(&sample(StageStatus::Succeeded, None)).expect("append");

        let back = log.read_all().expect("read");
        let statuses: Vec<_> = back.iter().map(|t| t.status).collect();
        assert_eq!(statuses, vec![StageStatus::InProgress, StageStatus::Succeeded]);
    }

    #[test]
    fn torn_trailing_line_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = TransitionLog::new(dir.path().join("t.jsonl"));
        log.append(&sample(StageStatus::InProgress, None)).expect("append");
        let mut f = OpenOptions::new()
            .append(true)
            .open(log.path())
            .expect("open");
        write!(f, "{{\"runId\":\"trunc").expect("write torn line");
        drop(f);

        assert_eq!(log.read_all().expect("read").len(), 1);
    }

    #[test]
    fn missing_log_reads_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = TransitionLog::new(dir.path().join("none.jsonl"));
        assert!(log.read_all().expect("read").is_empty());
    }
}
