//! Pipeline stages and their per-run records.
//!
//! ## Status machine
//!
//! ```text
//! not-started ─► in-progress ─► succeeded
//!      │              │ ▲
//!      │              ▼ │
//!      │        failed-retryable ─► failed-terminal
//!      └─► skipped
//! ```
//!
//! `in-progress → in-progress` is legal: a crash mid-call leaves the record
//! in-progress and the next invocation re-enters the stage. Nothing ever
//! leaves `succeeded`, `failed-terminal` or `skipped`.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, StageError};
use crate::run::RunId;

/// One discrete transformation in the fixed pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Normalize,
    Transcribe,
    Enrich,
    Translate,
    Synthesize,
}

impl Stage {
    /// Canonical execution order.
    pub const ORDER: [Stage; 5] = [
        Stage::Normalize,
        Stage::Transcribe,
        Stage::Enrich,
        Stage::Translate,
        Stage::Synthesize,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Normalize => "normalize",
            Self::Transcribe => "transcribe",
            Self::Enrich => "enrich",
            Self::Translate => "translate",
            Self::Synthesize => "synthesize",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ORDER.into_iter().find(|s| s.label() == raw)
    }

    /// Position in [`Stage::ORDER`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Optional stages never halt the pipeline.
    pub fn is_optional(self) -> bool {
        matches!(self, Self::Enrich)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Lifecycle of a single (run, stage) record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageStatus {
    NotStarted,
    InProgress,
    Succeeded,
    FailedRetryable,
    FailedTerminal,
    Skipped,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not-started",
            Self::InProgress => "in-progress",
            Self::Succeeded => "succeeded",
            Self::FailedRetryable => "failed-retryable",
            Self::FailedTerminal => "failed-terminal",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        [
            Self::NotStarted,
            Self::InProgress,
            Self::Succeeded,
            Self::FailedRetryable,
            Self::FailedTerminal,
            Self::Skipped,
        ]
        .into_iter()
        .find(|s| s.as_str() == raw)
    }

    /// No further transitions are possible out of this status.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Succeeded | Self::FailedTerminal | Self::Skipped)
    }

    /// Whether a record may move from `self` to `next`.
    ///
    /// Rewriting a final status with itself is allowed so upserts stay idempotent.
    pub fn can_transition_to(self, next: StageStatus) -> bool {
        use StageStatus::*;
        match (self, next) {
            (a, b) if a.is_final() => a == b,
            (NotStarted, NotStarted | InProgress | Skipped | FailedTerminal) => true,
            (InProgress, InProgress | Succeeded | FailedRetryable | FailedTerminal) => true,
            (FailedRetryable, InProgress | FailedRetryable | FailedTerminal) => true,
            _ => false,
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row per (run, stage) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub run_id: RunId,
    pub stage: Stage,
    pub status: StageStatus,
    /// Location of the stage's output artifact once succeeded.
    pub artifact: Option<PathBuf>,
    /// Cumulative attempts across every invocation of this run.
    pub attempts: u32,
    pub last_error: Option<StageError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageRecord {
    pub fn new(run_id: RunId, stage: Stage) -> Self {
        Self {
            run_id,
            stage,
            status: StageStatus::NotStarted,
            artifact: None,
            attempts: 0,
            last_error: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Start (or re-enter) an attempt.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) {
        self.status = StageStatus::InProgress;
        self.attempts += 1;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.finished_at = None;
    }

    pub fn succeed(&mut self, artifact: PathBuf, now: DateTime<Utc>) {
        self.status = StageStatus::Succeeded;
        self.artifact = Some(artifact);
        self.last_error = None;
        self.finished_at = Some(now);
    }

    pub fn fail(&mut self, error: StageError, retryable: bool, now: DateTime<Utc>) {
        self.status = if retryable {
            StageStatus::FailedRetryable
        } else {
            StageStatus::FailedTerminal
        };
        self.last_error = Some(error);
        if !retryable {
            self.finished_at = Some(now);
        }
    }

    pub fn skip(&mut self, now: DateTime<Utc>) {
        self.status = StageStatus::Skipped;
        self.started_at.get_or_insert(now);
        self.finished_at = Some(now);
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.last_error.as_ref().map(|e| e.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_is_fixed() {
        let labels: Vec<_> = Stage::ORDER.iter().map(|s| s.label()).collect();
        assert_eq!(
            labels,
            ["normalize", "transcribe", "enrich", "translate", "synthesize"]
        );
        for (i, stage) in Stage::ORDER.iter().enumerate() {
            assert_eq!(stage.index(), i);
        }
    }

    #[test]
    fn only_enrichment_is_optional() {
        let optional: Vec<_> = Stage::ORDER.into_iter().filter(|s| s.is_optional()).collect();
        assert_eq!(optional, vec![Stage::Enrich]);
    }

    #[test]
    fn succeeded_never_moves_backward() {
        for next in [
            StageStatus::NotStarted,
            StageStatus::InProgress,
            StageStatus::FailedRetryable,
            StageStatus::FailedTerminal,
            StageStatus::Skipped,
        ] {
            assert!(!StageStatus::Succeeded.can_transition_to(next), "{next}");
        }
        assert!(StageStatus::Succeeded.can_transition_to(StageStatus::Succeeded));
    }

    #[test]
    fn retry_cycle_is_legal() {
        use StageStatus::*;
        assert!(NotStarted.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(FailedRetryable));
        assert!(FailedRetryable.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Succeeded));
        assert!(FailedRetryable.can_transition_to(FailedTerminal));
        assert!(InProgress.can_transition_to(InProgress));
        assert!(!NotStarted.can_transition_to(Succeeded));
        assert!(!FailedTerminal.can_transition_to(InProgress));
        assert!(!Skipped.can_transition_to(InProgress));
    }

    #[test]
    fn status_labels_round_trip() {
        for s in [
            StageStatus::NotStarted,
            StageStatus::InProgress,
            StageStatus::Succeeded,
            StageStatus::FailedRetryable,
            StageStatus::FailedTerminal,
            StageStatus::Skipped,
        ] {
            assert_eq!(StageStatus::parse(s.as_str()), Some(s));
            let json = serde_json::to_value(s).expect("serialize status");
            assert_eq!(json, s.as_str());
        }
    }

    #[test]
    fn record_attempts_accumulate() {
        let now = Utc::now();
        let mut rec = StageRecord::new(RunId::from("run-a"), Stage::Translate);
        rec.begin_attempt(now);
        rec.fail(StageError::service_unavailable("503"), true, now);
        assert_eq!(rec.status, StageStatus::FailedRetryable);
        assert_eq!(rec.finished_at, None);
        rec.begin_attempt(now);
        rec.succeed(PathBuf::from("/tmp/out.txt"), now);
        assert_eq!(rec.attempts, 2);
        assert_eq!(rec.status, StageStatus::Succeeded);
        assert!(rec.last_error.is_none());
        assert_eq!(rec.started_at, Some(now));
    }
}
