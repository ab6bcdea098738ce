//! Per-run options in, aggregated result out.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, StageError};
use crate::inference::Transcript;
use crate::run::{RunId, RunStatus};
use crate::stage::{Stage, StageRecord};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub target_language: String,
    pub enrichment_enabled: bool,
    /// Feed enrichment output into translation instead of the transcript.
    pub translate_enriched: bool,
    pub output_dir: PathBuf,
    /// Continue this run instead of starting a new one.
    pub resume: Option<RunId>,
}

impl RunOptions {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            target_language: "ta".to_string(),
            enrichment_enabled: true,
            translate_enriched: false,
            output_dir: output_dir.into(),
            resume: None,
        }
    }

    pub fn target_language(mut self, code: &str) -> Self {
        self.target_language = code.to_string();
        self
    }

    pub fn enrichment(mut self, enabled: bool) -> Self {
        self.enrichment_enabled = enabled;
        self
    }

    pub fn translate_enriched(mut self, wired: bool) -> Self {
        self.translate_enriched = wired;
        self
    }

    pub fn resume(mut self, run_id: RunId) -> Self {
        self.resume = Some(run_id);
        self
    }
}

/// Where and why a stage gave up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageFailure {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
    pub attempts: u32,
}

impl StageFailure {
    pub fn new(stage: Stage, error: &StageError, attempts: u32) -> Self {
        Self {
            stage,
            kind: error.kind,
            message: error.message.clone(),
            attempts,
        }
    }
}

/// Outcome of one `Orchestrator::run`, also written as `<run_id>_summary.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub run_id: RunId,
    pub input: PathBuf,
    pub status: RunStatus,
    /// Final ledger record of every stage the run touched, in stage order.
    pub stages: Vec<StageRecord>,
    /// Artifact of every succeeded stage.
    pub artifacts: BTreeMap<Stage, PathBuf>,
    pub last_completed_stage: Option<Stage>,
    /// First required-stage failure; set only when `status` is failed.
    pub failure: Option<StageFailure>,
    /// Optional-stage failures that did not halt the run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<StageFailure>,
    pub transcript: Option<Transcript>,
    pub enriched_text: Option<String>,
    pub translation: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PipelineResult {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn record(&self, stage: Stage) -> Option<&StageRecord> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    pub fn duration_seconds(&self) -> f64 {
        (self.finished_at - self.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}
