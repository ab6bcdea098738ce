//! Run identity and the per-run header row kept in the ledger.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::stage::Stage;

/// Identifies one end-to-end execution.
///
/// Format: `<input stem>-<8 hex fingerprint>-<UTC start, YYYYmmddTHHMMSSZ>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn derive(input_stem: &str, fingerprint: &str, started_at: DateTime<Utc>) -> Self {
        let stem: String = input_stem
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let stem = if stem.is_empty() { "input".to_string() } else { stem };
        let short: String = fingerprint.chars().take(8).collect();
        Self(format!(
            "{stem}-{short}-{}",
            started_at.format("%Y%m%dT%H%M%SZ")
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hex sha256 over the canonical path, byte length and mtime of `input`.
///
/// Two invocations on an unchanged file produce the same fingerprint.
pub fn input_fingerprint(input: &Path) -> std::io::Result<String> {
    let canonical = input.canonicalize()?;
    let meta = std::fs::metadata(&canonical)?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    hasher.update(meta.len().to_le_bytes());
    hasher.update(mtime.to_le_bytes());
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Fallback when `input` cannot be stat'ed: hash of the path text alone.
///
/// Lets a run (and its failure) be recorded for inputs that do not exist.
pub fn path_fingerprint(input: &Path) -> String {
    let digest = Sha256::digest(input.to_string_lossy().as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    PartiallySucceeded,
    /// Stopped between stages by a cancellation request; resumable.
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::PartiallySucceeded => "partially-succeeded",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        [
            Self::Pending,
            Self::Running,
            Self::Succeeded,
            Self::Failed,
            Self::PartiallySucceeded,
            Self::Cancelled,
        ]
        .into_iter()
        .find(|s| s.as_str() == raw)
    }

    /// Whether every required stage produced its artifact.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Succeeded | Self::PartiallySucceeded)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header row for one run. Mutated only by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRun {
    pub run_id: RunId,
    pub input: PathBuf,
    pub fingerprint: String,
    pub status: RunStatus,
    pub current_stage: Option<Stage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(run_id: RunId, input: PathBuf, fingerprint: String, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            input,
            fingerprint,
            status: RunStatus::Pending,
            current_stage: None,
            created_at: now,
            updated_at: now,
        }
    }
}
