//! Deterministic artifact naming and crash-safe writes.
//!
//! Every artifact lives at `<output_dir>/<run_id>_<suffix>`. Writers target a
//! staging path first and rename into place, so a final name never refers to
//! a truncated file.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{ErrorKind, StageError, StageResult};
use crate::run::RunId;

pub const NORMALIZED: &str = "normalized.wav";
pub const TRANSCRIPT_JSON: &str = "transcript.json";
pub const TRANSCRIPT_TXT: &str = "transcript.txt";
pub const ENRICHED_TXT: &str = "enriched.txt";
pub const ENRICHED_JSON: &str = "enriched.json";
pub const TRANSLATION_TXT: &str = "translation.txt";
pub const TRANSLATION_JSON: &str = "translation.json";
pub const SPEECH_JSON: &str = "speech.json";
pub const SUMMARY_JSON: &str = "summary.json";
pub const TRANSITIONS_JSONL: &str = "transitions.jsonl";

pub fn speech_suffix(extension: &str) -> String {
    format!("speech.{extension}")
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
    run_id: RunId,
}

impl ArtifactStore {
    pub fn new(dir: PathBuf, run_id: RunId) -> Self {
        Self { dir, run_id }
    }

    pub fn path(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}_{suffix}", self.run_id))
    }

    /// Per-attempt staging path for `final_path`.
    ///
    /// Attempts never share a staging file, so a timed-out call still
    /// writing in the background cannot clobber a later attempt.
    pub fn staging(&self, final_path: &Path, attempt: u32) -> PathBuf {
        let mut name = final_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{attempt}.partial"));
        final_path.with_file_name(name)
    }

    pub fn write_text(&self, suffix: &str, text: &str) -> StageResult<PathBuf> {
        let target = self.path(suffix);
        write_atomic(&target, text.as_bytes())?;
        Ok(target)
    }

    pub fn write_json<T: Serialize + ?Sized>(&self, suffix: &str, value: &T) -> StageResult<PathBuf> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| artifact_error(&self.path(suffix), e))?;
        let target = self.path(suffix);
        write_atomic(&target, &bytes)?;
        Ok(target)
    }
}

/// Write `bytes` to `<target>.partial`, fsync, then rename over `target`.
pub fn write_atomic(target: &Path, bytes: &[u8]) -> StageResult<()> {
    let mut staged = target.as_os_str().to_os_string();
    staged.push(".partial");
    let staged = PathBuf::from(staged);

    let mut file = File::create(&staged).map_err(|e| artifact_error(&staged, e))?;
    file.write_all(bytes).map_err(|e| artifact_error(&staged, e))?;
    file.sync_all().map_err(|e| artifact_error(&staged, e))?;
    drop(file);
    promote(&staged, target)
}

/// Move a finished staging file to its final name.
pub fn promote(staged: &Path, target: &Path) -> StageResult<()> {
    fs::rename(staged, target).map_err(|e| artifact_error(target, e))
}

/// Best-effort removal of a staging file left behind by a failed attempt.
pub fn discard(staged: &Path) {
    if staged.exists() {
        if let Err(e) = fs::remove_file(staged) {
            tracing::debug!(path = %staged.display(), error = %e, "could not discard staging file");
        }
    }
}

pub fn read_text(path: &Path) -> StageResult<String> {
    fs::read_to_string(path).map_err(|e| artifact_error(path, e))
}

pub(crate) fn artifact_error(path: &Path, e: impl std::fmt::Display) -> StageError {
    StageError::new(ErrorKind::ArtifactIo, format!("{}: {e}", path.display()))
}
