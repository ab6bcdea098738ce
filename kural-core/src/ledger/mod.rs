//! Stage ledger: durable record of per-run, per-stage progress.
//!
//! The ledger stores three things:
//! - one [`PipelineRun`] header per run,
//! - at most one [`StageRecord`] per (run, stage),
//! - an append-only list of [`StageTransition`]s per run.
//!
//! It rejects status regressions on a single record (see
//! [`StageStatus::can_transition_to`]) but does not check ordering between
//! stages; sequencing belongs to the orchestrator.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

use std::sync::Arc;

use crate::error::{LedgerError, LedgerResult};
use crate::events::StageTransition;
use crate::run::{PipelineRun, RunId};
use crate::stage::{Stage, StageRecord, StageStatus};

/// Contract for ledger backends.
///
/// Implementations must make `upsert` atomic: after a crash a record is
/// either fully present in its new state or still in its previous state.
pub trait StageLedger: Send + Sync {
    fn get_record(&self, run_id: &RunId, stage: Stage) -> LedgerResult<Option<StageRecord>>;

    /// Insert or replace the record for `(record.run_id, record.stage)`.
    fn upsert(&self, record: &StageRecord) -> LedgerResult<()>;

    /// All records of a run, in [`Stage::ORDER`].
    fn records_for_run(&self, run_id: &RunId) -> LedgerResult<Vec<StageRecord>>;

    /// Register a new run header. Returns `false`, and writes nothing, when
    /// `run.run_id` is already taken.
    fn create_run(&self, run: &PipelineRun) -> LedgerResult<bool>;

    /// Insert or update a run header.
    fn put_run(&self, run: &PipelineRun) -> LedgerResult<()>;

    fn get_run(&self, run_id: &RunId) -> LedgerResult<Option<PipelineRun>>;

    /// Newest run started from an input with this fingerprint.
    fn latest_run_for_input(&self, fingerprint: &str) -> LedgerResult<Option<PipelineRun>>;

    /// Newest runs first.
    fn recent_runs(&self, limit: usize) -> LedgerResult<Vec<PipelineRun>>;

    fn append_event(&self, event: &StageTransition) -> LedgerResult<()>;

    fn events_for_run(&self, run_id: &RunId) -> LedgerResult<Vec<StageTransition>>;
}

impl<T: StageLedger + ?Sized> StageLedger for Arc<T> {
    fn get_record(&self, run_id: &RunId, stage: Stage) -> LedgerResult<Option<StageRecord>> {
        (**self).get_record(run_id, stage)
    }

    fn upsert(&self, record: &StageRecord) -> LedgerResult<()> {
        (**self).upsert(record)
    }

    fn records_for_run(&self, run_id: &RunId) -> LedgerResult<Vec<StageRecord>> {
        (**self).records_for_run(run_id)
    }

    fn create_run(&self, run: &PipelineRun) -> LedgerResult<bool> {
        (**self).create_run(run)
    }

    fn put_run(&self, run: &PipelineRun) -> LedgerResult<()> {
        (**self).put_run(run)
    }

    fn get_run(&self, run_id: &RunId) -> LedgerResult<Option<PipelineRun>> {
        (**self).get_run(run_id)
    }

    fn latest_run_for_input(&self, fingerprint: &str) -> LedgerResult<Option<PipelineRun>> {
        (**self).latest_run_for_input(fingerprint)
    }

    fn recent_runs(&self, limit: usize) -> LedgerResult<Vec<PipelineRun>> {
        (**self).recent_runs(limit)
    }

    fn append_event(&self, event: &StageTransition) -> LedgerResult<()> {
        (**self).append_event(event)
    }

    fn events_for_run(&self, run_id: &RunId) -> LedgerResult<Vec<StageTransition>> {
        (**self).events_for_run(run_id)
    }
}

/// Shared regression check used by every backend inside its write critical section.
pub(crate) fn check_transition(
    existing: Option<StageStatus>,
    next: &StageRecord,
) -> LedgerResult<()> {
    let from = existing.unwrap_or(StageStatus::NotStarted);
    if from.can_transition_to(next.status) {
        Ok(())
    } else {
        Err(LedgerError::Regression {
            run_id: next.run_id.to_string(),
            stage: next.stage.to_string(),
            from: from.to_string(),
            to: next.status.to_string(),
        })
    }
}
