//! In-process ledger. Nothing survives the process; used for tests and dry runs.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use parking_lot::Mutex;

use super::{check_transition, StageLedger};
use crate::error::LedgerResult;
use crate::events::StageTransition;
use crate::run::{PipelineRun, RunId};
use crate::stage::{Stage, StageRecord};

#[derive(Default)]
struct State {
    runs: BTreeMap<RunId, PipelineRun>,
    records: BTreeMap<(RunId, Stage), StageRecord>,
    events: BTreeMap<RunId, Vec<StageTransition>>,
}

/// `parking_lot::Mutex`-guarded maps; every call is one critical section.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StageLedger for MemoryLedger {
    fn get_record(&self, run_id: &RunId, stage: Stage) -> LedgerResult<Option<StageRecord>> {
        Ok(self
            .state
            .lock()
            .records
            .get(&(run_id.clone(), stage))
            .cloned())
    }

    fn upsert(&self, record: &StageRecord) -> LedgerResult<()> {
        let mut state = self.state.lock();
        let key = (record.run_id.clone(), record.stage);
        check_transition(state.records.get(&key).map(|r| r.status), record)?;
        state.records.insert(key, record.clone());
        Ok(())
    }

    fn records_for_run(&self, run_id: &RunId) -> LedgerResult<Vec<StageRecord>> {
        let state = self.state.lock();
        Ok(Stage::ORDER
            .iter()
            .filter_map(|s| state.records.get(&(run_id.clone(), *s)).cloned())
            .collect())
    }

    fn create_run(&self, run: &PipelineRun) -> LedgerResult<bool> {
        let mut state = self.state.lock();
        match state.runs.entry(run.run_id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(run.clone());
                Ok(true)
            }
        }
    }

    fn put_run(&self, run: &PipelineRun) -> LedgerResult<()> {
        self.state
            .lock()
            .runs
            .insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    fn get_run(&self, run_id: &RunId) -> LedgerResult<Option<PipelineRun>> {
        Ok(self.state.lock().runs.get(run_id).cloned())
    }

    fn latest_run_for_input(&self, fingerprint: &str) -> LedgerResult<Option<PipelineRun>> {
        Ok(self
            .state
            .lock()
            .runs
            .values()
            .filter(|r| r.fingerprint == fingerprint)
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    fn recent_runs(&self, limit: usize) -> LedgerResult<Vec<PipelineRun>> {
        let mut runs: Vec<_> = self.state.lock().runs.values().cloned().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit);
        Ok(runs)
    }

    fn append_event(&self, event: &StageTransition) -> LedgerResult<()> {
        self.state
            .lock()
            .events
            .entry(event.run_id.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    fn events_for_run(&self, run_id: &RunId) -> LedgerResult<Vec<StageTransition>> {
        Ok(self
            .state
            .lock()
            .events
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }
}
