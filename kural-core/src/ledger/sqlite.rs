//! SQLite-backed ledger.
//!
//! One connection per operation, WAL journal, and `BEGIN IMMEDIATE` around
//! every read-check-write so two processes sharing the database file cannot
//! interleave a regression check with a write. Timestamps are stored as
//! UTC microseconds.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::{check_transition, StageLedger};
use crate::error::{ErrorKind, LedgerError, LedgerResult, StageError};
use crate::events::StageTransition;
use crate::run::{PipelineRun, RunId, RunStatus};
use crate::stage::{Stage, StageRecord, StageStatus};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteLedger {
    db_path: PathBuf,
    /// Serializes writers for the same run inside this process.
    run_locks: Mutex<HashMap<RunId, Arc<Mutex<()>>>>,
}

impl SqliteLedger {
    pub fn new(db_path: PathBuf) -> LedgerResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let ledger = Self {
            db_path,
            run_locks: Mutex::new(HashMap::new()),
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn open(&self) -> LedgerResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    fn init_schema(&self) -> LedgerResult<()> {
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS runs (
              run_id TEXT PRIMARY KEY,
              input_path TEXT NOT NULL,
              fingerprint TEXT NOT NULL,
              status TEXT NOT NULL,
              current_stage TEXT,
              created_at INTEGER NOT NULL,
              updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS stage_records (
              run_id TEXT NOT NULL,
              stage TEXT NOT NULL,
              stage_idx INTEGER NOT NULL,
              status TEXT NOT NULL,
              artifact TEXT,
              attempts INTEGER NOT NULL DEFAULT 0,
              error_kind TEXT,
              error_message TEXT,
              started_at INTEGER,
              finished_at INTEGER,
              PRIMARY KEY (run_id, stage)
            );

            CREATE TABLE IF NOT EXISTS run_events (
              run_id TEXT NOT NULL,
              seq INTEGER NOT NULL,
              stage TEXT NOT NULL,
              status TEXT NOT NULL,
              attempt INTEGER NOT NULL,
              duration_seconds REAL NOT NULL,
              error_kind TEXT,
              at INTEGER NOT NULL,
              PRIMARY KEY (run_id, seq)
            );

            CREATE INDEX IF NOT EXISTS idx_runs_fingerprint ON runs(fingerprint, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_runs_created_at ON runs(created_at DESC);
            "#,
        )?;
        Ok(())
    }

    /// Run `f` holding the in-process writer lock for `run_id`.
    ///
    /// The lock entry is dropped again once no other writer holds it, so the
    /// map only ever contains runs with a write in flight.
    fn with_run_lock<T>(
        &self,
        run_id: &RunId,
        f: impl FnOnce() -> LedgerResult<T>,
    ) -> LedgerResult<T> {
        let lock = self
            .run_locks
            .lock()
            .entry(run_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let out = {
            let _guard = lock.lock();
            f()
        };
        let mut locks = self.run_locks.lock();
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(run_id);
        }
        out
    }

    fn write_record(&self, record: &StageRecord) -> LedgerResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT status FROM stage_records WHERE run_id = ?1 AND stage = ?2",
                params![record.run_id.as_str(), record.stage.label()],
                |row| row.get(0),
            )
            .optional()?;
        let existing = existing.map(|s| decode_stage_status(&s)).transpose()?;
        check_transition(existing, record)?;

        tx.execute(
            r#"
            INSERT INTO stage_records
              (run_id, stage, stage_idx, status, artifact, attempts, error_kind, error_message, started_at, finished_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(run_id, stage) DO UPDATE SET
                status = excluded.status,
                artifact = excluded.artifact,
                attempts = excluded.attempts,
                error_kind = excluded.error_kind,
                error_message = excluded.error_message,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at
            "#,
            params![
                record.run_id.as_str(),
                record.stage.label(),
                record.stage.index() as i64,
                record.status.as_str(),
                record
                    .artifact
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
                i64::from(record.attempts),
                record.last_error.as_ref().map(|e| e.kind.as_str()),
                record.last_error.as_ref().map(|e| e.message.as_str()),
                record.started_at.map(|t| t.timestamp_micros()),
                record.finished_at.map(|t| t.timestamp_micros()),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    #[cfg(test)]
    fn held_run_locks(&self) -> usize {
        self.run_locks.lock().len()
    }
}

impl StageLedger for SqliteLedger {
    fn get_record(&self, run_id: &RunId, stage: Stage) -> LedgerResult<Option<StageRecord>> {
        let conn = self.open()?;
        let raw = conn
            .query_row(
                r#"
                SELECT run_id, stage, status, artifact, attempts, error_kind, error_message, started_at, finished_at
                FROM stage_records WHERE run_id = ?1 AND stage = ?2
                "#,
                params![run_id.as_str(), stage.label()],
                RawRecord::from_row,
            )
            .optional()?;
        raw.map(RawRecord::decode).transpose()
    }

    fn upsert(&self, record: &StageRecord) -> LedgerResult<()> {
        self.with_run_lock(&record.run_id, || self.write_record(record))
    }

    fn records_for_run(&self, run_id: &RunId) -> LedgerResult<Vec<StageRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT run_id, stage, status, artifact, attempts, error_kind, error_message, started_at, finished_at
            FROM stage_records WHERE run_id = ?1
            ORDER BY stage_idx ASC
            "#,
        )?;
        let rows = stmt.query_map(params![run_id.as_str()], RawRecord::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.decode()?);
        }
        Ok(out)
    }

    fn create_run(&self, run: &PipelineRun) -> LedgerResult<bool> {
        self.with_run_lock(&run.run_id, || {
            let conn = self.open()?;
            let inserted = conn.execute(
                r#"
                INSERT INTO runs (run_id, input_path, fingerprint, status, current_stage, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(run_id) DO NOTHING
                "#,
                run_params(run),
            )?;
            Ok(inserted == 1)
        })
    }

    fn put_run(&self, run: &PipelineRun) -> LedgerResult<()> {
        self.with_run_lock(&run.run_id, || {
            let conn = self.open()?;
            conn.execute(
                r#"
                INSERT INTO runs (run_id, input_path, fingerprint, status, current_stage, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(run_id) DO UPDATE SET
                    status = excluded.status,
                    current_stage = excluded.current_stage,
                    updated_at = excluded.updated_at
                "#,
                run_params(run),
            )?;
            Ok(())
        })
    }

    fn get_run(&self, run_id: &RunId) -> LedgerResult<Option<PipelineRun>> {
        let conn = self.open()?;
        let raw = conn
            .query_row(
                &format!("{RUN_COLUMNS} WHERE run_id = ?1"),
                params![run_id.as_str()],
                RawRun::from_row,
            )
            .optional()?;
        raw.map(RawRun::decode).transpose()
    }

    fn latest_run_for_input(&self, fingerprint: &str) -> LedgerResult<Option<PipelineRun>> {
        let conn = self.open()?;
        let raw = conn
            .query_row(
                &format!("{RUN_COLUMNS} WHERE fingerprint = ?1 ORDER BY created_at DESC LIMIT 1"),
                params![fingerprint],
                RawRun::from_row,
            )
            .optional()?;
        raw.map(RawRun::decode).transpose()
    }

    fn recent_runs(&self, limit: usize) -> LedgerResult<Vec<PipelineRun>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!("{RUN_COLUMNS} ORDER BY created_at DESC LIMIT ?1"))?;
        let rows = stmt.query_map(params![limit as i64], RawRun::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.decode()?);
        }
        Ok(out)
    }

    fn append_event(&self, event: &StageTransition) -> LedgerResult<()> {
        self.with_run_lock(&event.run_id, || {
            let mut conn = self.open()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM run_events WHERE run_id = ?1",
                params![event.run_id.as_str()],
                |row| row.get(0),
            )?;
            tx.execute(
                r#"
                INSERT INTO run_events (run_id, seq, stage, status, attempt, duration_seconds, error_kind, at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    event.run_id.as_str(),
                    seq,
                    event.stage.label(),
                    event.status.as_str(),
                    i64::from(event.attempt),
                    event.duration_seconds,
                    event.error_kind.map(ErrorKind::as_str),
                    event.at.timestamp_micros(),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    fn events_for_run(&self, run_id: &RunId) -> LedgerResult<Vec<StageTransition>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT stage, status, attempt, duration_seconds, error_kind, at
            FROM run_events WHERE run_id = ?1
            ORDER BY seq ASC
            "#,
        )?;
        let rows = stmt.query_map(params![run_id.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (stage, status, attempt, duration_seconds, error_kind, at) = row?;
            out.push(StageTransition {
                run_id: run_id.clone(),
                stage: decode_stage(&stage)?,
                status: decode_stage_status(&status)?,
                attempt: decode_count(attempt)?,
                duration_seconds,
                error_kind: error_kind.as_deref().map(decode_error_kind).transpose()?,
                at: decode_micros(at)?,
            });
        }
        Ok(out)
    }
}

const RUN_COLUMNS: &str =
    "SELECT run_id, input_path, fingerprint, status, current_stage, created_at, updated_at FROM runs";

struct RawRecord {
    run_id: String,
    stage: String,
    status: String,
    artifact: Option<String>,
    attempts: i64,
    error_kind: Option<String>,
    error_message: Option<String>,
    started_at: Option<i64>,
    finished_at: Option<i64>,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            stage: row.get(1)?,
            status: row.get(2)?,
            artifact: row.get(3)?,
            attempts: row.get(4)?,
            error_kind: row.get(5)?,
            error_message: row.get(6)?,
            started_at: row.get(7)?,
            finished_at: row.get(8)?,
        })
    }

    fn decode(self) -> LedgerResult<StageRecord> {
        let last_error = match self.error_kind {
            Some(kind) => Some(StageError::new(
                decode_error_kind(&kind)?,
                self.error_message.unwrap_or_default(),
            )),
            None => None,
        };
        Ok(StageRecord {
            run_id: RunId::from(self.run_id),
            stage: decode_stage(&self.stage)?,
            status: decode_stage_status(&self.status)?,
            artifact: self.artifact.map(PathBuf::from),
            attempts: decode_count(self.attempts)?,
            last_error,
            started_at: self.started_at.map(decode_micros).transpose()?,
            finished_at: self.finished_at.map(decode_micros).transpose()?,
        })
    }
}

struct RawRun {
    run_id: String,
    input_path: String,
    fingerprint: String,
    status: String,
    current_stage: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RawRun {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            input_path: row.get(1)?,
            fingerprint: row.get(2)?,
            status: row.get(3)?,
            current_stage: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn decode(self) -> LedgerResult<PipelineRun> {
        Ok(PipelineRun {
            run_id: RunId::from(self.run_id),
            input: PathBuf::from(self.input_path),
            fingerprint: self.fingerprint,
            status: RunStatus::parse(&self.status)
                .ok_or_else(|| LedgerError::Decode(format!("unknown run status '{}'", self.status)))?,
            current_stage: self.current_stage.as_deref().map(decode_stage).transpose()?,
            created_at: decode_micros(self.created_at)?,
            updated_at: decode_micros(self.updated_at)?,
        })
    }
}

fn run_params(run: &PipelineRun) -> impl rusqlite::Params + '_ {
    (
        run.run_id.as_str(),
        run.input.to_string_lossy(),
        run.fingerprint.as_str(),
        run.status.as_str(),
        run.current_stage.map(Stage::label),
        run.created_at.timestamp_micros(),
        run.updated_at.timestamp_micros(),
    )
}

fn decode_stage(raw: &str) -> LedgerResult<Stage> {
    Stage::parse(raw).ok_or_else(|| LedgerError::Decode(format!("unknown stage '{raw}'")))
}

fn decode_stage_status(raw: &str) -> LedgerResult<StageStatus> {
    StageStatus::parse(raw)
        .ok_or_else(|| LedgerError::Decode(format!("unknown stage status '{raw}'")))
}

fn decode_error_kind(raw: &str) -> LedgerResult<ErrorKind> {
    ErrorKind::parse(raw).ok_or_else(|| LedgerError::Decode(format!("unknown error kind '{raw}'")))
}

fn decode_count(raw: i64) -> LedgerResult<u32> {
    u32::try_from(raw).map_err(|_| LedgerError::Decode(format!("attempt count out of range: {raw}")))
}

fn decode_micros(ts: i64) -> LedgerResult<DateTime<Utc>> {
    Utc.timestamp_micros(ts)
        .single()
        .ok_or_else(|| LedgerError::Decode(format!("invalid timestamp {ts}")))
}
