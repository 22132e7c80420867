//! Durable export job ledger (`jobs.db`).
//!
//! Rows are never deleted. Per-record progress lives in `job_items`, and a job's
//! `successful`/`failed` counters are always recomputed from the items in the current
//! listing, so a resumed job keeps one row whose totals reconcile. Items that dropped out
//! of the listing stay behind for audit with `listed = 0`.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
};

use chats_core::jobs::{ExportJob, ItemOutcome, JobStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

const JOB_ID_LEN: usize = 8;
const MAX_ID_ATTEMPTS: usize = 16;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    job_id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    total_conversations INTEGER NOT NULL DEFAULT 0,
    successful_conversations INTEGER NOT NULL DEFAULT 0,
    failed_conversations INTEGER NOT NULL DEFAULT 0,
    errors TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS job_items (
    job_id TEXT NOT NULL REFERENCES jobs(job_id),
    record_id TEXT NOT NULL,
    outcome TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    listed INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (job_id, record_id)
);
";

const REFRESH_COUNTERS: &str = "UPDATE jobs SET
    successful_conversations = (SELECT COUNT(*) FROM job_items
        WHERE job_id = ?1 AND listed = 1 AND outcome = 'success'),
    failed_conversations = (SELECT COUNT(*) FROM job_items
        WHERE job_id = ?1 AND listed = 1 AND outcome = 'failed')
 WHERE job_id = ?1";

const SELECT_JOB: &str = "SELECT job_id, started_at, completed_at, total_conversations,
    successful_conversations, failed_conversations, errors, status FROM jobs";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("job {0} not found")]
    NotFound(String),
    #[error("job {job_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("job {job_id} has a malformed row: {reason}")]
    Malformed { job_id: String, reason: String },
    #[error("could not allocate a unique job id")]
    IdExhausted,
}

/// Partial update applied by [`JobLedger::update`]. Unset fields are left as they are.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub total: Option<u64>,
    pub successful: Option<u64>,
    pub failed: Option<u64>,
    pub errors: Option<Vec<String>>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn errors(mut self, errors: Vec<String>) -> Self {
        self.errors = Some(errors);
        self
    }
}

pub struct JobLedger {
    conn: Connection,
}

impl JobLedger {
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// New pending job with a fresh 8-hex id.
    pub fn create(&self) -> Result<String, LedgerError> {
        let started_at = Utc::now().to_rfc3339();
        for _ in 0..MAX_ID_ATTEMPTS {
            let job_id = Uuid::new_v4().simple().to_string()[..JOB_ID_LEN].to_string();
            let inserted = self.conn.execute(
                "INSERT OR IGNORE INTO jobs (job_id, started_at, status, errors)
                 VALUES (?1, ?2, ?3, '[]')",
                params![job_id, started_at, JobStatus::Pending.as_str()],
            )?;
            if inserted == 1 {
                debug!(job_id = %job_id, "created export job");
                return Ok(job_id);
            }
            warn!(job_id = %job_id, "job id collision, retrying");
        }
        Err(LedgerError::IdExhausted)
    }

    /// Apply `update`. Status changes are checked against the job state machine; a terminal
    /// status stamps `completed_at`, reopening clears it.
    pub fn update(&self, job_id: &str, update: JobUpdate) -> Result<ExportJob, LedgerError> {
        let mut job = self
            .get(job_id)?
            .ok_or_else(|| LedgerError::NotFound(job_id.to_string()))?;

        if let Some(next) = update.status {
            if !job.status.can_transition_to(next) {
                return Err(LedgerError::InvalidTransition {
                    job_id: job_id.to_string(),
                    from: job.status,
                    to: next,
                });
            }
            job.completed_at = next.is_terminal().then(Utc::now);
            job.status = next;
        }
        if let Some(total) = update.total {
            job.total = total;
        }
        if let Some(successful) = update.successful {
            job.successful = successful;
        }
        if let Some(failed) = update.failed {
            job.failed = failed;
        }
        if let Some(errors) = update.errors {
            job.errors = errors;
        }

        let errors = serde_json::to_string(&job.errors).map_err(|e| LedgerError::Malformed {
            job_id: job_id.to_string(),
            reason: e.to_string(),
        })?;
        self.conn.execute(
            "UPDATE jobs SET status = ?2, completed_at = ?3, total_conversations = ?4,
                successful_conversations = ?5, failed_conversations = ?6, errors = ?7
             WHERE job_id = ?1",
            params![
                job_id,
                job.status.as_str(),
                job.completed_at.map(|at| at.to_rfc3339()),
                job.total as i64,
                job.successful as i64,
                job.failed as i64,
                errors,
            ],
        )?;
        Ok(job)
    }

    pub fn get(&self, job_id: &str) -> Result<Option<ExportJob>, LedgerError> {
        self.conn
            .query_row(
                &format!("{SELECT_JOB} WHERE job_id = ?1"),
                params![job_id],
                JobRow::read,
            )
            .optional()?
            .map(JobRow::into_job)
            .transpose()
    }

    /// Most recently created job.
    pub fn get_last(&self) -> Result<Option<ExportJob>, LedgerError> {
        Ok(self.list_recent(1)?.into_iter().next())
    }

    pub fn list_recent(&self, limit: usize) -> Result<Vec<ExportJob>, LedgerError> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_JOB} ORDER BY created_at DESC, rowid DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], JobRow::read)?;
        let jobs = rows
            .map(|row| row.map_err(LedgerError::from).and_then(JobRow::into_job))
            .collect();
        jobs
    }

    /// Record the latest outcome for one record and refresh the job counters atomically.
    pub fn record_outcome(
        &mut self,
        job_id: &str,
        record_id: &str,
        outcome: ItemOutcome,
    ) -> Result<(), LedgerError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO job_items (job_id, record_id, outcome, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (job_id, record_id)
             DO UPDATE SET outcome = excluded.outcome, updated_at = excluded.updated_at,
                listed = 1",
            params![job_id, record_id, outcome.as_str(), Utc::now().to_rfc3339()],
        )?;
        tx.execute(REFRESH_COUNTERS, params![job_id])?;
        tx.commit()?;
        Ok(())
    }

    /// Scope the job to this run's listing: `total` becomes the number of distinct keys and
    /// the counters only count items among them. Returns the new total.
    pub fn set_listing<'a, I>(&mut self, job_id: &str, keys: I) -> Result<u64, LedgerError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let keys: HashSet<&str> = keys.into_iter().collect();
        let total = keys.len() as u64;

        let tx = self.conn.transaction()?;
        let updated = tx.execute(
            "UPDATE jobs SET total_conversations = ?2 WHERE job_id = ?1",
            params![job_id, total as i64],
        )?;
        if updated == 0 {
            return Err(LedgerError::NotFound(job_id.to_string()));
        }
        tx.execute(
            "UPDATE job_items SET listed = 0 WHERE job_id = ?1",
            params![job_id],
        )?;
        {
            let mut relist = tx.prepare(
                "UPDATE job_items SET listed = 1 WHERE job_id = ?1 AND record_id = ?2",
            )?;
            for key in &keys {
                relist.execute(params![job_id, key])?;
            }
        }
        tx.execute(REFRESH_COUNTERS, params![job_id])?;
        tx.commit()?;
        debug!(job_id, total, "job scoped to listing");
        Ok(total)
    }

    /// Latest outcome per record, including records no longer listed.
    pub fn outcomes(&self, job_id: &str) -> Result<HashMap<String, ItemOutcome>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare("SELECT record_id, outcome FROM job_items WHERE job_id = ?1")?;
        let rows = stmt.query_map(params![job_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut outcomes = HashMap::new();
        for row in rows {
            let (record_id, outcome) = row?;
            let outcome = outcome
                .parse()
                .map_err(|reason| LedgerError::Malformed {
                    job_id: job_id.to_string(),
                    reason,
                })?;
            outcomes.insert(record_id, outcome);
        }
        Ok(outcomes)
    }

    /// Mark every `in_progress` job other than `except` as failed. Only sound while the
    /// archive lock is held: no other run can be live then.
    pub fn fail_abandoned(&self, except: Option<&str>) -> Result<usize, LedgerError> {
        let abandoned: Vec<String> = {
            let mut stmt = self
                .conn
                .prepare("SELECT job_id FROM jobs WHERE status = ?1")?;
            let rows = stmt.query_map(params![JobStatus::InProgress.as_str()], |row| {
                row.get::<_, String>(0)
            })?;
            rows.collect::<Result<_, _>>()?
        };

        let mut swept = 0;
        for job_id in abandoned.iter().filter(|id| Some(id.as_str()) != except) {
            let Some(job) = self.get(job_id)? else {
                continue;
            };
            let mut errors = job.errors;
            errors.push("abandoned".to_string());
            self.update(
                job_id,
                JobUpdate::status(JobStatus::Failed).errors(errors),
            )?;
            warn!(job_id = %job_id, "marked abandoned export job as failed");
            swept += 1;
        }
        Ok(swept)
    }
}

struct JobRow {
    job_id: String,
    started_at: String,
    completed_at: Option<String>,
    total: i64,
    successful: i64,
    failed: i64,
    errors: Option<String>,
    status: String,
}

impl JobRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(0)?,
            started_at: row.get(1)?,
            completed_at: row.get(2)?,
            total: row.get(3)?,
            successful: row.get(4)?,
            failed: row.get(5)?,
            errors: row.get(6)?,
            status: row.get(7)?,
        })
    }

    fn into_job(self) -> Result<ExportJob, LedgerError> {
        let job_id = self.job_id;
        let malformed = |reason: String| LedgerError::Malformed {
            job_id: job_id.clone(),
            reason,
        };
        let timestamp = |value: &str| {
            DateTime::parse_from_rfc3339(value)
                .map(|at| at.with_timezone(&Utc))
                .map_err(|e| malformed(format!("bad timestamp {value:?}: {e}")))
        };

        let started_at = timestamp(&self.started_at)?;
        let completed_at = self.completed_at.as_deref().map(timestamp).transpose()?;
        let errors = match self.errors.as_deref() {
            None | Some("") => Vec::new(),
            Some(raw) => serde_json::from_str(raw).map_err(|e| malformed(e.to_string()))?,
        };
        let status = self.status.parse().map_err(malformed)?;

        Ok(ExportJob {
            job_id,
            started_at,
            completed_at,
            total: self.total.max(0) as u64,
            successful: self.successful.max(0) as u64,
            failed: self.failed.max(0) as u64,
            errors,
            status,
        })
    }
}
