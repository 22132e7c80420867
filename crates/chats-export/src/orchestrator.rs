use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chats_core::{
    fetcher::{ApiStatus, FetchError, Fetcher},
    id_prefix,
    jobs::{ErrorTag, ExportJob, ItemOutcome, JobStatus},
    record_id,
};
use chats_storage::{ArchiveConfig, EncryptedStore, EncryptionKey, StoreError};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::{
    ledger::{JobLedger, JobUpdate, LedgerError},
    lock::{LockBackend, LockError, ScopedLock},
};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_FAILURE_WARNING_THRESHOLD: usize = 25;
const PROGRESS_EVERY: usize = 10;
const INTERRUPTED: &str = "interrupted";

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub archive: ArchiveConfig,
    pub lock_timeout: Duration,
    pub lock_backend: LockBackend,
    /// Consecutive detail failures that trigger a warning.
    pub failure_warning_threshold: usize,
}

impl ExportConfig {
    pub fn new(archive: ArchiveConfig) -> Self {
        Self {
            archive,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_backend: LockBackend::default(),
            failure_warning_threshold: DEFAULT_FAILURE_WARNING_THRESHOLD,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("an export is already running: {0}")]
    AlreadyRunning(#[from] LockError),
    #[error("job {0} not found")]
    JobNotFound(String),
    #[error("job {0} already completed; start a new export instead")]
    JobCompleted(String),
    #[error("archive key does not match this archive; refusing to export")]
    KeyMismatch,
    #[error("credentials were rejected by the remote API")]
    InvalidCredentials,
    #[error("listing conversations failed: {0}")]
    Listing(FetchError),
    #[error("export {job_id} interrupted")]
    Interrupted { job_id: String },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("lock task failed: {0}")]
    Task(String),
}

/// Per-run failure breakdown, used for end-of-run hints.
#[derive(Debug, Default)]
struct FailureStats {
    detail: usize,
    consecutive: usize,
    auth: usize,
    rate_limited: usize,
    not_found: usize,
}

impl FailureStats {
    fn detail_failed(&mut self) {
        self.detail += 1;
        self.consecutive += 1;
    }
}

/// Drives one export run: lock, job bookkeeping, health gate, per-record verify/fetch/store.
pub struct Orchestrator<F: Fetcher> {
    config: ExportConfig,
    key: EncryptionKey,
    fetcher: F,
    interrupt: Arc<AtomicBool>,
}

impl<F: Fetcher> Orchestrator<F> {
    pub fn new(config: ExportConfig, key: EncryptionKey, fetcher: F) -> Self {
        Self {
            config,
            key,
            fetcher,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share an externally owned interrupt flag (e.g. one set by a Ctrl-C handler). Setting it
    /// stops the run before the next record.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = flag;
        self
    }

    /// Run (or resume) an export and return its job id.
    #[instrument(skip_all, fields(fetcher = self.fetcher.name(), resume = resume_job_id, force_refetch = force_refetch))]
    pub async fn run_export(
        &self,
        resume_job_id: Option<&str>,
        force_refetch: bool,
    ) -> Result<String, ExportError> {
        let lock = ScopedLock::with_backend(self.config.archive.lock_path(), self.config.lock_backend);
        let timeout = self.config.lock_timeout;
        let _lock = tokio::task::spawn_blocking(move || lock.acquire_or_busy(timeout))
            .await
            .map_err(|e| ExportError::Task(e.to_string()))??;

        let mut ledger = JobLedger::open(&self.config.archive.ledger_path())?;
        let swept = ledger.fail_abandoned(resume_job_id)?;
        if swept > 0 {
            warn!(swept, "recovered abandoned export jobs");
        }

        let job_id = match resume_job_id {
            Some(job_id) => {
                let job = ledger
                    .get(job_id)?
                    .ok_or_else(|| ExportError::JobNotFound(job_id.to_string()))?;
                if job.status == JobStatus::Completed {
                    return Err(ExportError::JobCompleted(job_id.to_string()));
                }
                info!(job_id, "resuming export job");
                job_id.to_string()
            }
            None => {
                let job_id = ledger.create()?;
                info!(job_id = %job_id, "created export job");
                job_id
            }
        };
        let job = ledger.update(&job_id, JobUpdate::status(JobStatus::InProgress))?;

        match self.run_job(&mut ledger, &job, force_refetch).await {
            Ok(()) => Ok(job_id),
            Err(err) => {
                let reason = match &err {
                    ExportError::Interrupted { .. } => INTERRUPTED.to_string(),
                    other => other.to_string(),
                };
                mark_failed(&ledger, &job_id, reason);
                Err(err)
            }
        }
    }

    async fn run_job(
        &self,
        ledger: &mut JobLedger,
        job: &ExportJob,
        force_refetch: bool,
    ) -> Result<(), ExportError> {
        let job_id = job.job_id.as_str();
        let store = EncryptedStore::open(self.config.archive.root(), &self.key)?;
        if store.is_poisoned() {
            return Err(ExportError::KeyMismatch);
        }

        let (status, message) = self.fetcher.check_health().await;
        if status != ApiStatus::Ok {
            warn!(%status, detail = %message, "remote API is not healthy; export aborted");
            let mut errors = job.errors.clone();
            errors.push(format!("API {status}: {message}"));
            ledger.update(job_id, JobUpdate::status(JobStatus::Failed).errors(errors))?;
            return Ok(());
        }
        if !self.fetcher.validate_credentials().await {
            return Err(ExportError::InvalidCredentials);
        }

        let listing = self
            .fetcher
            .list_all()
            .await
            .map_err(ExportError::Listing)?;
        let entries = distinct_entries(&listing);
        if entries.len() < listing.len() {
            warn!(
                repeated = listing.len() - entries.len(),
                "listing repeated some conversations; each is exported once"
            );
        }
        let total = ledger.set_listing(job_id, entries.iter().map(|e| e.key.as_str()))?;
        info!(total, "listed conversations");

        let done = ledger.outcomes(job_id)?;
        let mut errors = job.errors.clone();
        let mut stats = FailureStats::default();

        for (index, entry) in entries.iter().enumerate() {
            if self.interrupt.load(Ordering::SeqCst) {
                ledger.update(job_id, JobUpdate::default().errors(errors))?;
                return Err(ExportError::Interrupted {
                    job_id: job_id.to_string(),
                });
            }

            let Some(id) = entry.id else {
                errors.push(ErrorTag::DetailError.for_record("unknown"));
                ledger.record_outcome(job_id, &entry.key, ItemOutcome::Failed)?;
                continue;
            };
            if done.get(id) == Some(&ItemOutcome::Success) {
                continue;
            }

            let outcome = if !force_refetch && store.has_valid(id) {
                ItemOutcome::Success
            } else {
                self.fetch_and_store(&store, job_id, id, entry.metadata, &mut errors, &mut stats)
                    .await
            };
            ledger.record_outcome(job_id, id, outcome)?;

            if stats.consecutive >= self.config.failure_warning_threshold {
                warn!(
                    consecutive = stats.consecutive,
                    "persistent failures fetching conversation details; credentials may have \
                     expired, the API may be rate limiting, or the endpoint may have changed. \
                     Check `auth-status`, refresh with `auth-setup`, or fall back to `import-json`"
                );
                stats.consecutive = 0;
            }
            if (index + 1) % PROGRESS_EVERY == 0 {
                info!(processed = index + 1, total, "export progress");
            }
        }

        let finished = ledger.update(
            job_id,
            JobUpdate::status(JobStatus::Completed).errors(errors),
        )?;
        info!(
            total = finished.total,
            successful = finished.successful,
            failed = finished.failed,
            "export complete"
        );
        report_hints(&stats);
        Ok(())
    }

    async fn fetch_and_store(
        &self,
        store: &EncryptedStore,
        job_id: &str,
        id: &str,
        metadata: &Value,
        errors: &mut Vec<String>,
        stats: &mut FailureStats,
    ) -> ItemOutcome {
        match self.fetcher.fetch_detail(id).await {
            Ok(Some(record)) => {
                stats.consecutive = 0;
                if store.store(&record, &provenance(metadata, job_id)) {
                    ItemOutcome::Success
                } else {
                    error!(record = id_prefix(id), "storage failed");
                    errors.push(ErrorTag::StorageFailed.for_record(id));
                    ItemOutcome::Failed
                }
            }
            Ok(None) => {
                stats.detail_failed();
                stats.not_found += 1;
                errors.push(ErrorTag::FetchFailed.for_record(id));
                ItemOutcome::Failed
            }
            Err(err) => {
                stats.detail_failed();
                let tag = match err {
                    FetchError::Auth(_) => {
                        stats.auth += 1;
                        ErrorTag::AuthFailed
                    }
                    FetchError::RateLimited { .. } => {
                        stats.rate_limited += 1;
                        ErrorTag::DetailError
                    }
                    _ => ErrorTag::DetailError,
                };
                warn!(record = id_prefix(id), "detail fetch failed: {err}");
                errors.push(tag.for_record(id));
                ItemOutcome::Failed
            }
        }
    }

    pub fn job_status(&self, job_id: &str) -> Result<Option<ExportJob>, ExportError> {
        Ok(JobLedger::open(&self.config.archive.ledger_path())?.get(job_id)?)
    }

    pub fn last_export(&self) -> Result<Option<ExportJob>, ExportError> {
        Ok(JobLedger::open(&self.config.archive.ledger_path())?.get_last()?)
    }
}

/// One listed conversation, keyed the way `job_items` records it.
struct ListingEntry<'a> {
    key: String,
    id: Option<&'a str>,
    metadata: &'a Value,
}

/// Listing entries with repeated ids dropped, first occurrence wins. Entries without an id
/// are keyed by position.
fn distinct_entries(listing: &[Value]) -> Vec<ListingEntry<'_>> {
    let mut seen = HashSet::new();
    listing
        .iter()
        .enumerate()
        .filter_map(|(index, metadata)| {
            let id = record_id(metadata);
            let key = match id {
                Some(id) => id.to_string(),
                None => format!("unidentified-{index}"),
            };
            seen.insert(key.clone()).then_some(ListingEntry { key, id, metadata })
        })
        .collect()
}

/// Listing metadata plus where the record came from.
fn provenance(metadata: &Value, job_id: &str) -> Value {
    let mut metadata = metadata.clone();
    if let Value::Object(fields) = &mut metadata {
        fields
            .entry("source")
            .or_insert_with(|| Value::from("fetch"));
        fields.insert("job_id".to_string(), Value::from(job_id));
    }
    metadata
}

fn mark_failed(ledger: &JobLedger, job_id: &str, reason: String) {
    let result = ledger.get(job_id).and_then(|job| {
        let mut errors = job.map(|job| job.errors).unwrap_or_default();
        errors.push(reason);
        ledger.update(job_id, JobUpdate::status(JobStatus::Failed).errors(errors))
    });
    if let Err(err) = result {
        error!(job_id, "could not mark job failed: {err}");
    }
}

fn report_hints(stats: &FailureStats) {
    if stats.detail == 0 {
        return;
    }
    info!(failures = stats.detail, "detail fetch failures observed");
    if stats.auth > 0 {
        warn!(count = stats.auth, "some failures look like credential problems; refresh the token");
    }
    if stats.rate_limited > 0 {
        warn!(count = stats.rate_limited, "some failures were rate limited; retry later with --resume");
    }
    if stats.not_found > 0 {
        warn!(count = stats.not_found, "some conversations were missing remotely or the endpoint changed");
    }
}
