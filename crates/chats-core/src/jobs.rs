use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Export job lifecycle: `Pending -> InProgress -> {Completed, Failed}`.
///
/// `Completed` is final. `Failed` is not: an interrupted or crashed run leaves its job
/// `Failed`, and `export --resume` reopens that same job (`Failed -> InProgress`) so its
/// per-record progress and error list carry over instead of starting a new row.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            JobStatus::Completed | JobStatus::Failed => true,
            JobStatus::Pending | JobStatus::InProgress => false,
        }
    }

    /// Legal status changes. `Failed -> InProgress` is the explicit reopen used by resume;
    /// `InProgress -> InProgress` is a resume of an interrupted run.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::InProgress | JobStatus::Failed) => true,
            (JobStatus::InProgress, JobStatus::InProgress)
            | (JobStatus::InProgress, JobStatus::Completed)
            | (JobStatus::InProgress, JobStatus::Failed) => true,
            (JobStatus::Failed, JobStatus::InProgress | JobStatus::Failed) => true,
            (JobStatus::Pending, JobStatus::Pending | JobStatus::Completed) => false,
            (JobStatus::InProgress, JobStatus::Pending) => false,
            (JobStatus::Failed, JobStatus::Pending | JobStatus::Completed) => false,
            (JobStatus::Completed, _) => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "in_progress" => Ok(JobStatus::InProgress),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Per-record outcome recorded against a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Success,
    Failed,
}

impl ItemOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemOutcome::Success => "success",
            ItemOutcome::Failed => "failed",
        }
    }
}

impl FromStr for ItemOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ItemOutcome::Success),
            "failed" => Ok(ItemOutcome::Failed),
            other => Err(format!("unknown item outcome: {other}")),
        }
    }
}

/// One export attempt. Rows are an audit trail and are never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportJob {
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub errors: Vec<String>,
    pub status: JobStatus,
}

/// Classified per-item error tags appended to a job's error list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorTag {
    FetchFailed,
    AuthFailed,
    StorageFailed,
    DetailError,
}

impl ErrorTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorTag::FetchFailed => "fetch_failed",
            ErrorTag::AuthFailed => "auth_failed",
            ErrorTag::StorageFailed => "storage_failed",
            ErrorTag::DetailError => "detail_error",
        }
    }

    /// `<tag>:<id prefix>`; never the full identifier.
    pub fn for_record(&self, id: &str) -> String {
        format!("{}:{}", self.as_str(), crate::id_prefix(id))
    }
}
