pub mod batch;
pub mod engine;
pub mod fetch;
pub mod retry;
pub mod tracker;
pub mod transform;
pub mod watermark;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Poll,
    Push,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerKind::Poll => "poll",
            TriggerKind::Push => "push",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "poll" => Ok(TriggerKind::Poll),
            "push" => Ok(TriggerKind::Push),
            other => Err(Error::Config(format!("unknown trigger kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::Database(format!("unknown job status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Created,
    Updated,
    SkippedFiltered,
    Failed,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Created => "created",
            RecordStatus::Updated => "updated",
            RecordStatus::SkippedFiltered => "skipped_filtered",
            RecordStatus::Failed => "failed",
        }
    }

    pub fn is_success(self) -> bool {
        !matches!(self, RecordStatus::Failed)
    }
}

impl FromStr for RecordStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(RecordStatus::Created),
            "updated" => Ok(RecordStatus::Updated),
            "skipped_filtered" => Ok(RecordStatus::SkippedFiltered),
            "failed" => Ok(RecordStatus::Failed),
            other => Err(Error::Database(format!("unknown record status: {other}"))),
        }
    }
}

/// Outcome of one record within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordResult {
    pub source_id: Option<String>,
    pub key: Option<String>,
    pub status: RecordStatus,
    pub destination_id: Option<String>,
    pub error: Option<String>,
}

impl RecordResult {
    pub fn failed(source_id: Option<String>, key: Option<String>, error: impl Into<String>) -> Self {
        Self {
            source_id,
            key,
            status: RecordStatus::Failed,
            destination_id: None,
            error: Some(error.into()),
        }
    }

    pub fn skipped(source_id: Option<String>, key: Option<String>) -> Self {
        Self {
            source_id,
            key,
            status: RecordStatus::SkippedFiltered,
            destination_id: None,
            error: None,
        }
    }
}

/// One execution of a named job.
#[derive(Debug, Clone, Serialize)]
pub struct SyncJob {
    pub id: Option<i64>,
    pub job_name: String,
    pub trigger: TriggerKind,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub results: Vec<RecordResult>,
    pub error: Option<String>,
}

impl SyncJob {
    pub fn new(job_name: impl Into<String>, trigger: TriggerKind) -> Self {
        Self {
            id: None,
            job_name: job_name.into(),
            trigger,
            status: JobStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            results: Vec::new(),
            error: None,
        }
    }

    pub fn start(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Utc::now();
    }

    /// Close the job. It succeeds only with no run-level error and no
    /// failed record.
    pub fn finish(&mut self, results: Vec<RecordResult>) {
        self.results = results;
        self.ended_at = Some(Utc::now());
        self.status = if self.error.is_none() && self.results.iter().all(|r| r.status.is_success()) {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        };
    }

    /// Close the job as failed with a run-level error.
    pub fn abort(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.ended_at = Some(Utc::now());
        self.status = JobStatus::Failed;
    }

    pub fn is_successful(&self) -> bool {
        self.status == JobStatus::Succeeded
    }

    pub fn count(&self, status: RecordStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

/// Callback interface for reporting run progress.
pub trait SyncProgress: Send + Sync {
    fn on_run_start(&self, _job_name: &str, _trigger: TriggerKind) {}
    fn on_records_fetched(&self, _job_name: &str, _count: usize) {}
    fn on_page_complete(&self, _job_name: &str, _page: usize, _total_pages: usize) {}
    fn on_run_complete(&self, _job: &SyncJob) {}
}

/// No-op progress reporter (for library/test usage).
pub struct NoopProgress;

impl SyncProgress for NoopProgress {}
