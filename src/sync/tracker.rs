use std::time::Duration;

use tokio::time::Instant;

use crate::error::Result;
use crate::storage::{repository, Database};
use crate::sync::{JobStatus, SyncJob};

/// Default wait between status checks in `await_termination`.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Persists job runs and answers "has the latest run finished, and did it
/// succeed?".
#[derive(Clone)]
pub struct JobTracker {
    db: Database,
}

impl JobTracker {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert the job on first call, update it (and replace its record
    /// results) afterwards. Sets `job.id` on insert.
    pub async fn record(&self, job: &mut SyncJob) -> Result<i64> {
        let snapshot = job.clone();
        let id = self
            .db
            .writer()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let id = match snapshot.id {
                    Some(id) => {
                        repository::update_sync_job(&tx, id, &snapshot)?;
                        id
                    }
                    None => repository::insert_sync_job(&tx, &snapshot)?,
                };
                repository::replace_record_results(&tx, id, &snapshot.results)?;
                tx.commit()?;
                Ok::<i64, rusqlite::Error>(id)
            })
            .await?;
        job.id = Some(id);
        Ok(id)
    }

    pub async fn get(&self, id: i64) -> Result<Option<SyncJob>> {
        Ok(self
            .db
            .reader()
            .call(move |conn| repository::get_sync_job(conn, id))
            .await?)
    }

    /// Most recent run recorded under `job_name`.
    pub async fn latest(&self, job_name: &str) -> Result<Option<SyncJob>> {
        let job_name = job_name.to_string();
        Ok(self
            .db
            .reader()
            .call(move |conn| repository::latest_sync_job(conn, &job_name))
            .await?)
    }

    pub async fn recent(&self, limit: u32) -> Result<Vec<SyncJob>> {
        Ok(self
            .db
            .reader()
            .call(move |conn| repository::recent_sync_jobs(conn, limit))
            .await?)
    }

    async fn latest_status(&self, job_name: &str) -> Result<Option<JobStatus>> {
        let job_name = job_name.to_string();
        let status = self
            .db
            .reader()
            .call(move |conn| repository::latest_job_status(conn, &job_name))
            .await?;
        status.map(|s| s.parse()).transpose()
    }

    /// Wait until the latest run of `job_name` is terminal.
    ///
    /// Returns `false` if `timeout` elapses first, including when no run of
    /// that name has been recorded yet.
    pub async fn await_termination(
        &self,
        job_name: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.latest_status(job_name).await? {
                if status.is_terminal() {
                    return Ok(true);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                log::debug!("{job_name} did not terminate within {timeout:?}");
                return Ok(false);
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Whether the latest run of `job_name` succeeded. `false` when there is
    /// none.
    pub async fn is_successful(&self, job_name: &str) -> Result<bool> {
        Ok(self.latest_status(job_name).await? == Some(JobStatus::Succeeded))
    }
}
