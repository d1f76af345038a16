use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, Mutex};

use crate::config::SyncConfig;
use crate::crm::CrmSystem;
use crate::error::{Error, Result};
use crate::record::{ObjectType, Record};
use crate::storage::Database;
use crate::sync::batch::BatchUpserter;
use crate::sync::fetch::Fetcher;
use crate::sync::tracker::JobTracker;
use crate::sync::transform::Transformer;
use crate::sync::watermark::WatermarkStore;
use crate::sync::{
    NoopProgress, RecordResult, RecordStatus, SyncJob, SyncProgress, TriggerKind,
};

/// Runs the fetch → filter/transform → upsert pipeline for one job.
///
/// Runs are serialized: a poll never reads a watermark that an earlier run
/// is still about to advance.
pub struct SyncEngine {
    config: SyncConfig,
    job_name: String,
    source: Arc<dyn CrmSystem>,
    destination: Arc<dyn CrmSystem>,
    fetcher: Fetcher,
    transformer: Transformer,
    upserter: BatchUpserter,
    watermarks: WatermarkStore,
    tracker: JobTracker,
    progress: Arc<dyn SyncProgress>,
    run_lock: Mutex<()>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        source: Arc<dyn CrmSystem>,
        destination: Arc<dyn CrmSystem>,
        db: Database,
    ) -> Result<Self> {
        config.validate()?;
        let transformer = config.transformer()?;
        let fetcher = Fetcher::new(Arc::clone(&source), config.object, config.retry.clone());
        let upserter = BatchUpserter::new(Arc::clone(&destination), config.object)
            .page_size(config.page_size)
            .max_concurrent_pages(config.max_concurrent_pages)
            .retry(config.retry.clone());
        Ok(Self {
            job_name: config.job_name(),
            watermarks: WatermarkStore::new(db.clone(), config.watermark_default.clone()),
            tracker: JobTracker::new(db),
            config,
            source,
            destination,
            fetcher,
            transformer,
            upserter,
            progress: Arc::new(NoopProgress),
            run_lock: Mutex::new(()),
        })
    }

    pub fn with_progress(mut self, progress: Arc<dyn SyncProgress>) -> Self {
        self.upserter = self.upserter.progress(Arc::clone(&progress));
        self.progress = progress;
        self
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn object(&self) -> ObjectType {
        self.config.object
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn source(&self) -> &Arc<dyn CrmSystem> {
        &self.source
    }

    pub fn destination(&self) -> &Arc<dyn CrmSystem> {
        &self.destination
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    pub fn watermarks(&self) -> &WatermarkStore {
        &self.watermarks
    }

    /// One poll run: everything modified since the watermark.
    ///
    /// `started`, when given, receives the job id as soon as the job is
    /// recorded as running. A run-level failure (authentication, a failed
    /// fetch) is recorded as a failed job and then returned as `Err`; record
    /// failures only make the returned job `failed`.
    pub async fn run_poll(&self, started: Option<oneshot::Sender<i64>>) -> Result<SyncJob> {
        let _guard = self.run_lock.lock().await;
        let mut job = self.begin(TriggerKind::Poll).await?;
        if let (Some(tx), Some(id)) = (started, job.id) {
            let _ = tx.send(id);
        }

        match self.poll_pipeline().await {
            Ok((results, next_watermark)) => {
                job.finish(results);
                if let Err(e) = self.settle_watermark(&job, next_watermark).await {
                    return self.fail(job, e).await;
                }
                self.close(job).await
            }
            Err(e) => self.fail(job, e).await,
        }
    }

    /// One push run for a single externally delivered payload.
    ///
    /// A malformed payload is rejected before any job is recorded.
    pub async fn run_push(&self, payload: &str) -> Result<SyncJob> {
        let record = self.fetcher.fetch_one(payload)?;
        let _guard = self.run_lock.lock().await;
        let mut job = self.begin(TriggerKind::Push).await?;
        self.progress.on_records_fetched(&self.job_name, 1);

        match self.sync_records(std::slice::from_ref(&record)).await {
            Ok(results) => {
                job.finish(results);
                self.close(job).await
            }
            Err(e) => self.fail(job, e).await,
        }
    }

    async fn begin(&self, trigger: TriggerKind) -> Result<SyncJob> {
        let mut job = SyncJob::new(&self.job_name, trigger);
        job.start();
        let id = self.tracker.record(&mut job).await?;
        log::info!("Starting {trigger} run {id} of {}", self.job_name);
        self.progress.on_run_start(&self.job_name, trigger);
        Ok(job)
    }

    /// Fetch, filter and upsert. Also returns where the watermark should
    /// move if the run succeeds.
    async fn poll_pipeline(&self) -> Result<(Vec<RecordResult>, Option<DateTime<Utc>>)> {
        let since = match self.watermarks.stored(&self.job_name).await? {
            Some(ts) => ts,
            None => {
                // First run: the starting point is persisted before fetching.
                self.advance_watermark(self.watermarks.initial()).await?;
                self.watermarks.get(&self.job_name).await?
            }
        };
        log::debug!("{} fetching changes since {since}", self.job_name);

        let fetched = self.fetcher.fetch_changed(since).await?;
        self.progress.on_records_fetched(&self.job_name, fetched.len());

        let next = fetched.last().map(|last| last.last_modified);
        let results = self.sync_records(&fetched).await?;
        Ok((results, next))
    }

    /// Results come back in input order, skipped records included.
    async fn sync_records(&self, records: &[Record]) -> Result<Vec<RecordResult>> {
        let (kept, skipped) = self.transformer.split(records);
        if !skipped.is_empty() {
            log::debug!("{} skipped {} record(s) by inclusion rules", self.job_name, skipped.len());
        }
        let mut upserted = self.upserter.upsert(&self.job_name, &kept).await?.into_iter();

        let object = self.config.object;
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            if self.transformer.includes(record) {
                results.push(upserted.next().unwrap_or_else(|| {
                    RecordResult::failed(
                        record.id.clone(),
                        record.match_value(object).map(str::to_string),
                        "no upsert result for record",
                    )
                }));
            } else {
                results.push(RecordResult::skipped(
                    record.id.clone(),
                    record.match_value(object).map(str::to_string),
                ));
            }
        }
        Ok(results)
    }

    /// Advance past a successful run's records; a failed run leaves the
    /// watermark where it was.
    async fn settle_watermark(&self, job: &SyncJob, next: Option<DateTime<Utc>>) -> Result<()> {
        if !job.is_successful() {
            log::warn!(
                "{} run {} had {} failed record(s); watermark not advanced",
                self.job_name,
                job.id.unwrap_or_default(),
                job.count(RecordStatus::Failed)
            );
            return Ok(());
        }
        match next {
            Some(ts) => self.advance_watermark(ts).await,
            None => Ok(()),
        }
    }

    /// Record the finished job. If that write fails the job goes through
    /// `fail` so it does not stay `running`.
    async fn close(&self, mut job: SyncJob) -> Result<SyncJob> {
        if let Err(e) = self.tracker.record(&mut job).await {
            return self.fail(job, e).await;
        }
        self.complete(&job);
        Ok(job)
    }

    async fn advance_watermark(&self, ts: DateTime<Utc>) -> Result<()> {
        match self.watermarks.advance(&self.job_name, ts).await {
            Ok(()) => Ok(()),
            Err(e @ Error::WatermarkConflict { .. }) => {
                log::warn!("{e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn fail(&self, mut job: SyncJob, error: Error) -> Result<SyncJob> {
        job.abort(error.to_string());
        if let Err(record_err) = self.tracker.record(&mut job).await {
            log::error!(
                "Could not record failure of {} run {}: {record_err}",
                self.job_name,
                job.id.unwrap_or_default()
            );
        }
        log::warn!(
            "{} run {} failed: {error}",
            self.job_name,
            job.id.unwrap_or_default()
        );
        self.progress.on_run_complete(&job);
        Err(error)
    }

    fn complete(&self, job: &SyncJob) {
        log::info!(
            "{} run {} {}: {} created, {} updated, {} skipped, {} failed",
            self.job_name,
            job.id.unwrap_or_default(),
            job.status,
            job.count(RecordStatus::Created),
            job.count(RecordStatus::Updated),
            job.count(RecordStatus::SkippedFiltered),
            job.count(RecordStatus::Failed),
        );
        self.progress.on_run_complete(job);
    }
}
