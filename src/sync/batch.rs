use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;

use crate::crm::{CrmError, CrmSystem, UpsertOutcome};
use crate::error::{Error, Result};
use crate::record::{ObjectType, Record};
use crate::sync::retry::RetryPolicy;
use crate::sync::{NoopProgress, RecordResult, RecordStatus, SyncProgress};

/// Default number of records per upsert call.
pub const DEFAULT_PAGE_SIZE: usize = 1_000;

/// Writes records to the destination org in pages.
///
/// Pages are submitted concurrently up to `max_concurrent_pages`. A page
/// that fails (after retries, for transient errors) marks only its own
/// records failed; an authentication failure aborts the whole upsert.
#[derive(Clone)]
pub struct BatchUpserter {
    destination: Arc<dyn CrmSystem>,
    object: ObjectType,
    page_size: usize,
    max_concurrent_pages: usize,
    retry: RetryPolicy,
    progress: Arc<dyn SyncProgress>,
}

enum PageOutcome {
    Done(Vec<RecordResult>),
    Aborted(CrmError),
}

impl BatchUpserter {
    pub fn new(destination: Arc<dyn CrmSystem>, object: ObjectType) -> Self {
        Self {
            destination,
            object,
            page_size: DEFAULT_PAGE_SIZE,
            max_concurrent_pages: 1,
            retry: RetryPolicy::default(),
            progress: Arc::new(NoopProgress),
        }
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn max_concurrent_pages(mut self, limit: usize) -> Self {
        self.max_concurrent_pages = limit.max(1);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn progress(mut self, progress: Arc<dyn SyncProgress>) -> Self {
        self.progress = progress;
        self
    }

    /// Upsert `records`, returning exactly one result per record, in input
    /// order. `job_name` is only used for logging and progress.
    pub async fn upsert(&self, job_name: &str, records: &[Record]) -> Result<Vec<RecordResult>> {
        let pages: Vec<&[Record]> = records.chunks(self.page_size).collect();
        let total_pages = pages.len();
        if total_pages == 0 {
            return Ok(Vec::new());
        }
        log::info!(
            "{job_name}: upserting {} {} records into {} in {total_pages} page(s)",
            records.len(),
            self.object,
            self.destination.name()
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_pages));
        let mut in_flight = FuturesUnordered::new();
        for (index, page) in pages.iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            in_flight.push(async move {
                let _permit = semaphore.acquire().await;
                (index, self.submit_page(job_name, index, page).await)
            });
        }

        let mut by_page: Vec<Option<Vec<RecordResult>>> = vec![None; total_pages];
        let mut completed = 0;
        while let Some((index, outcome)) = in_flight.next().await {
            match outcome {
                PageOutcome::Done(results) => {
                    by_page[index] = Some(results);
                    completed += 1;
                    self.progress.on_page_complete(job_name, completed, total_pages);
                }
                PageOutcome::Aborted(e) => {
                    log::error!("{job_name}: page {} aborted the upsert: {e}", index + 1);
                    return Err(Error::Crm(e));
                }
            }
        }

        Ok(by_page.into_iter().flatten().flatten().collect())
    }

    async fn submit_page(&self, job_name: &str, index: usize, page: &[Record]) -> PageOutcome {
        let what = format!("{job_name}: page {}", index + 1);
        let response = self
            .retry
            .run(&what, || self.destination.upsert_batch(self.object, page))
            .await;
        match response {
            Ok(outcomes) => PageOutcome::Done(self.map_outcomes(page, outcomes)),
            Err(e) if e.is_fatal() => PageOutcome::Aborted(e),
            Err(e) => {
                log::warn!("{what} failed, marking {} records failed: {e}", page.len());
                PageOutcome::Done(
                    page.iter()
                        .map(|r| RecordResult::failed(r.id.clone(), self.key_of(r), e.to_string()))
                        .collect(),
                )
            }
        }
    }

    fn map_outcomes(&self, page: &[Record], outcomes: Vec<UpsertOutcome>) -> Vec<RecordResult> {
        let mut outcomes = outcomes.into_iter();
        page.iter()
            .map(|record| {
                let source_id = record.id.clone();
                let key = self.key_of(record);
                match outcomes.next() {
                    Some(UpsertOutcome::Created { id }) => RecordResult {
                        source_id,
                        key,
                        status: RecordStatus::Created,
                        destination_id: Some(id),
                        error: None,
                    },
                    Some(UpsertOutcome::Updated { id }) => RecordResult {
                        source_id,
                        key,
                        status: RecordStatus::Updated,
                        destination_id: Some(id),
                        error: None,
                    },
                    Some(UpsertOutcome::Failed { message }) => {
                        RecordResult::failed(source_id, key, CrmError::Validation(message).to_string())
                    }
                    None => RecordResult::failed(source_id, key, "no outcome returned for record"),
                }
            })
            .collect()
    }

    fn key_of(&self, record: &Record) -> Option<String> {
        record.match_value(self.object).map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::SandboxOrg;
    use crate::record::a_user;
    use std::time::Duration;

    fn users(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| {
                a_user()
                    .id(format!("005SRC{i:04}"))
                    .with("Email", format!("user{i}@fakemail.com"))
                    .build()
            })
            .collect()
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    fn upserter(org: &Arc<SandboxOrg>, page_size: usize) -> BatchUpserter {
        BatchUpserter::new(org.clone(), ObjectType::User)
            .page_size(page_size)
            .retry(fast_retry())
    }

    #[tokio::test]
    async fn test_one_result_per_record_in_input_order() {
        let org = Arc::new(SandboxOrg::new("B"));
        let records = users(7);
        let results = upserter(&org, 3).upsert("users", &records).await.unwrap();

        assert_eq!(results.len(), records.len());
        for (record, result) in records.iter().zip(&results) {
            assert_eq!(result.source_id, record.id);
            assert_eq!(result.status, RecordStatus::Created);
        }
        assert_eq!(org.batch_sizes(), vec![3, 3, 1]);
    }

    #[tokio::test]
    async fn test_empty_input_makes_no_calls() {
        let org = Arc::new(SandboxOrg::new("B"));
        let results = upserter(&org, 3).upsert("users", &[]).await.unwrap();
        assert!(results.is_empty());
        assert_eq!(org.upsert_calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_page_does_not_affect_other_pages() {
        let org = Arc::new(SandboxOrg::new("B"));
        org.fail_next_upsert(CrmError::Validation("INVALID_FIELD".into()));
        let records = users(6);

        let results = upserter(&org, 2).upsert("users", &records).await.unwrap();
        assert_eq!(results.len(), 6);
        let failed: Vec<_> = results.iter().filter(|r| r.status == RecordStatus::Failed).collect();
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|r| r.error.as_deref().unwrap().contains("INVALID_FIELD")));
        // Validation errors are not retried: three pages, three calls.
        assert_eq!(org.upsert_calls(), 3);
        assert_eq!(
            results.iter().filter(|r| r.status == RecordStatus::Created).count(),
            4
        );
    }

    #[tokio::test]
    async fn test_transient_page_failure_is_retried() {
        let org = Arc::new(SandboxOrg::new("B"));
        org.fail_next_upsert(CrmError::Transport("read timed out".into()));
        org.fail_next_upsert(CrmError::RateLimited("REQUEST_LIMIT_EXCEEDED".into()));

        let results = upserter(&org, 10).upsert("users", &users(3)).await.unwrap();
        assert!(results.iter().all(|r| r.status == RecordStatus::Created));
        assert_eq!(org.upsert_calls(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_page() {
        let org = Arc::new(SandboxOrg::new("B"));
        for _ in 0..3 {
            org.fail_next_upsert(CrmError::Transport("connection reset".into()));
        }
        let results = upserter(&org, 10).upsert("users", &users(2)).await.unwrap();
        assert!(results.iter().all(|r| r.status == RecordStatus::Failed));
        assert_eq!(org.upsert_calls(), 3);
    }

    #[tokio::test]
    async fn test_authentication_failure_aborts() {
        let org = Arc::new(SandboxOrg::new("B"));
        org.fail_next_upsert(CrmError::Authentication("INVALID_SESSION_ID".into()));
        let err = upserter(&org, 2).upsert("users", &users(4)).await.unwrap_err();
        assert!(matches!(err, Error::Crm(CrmError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_per_record_failures_are_reported() {
        let org = Arc::new(SandboxOrg::new("B"));
        org.reject_when("Email", "user1@fakemail.com", "DUPLICATE_USERNAME");
        let results = upserter(&org, 10).upsert("users", &users(3)).await.unwrap();
        let statuses: Vec<_> = results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![RecordStatus::Created, RecordStatus::Failed, RecordStatus::Created]
        );
        assert_eq!(results[1].key.as_deref(), Some("user1@fakemail.com"));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded_and_order_preserved() {
        let org = Arc::new(SandboxOrg::new("B"));
        org.set_latency(Duration::from_millis(20));
        let records = users(20);

        let results = upserter(&org, 2)
            .max_concurrent_pages(3)
            .upsert("users", &records)
            .await
            .unwrap();

        assert_eq!(org.upsert_calls(), 10);
        assert!(org.max_in_flight() <= 3);
        assert!(org.max_in_flight() >= 2);
        let ids: Vec<_> = results.iter().map(|r| r.source_id.clone()).collect();
        let expected: Vec<_> = records.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_reupsert_reports_updates() {
        let org = Arc::new(SandboxOrg::new("B"));
        let records = users(2);
        upserter(&org, 10).upsert("users", &records).await.unwrap();
        let results = upserter(&org, 10).upsert("users", &records).await.unwrap();
        assert!(results.iter().all(|r| r.status == RecordStatus::Updated));
    }
}
