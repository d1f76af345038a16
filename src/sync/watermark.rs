use chrono::{DateTime, Utc};

use crate::config::WatermarkExpr;
use crate::date_util::{from_micros, to_micros};
use crate::error::{Error, Result};
use crate::storage::{repository, Database};

/// Last-processed timestamp per job name, persisted in SQLite.
///
/// Advances are a single conditional upsert on the writer connection, so
/// concurrent writers for one job cannot rewind it and readers only ever see
/// a committed value.
#[derive(Clone)]
pub struct WatermarkStore {
    db: Database,
    default: WatermarkExpr,
}

impl WatermarkStore {
    pub fn new(db: Database, default: WatermarkExpr) -> Self {
        Self { db, default }
    }

    /// The stored watermark, or the default expression evaluated now.
    pub async fn get(&self, job_name: &str) -> Result<DateTime<Utc>> {
        Ok(self.stored(job_name).await?.unwrap_or_else(|| self.initial()))
    }

    /// Where a job with no stored watermark starts, as of now.
    pub fn initial(&self) -> DateTime<Utc> {
        self.default.evaluate(Utc::now())
    }

    pub async fn stored(&self, job_name: &str) -> Result<Option<DateTime<Utc>>> {
        let job_name = job_name.to_string();
        let micros = self
            .db
            .reader()
            .call(move |conn| repository::get_watermark(conn, &job_name))
            .await?;
        Ok(micros.map(from_micros))
    }

    /// Move the watermark to `ts`. Fails with `WatermarkConflict`, leaving
    /// the stored value alone, unless `ts` is later than it.
    pub async fn advance(&self, job_name: &str, ts: DateTime<Utc>) -> Result<()> {
        let advanced = self
            .db
            .writer()
            .call({
                let job_name = job_name.to_string();
                let micros = to_micros(ts);
                move |conn| repository::advance_watermark(conn, &job_name, micros)
            })
            .await?;
        if advanced {
            log::debug!("Watermark for {job_name} advanced to {ts}");
            return Ok(());
        }
        let stored = self.stored(job_name).await?.unwrap_or(ts);
        Err(Error::WatermarkConflict {
            job: job_name.to_string(),
            stored,
            proposed: ts,
        })
    }

    /// Forget the watermark so the next run starts from the default.
    pub async fn reset(&self, job_name: &str) -> Result<bool> {
        let job_name = job_name.to_string();
        let removed = self
            .db
            .writer()
            .call(move |conn| repository::delete_watermark(conn, &job_name))
            .await?;
        Ok(removed)
    }

    pub async fn list(&self) -> Result<Vec<(String, DateTime<Utc>)>> {
        let rows = self
            .db
            .reader()
            .call(|conn| repository::list_watermarks(conn))
            .await?;
        Ok(rows.into_iter().map(|(job, us)| (job, from_micros(us))).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    async fn store(default: &str) -> WatermarkStore {
        let db = Database::open_memory().await.unwrap();
        WatermarkStore::new(db, WatermarkExpr::parse(default).unwrap())
    }

    #[tokio::test]
    async fn test_get_falls_back_to_default_expression() {
        let store = store("now-10s").await;
        let before = Utc::now();
        let wm = store.get("users").await.unwrap();
        let after = Utc::now();
        assert!(wm >= before - TimeDelta::seconds(10));
        assert!(wm <= after - TimeDelta::seconds(10));
        assert_eq!(store.stored("users").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_advance_is_monotonic() {
        let store = store("now").await;
        let w1 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let w2 = w1 + TimeDelta::milliseconds(1);

        store.advance("users", w2).await.unwrap();
        let err = store.advance("users", w1).await.unwrap_err();
        match err {
            Error::WatermarkConflict { stored, proposed, .. } => {
                assert_eq!(stored, w2);
                assert_eq!(proposed, w1);
            }
            other => panic!("expected conflict, got {other}"),
        }
        assert_eq!(store.get("users").await.unwrap(), w2);
    }

    #[tokio::test]
    async fn test_advance_to_same_value_is_a_conflict() {
        let store = store("now").await;
        let w = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        store.advance("users", w).await.unwrap();
        assert!(matches!(
            store.advance("users", w).await,
            Err(Error::WatermarkConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_advances_keep_the_latest() {
        let store = store("now").await;
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        let mut handles = Vec::new();
        for i in (0..20).rev() {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let _ = store.advance("users", base + TimeDelta::seconds(i)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.get("users").await.unwrap(), base + TimeDelta::seconds(19));
    }

    #[tokio::test]
    async fn test_reset_and_list() {
        let store = store("now").await;
        let w = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        store.advance("users", w).await.unwrap();
        store.advance("accounts", w).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 2);

        assert!(store.reset("users").await.unwrap());
        assert!(!store.reset("users").await.unwrap());
        assert_eq!(store.stored("users").await.unwrap(), None);
        assert_eq!(store.list().await.unwrap(), vec![("accounts".to_string(), w)]);
    }
}
