pub mod config;
pub mod crm;
pub mod date_util;
pub mod error;
pub mod fixtures;
pub mod operations;
pub mod record;
pub mod storage;
pub mod sync;
pub mod trigger;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

pub use config::{DestinationProfile, SyncConfig, WatermarkExpr};
pub use crm::{CrmError, CrmSystem, QueryFilter, SandboxOrg, SqliteOrg};
pub use error::{Error, Result};
pub use operations::{cleanup, CleanupReport, OperationRegistry, OrgPair};
pub use record::{ObjectType, Record};
pub use storage::Database;
pub use sync::engine::SyncEngine;
pub use sync::{
    JobStatus, NoopProgress, RecordResult, RecordStatus, SyncJob, SyncProgress, TriggerKind,
};
pub use trigger::Trigger;

use sync::tracker::JobTracker;
use sync::watermark::WatermarkStore;

/// Org names used for the local SQLite-backed orgs.
pub const SOURCE_ORG: &str = "A";
pub const DESTINATION_ORG: &str = "B";

/// Main entry point: a database plus the org pair that jobs sync between.
pub struct OrgSync {
    db: Database,
    orgs: OrgPair,
    registry: OperationRegistry,
}

impl OrgSync {
    pub fn new(db: Database, orgs: OrgPair) -> Self {
        Self {
            db,
            orgs,
            registry: OperationRegistry::standard(),
        }
    }

    /// Both orgs stored in `db` itself.
    pub fn local(db: Database) -> Self {
        let orgs = OrgPair::new(
            Arc::new(SqliteOrg::new(db.clone(), SOURCE_ORG)),
            Arc::new(SqliteOrg::new(db.clone(), DESTINATION_ORG)),
        );
        Self::new(db, orgs)
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn orgs(&self) -> &OrgPair {
        &self.orgs
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn engine(&self, config: SyncConfig, progress: Arc<dyn SyncProgress>) -> Result<SyncEngine> {
        Ok(SyncEngine::new(
            config,
            Arc::clone(&self.orgs.a),
            Arc::clone(&self.orgs.b),
            self.db.clone(),
        )?
        .with_progress(progress))
    }

    // ── Runs ───────────────────────────────────────────────────────

    /// Run one poll to completion.
    pub async fn sync_once(&self, config: SyncConfig, progress: Arc<dyn SyncProgress>) -> Result<SyncJob> {
        self.engine(config, progress)?.run_poll(None).await
    }

    pub async fn push(
        &self,
        config: SyncConfig,
        payload: &str,
        progress: Arc<dyn SyncProgress>,
    ) -> Result<SyncJob> {
        self.engine(config, progress)?.run_push(payload).await
    }

    /// Start a trigger in the config's mode. Must be called inside a tokio
    /// runtime.
    pub fn start_trigger(&self, config: SyncConfig, progress: Arc<dyn SyncProgress>) -> Result<Trigger> {
        let mode = config.trigger;
        let engine = Arc::new(self.engine(config, progress)?);
        Ok(Trigger::start(engine, mode))
    }

    // ── Jobs ───────────────────────────────────────────────────────

    pub async fn jobs(&self, limit: u32) -> Result<Vec<SyncJob>> {
        JobTracker::new(self.db.clone()).recent(limit).await
    }

    pub async fn job(&self, id: i64) -> Result<SyncJob> {
        JobTracker::new(self.db.clone())
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {id}")))
    }

    // ── Watermarks ─────────────────────────────────────────────────

    pub async fn watermarks(&self) -> Result<Vec<(String, DateTime<Utc>)>> {
        self.watermark_store().list().await
    }

    pub async fn reset_watermark(&self, job_name: &str) -> Result<bool> {
        self.watermark_store().reset(job_name).await
    }

    fn watermark_store(&self) -> WatermarkStore {
        WatermarkStore::new(self.db.clone(), WatermarkExpr::default())
    }

    // ── Operations ─────────────────────────────────────────────────

    pub async fn run_operation(&self, name: &str, input: Value) -> Result<Value> {
        self.registry.resolve(name)?.call_json(&self.orgs, input).await
    }
}
