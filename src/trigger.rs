use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{Error, Result};
use crate::sync::engine::SyncEngine;
use crate::sync::{SyncJob, TriggerKind};

/// Starts runs of a job, either on a schedule or per pushed payload.
pub enum Trigger {
    Poll(PollTrigger),
    Push(PushTrigger),
}

impl Trigger {
    /// Start a trigger for the engine's job. In poll mode this spawns the
    /// scheduling loop, so it must be called inside a tokio runtime.
    pub fn start(engine: Arc<SyncEngine>, mode: TriggerKind) -> Self {
        match mode {
            TriggerKind::Poll => Trigger::Poll(PollTrigger::spawn(engine)),
            TriggerKind::Push => Trigger::Push(PushTrigger { engine }),
        }
    }

    pub fn kind(&self) -> TriggerKind {
        match self {
            Trigger::Poll(_) => TriggerKind::Poll,
            Trigger::Push(_) => TriggerKind::Push,
        }
    }

    pub fn job_name(&self) -> &str {
        match self {
            Trigger::Poll(p) => p.engine.job_name(),
            Trigger::Push(p) => p.engine.job_name(),
        }
    }

    /// Fire a poll now. Resolves with the job id once the run is recorded
    /// as running, not when it finishes.
    pub async fn run_once(&self) -> Result<i64> {
        match self {
            Trigger::Poll(p) => p.run_once().await,
            Trigger::Push(_) => Err(Error::Config(
                "run_once is only available on poll triggers".into(),
            )),
        }
    }

    /// Run the pipeline for one payload on the caller's task.
    pub async fn push(&self, payload: &str) -> Result<SyncJob> {
        match self {
            Trigger::Push(p) => p.push(payload).await,
            Trigger::Poll(_) => Err(Error::Config(
                "push is only available on push triggers".into(),
            )),
        }
    }

    /// Prevent future scheduled firings. An in-flight run completes.
    pub fn stop(&self) {
        if let Trigger::Poll(p) = self {
            p.stop();
        }
    }

    /// Wait for the scheduling loop to exit (after `stop`).
    pub async fn join(self) {
        if let Trigger::Poll(p) = self {
            p.join().await;
        }
    }
}

pub struct PollTrigger {
    engine: Arc<SyncEngine>,
    run_now: mpsc::Sender<oneshot::Sender<i64>>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PollTrigger {
    fn spawn(engine: Arc<SyncEngine>) -> Self {
        let (run_now, run_now_rx) = mpsc::channel(8);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(poll_loop(Arc::clone(&engine), run_now_rx, shutdown_rx));
        Self {
            engine,
            run_now,
            shutdown,
            handle,
        }
    }

    async fn run_once(&self) -> Result<i64> {
        let (tx, rx) = oneshot::channel();
        self.run_now
            .send(tx)
            .await
            .map_err(|_| Error::Other(format!("poll trigger for {} is stopped", self.engine.job_name())))?;
        rx.await.map_err(|_| {
            Error::Other(format!(
                "poll run of {} ended before it was recorded",
                self.engine.job_name()
            ))
        })
    }

    fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn join(self) {
        if let Err(e) = self.handle.await {
            log::error!("Poll loop for {} panicked: {e}", self.engine.job_name());
        }
    }
}

pub struct PushTrigger {
    engine: Arc<SyncEngine>,
}

impl PushTrigger {
    async fn push(&self, payload: &str) -> Result<SyncJob> {
        self.engine.run_push(payload).await
    }
}

async fn poll_loop(
    engine: Arc<SyncEngine>,
    mut run_now: mpsc::Receiver<oneshot::Sender<i64>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let config = engine.config();
    let period = config.poll_interval().max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + config.poll_start_delay(), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    log::info!(
        "Polling {} every {period:?} after {:?}",
        engine.job_name(),
        config.poll_start_delay()
    );

    loop {
        let started = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            ack = run_now.recv() => match ack {
                Some(ack) => Some(ack),
                None => break,
            },
            _ = ticker.tick() => None,
        };
        // Failures are recorded as failed jobs by the engine; keep polling.
        if let Err(e) = engine.run_poll(started).await {
            log::debug!("Poll firing of {} ended with: {e}", engine.job_name());
        }
    }
    log::info!("Poll trigger for {} stopped", engine.job_name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SyncConfig, WatermarkExpr};
    use crate::crm::{CrmError, SandboxOrg};
    use crate::fixtures::test_user;
    use crate::record::ObjectType;
    use crate::storage::Database;
    use crate::sync::tracker::DEFAULT_POLL_INTERVAL;

    const TIMEOUT: Duration = Duration::from_secs(60);

    async fn engine(
        poll_interval_ms: u64,
        poll_start_delay_ms: u64,
    ) -> (Arc<SandboxOrg>, Arc<SandboxOrg>, Arc<SyncEngine>) {
        let db = Database::open_memory().await.unwrap();
        let a = Arc::new(SandboxOrg::new("A"));
        let b = Arc::new(SandboxOrg::new("B"));
        let config = SyncConfig {
            poll_interval_ms,
            poll_start_delay_ms,
            watermark_default: WatermarkExpr::parse("now-10s").unwrap(),
            ..SyncConfig::for_object(ObjectType::User)
        };
        let engine = SyncEngine::new(config, a.clone(), b.clone(), db).unwrap();
        (a, b, Arc::new(engine))
    }

    #[tokio::test]
    async fn test_run_once_then_await_termination() {
        let (a, b, engine) = engine(3_600_000, 3_600_000).await;
        let user = test_user("Polled", true);
        let email = user.get_str("Email").unwrap().to_string();
        a.seed(ObjectType::User, vec![user]);

        let trigger = Trigger::start(Arc::clone(&engine), TriggerKind::Poll);
        let id = trigger.run_once().await.unwrap();

        let tracker = engine.tracker();
        assert!(tracker
            .await_termination(trigger.job_name(), TIMEOUT, DEFAULT_POLL_INTERVAL)
            .await
            .unwrap());
        assert!(tracker.is_successful(trigger.job_name()).await.unwrap());
        assert_eq!(tracker.latest(trigger.job_name()).await.unwrap().unwrap().id, Some(id));
        assert!(b.find_by_key(ObjectType::User, &email).is_some());

        trigger.stop();
        trigger.join().await;
    }

    #[tokio::test]
    async fn test_failed_firing_does_not_stop_the_loop() {
        let (a, _b, engine) = engine(3_600_000, 3_600_000).await;
        a.fail_next_query(CrmError::Authentication("session expired".into()));
        let trigger = Trigger::start(Arc::clone(&engine), TriggerKind::Poll);

        let failed = trigger.run_once().await.unwrap();
        let tracker = engine.tracker();
        tracker
            .await_termination(trigger.job_name(), TIMEOUT, Duration::from_millis(5))
            .await
            .unwrap();
        assert!(!tracker.is_successful(trigger.job_name()).await.unwrap());

        let succeeded = trigger.run_once().await.unwrap();
        assert!(succeeded > failed);
        tracker
            .await_termination(trigger.job_name(), TIMEOUT, Duration::from_millis(5))
            .await
            .unwrap();
        assert!(tracker.is_successful(trigger.job_name()).await.unwrap());

        trigger.stop();
        trigger.join().await;
    }

    #[tokio::test]
    async fn test_scheduled_firings_run_without_prompting() {
        let (_a, _b, engine) = engine(10, 0).await;
        let trigger = Trigger::start(Arc::clone(&engine), TriggerKind::Poll);

        let tracker = engine.tracker();
        assert!(tracker
            .await_termination(trigger.job_name(), TIMEOUT, Duration::from_millis(5))
            .await
            .unwrap());
        trigger.stop();
        trigger.join().await;
        assert!(!tracker.recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_once_after_stop_fails() {
        let (_a, _b, engine) = engine(3_600_000, 3_600_000).await;
        let trigger = Trigger::start(Arc::clone(&engine), TriggerKind::Poll);
        trigger.stop();
        // Give the loop a chance to exit.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(trigger.run_once().await.is_err());
        trigger.join().await;
    }

    #[tokio::test]
    async fn test_modes_reject_the_other_entry_point() {
        let (_a, _b, engine) = engine(3_600_000, 3_600_000).await;
        let push = Trigger::start(Arc::clone(&engine), TriggerKind::Push);
        assert!(matches!(push.run_once().await, Err(Error::Config(_))));

        let poll = Trigger::start(engine, TriggerKind::Poll);
        assert!(matches!(poll.push("{}").await, Err(Error::Config(_))));
        poll.stop();
        poll.join().await;
    }

    #[tokio::test]
    async fn test_push_trigger_runs_on_callers_task() {
        let (_a, b, engine) = engine(3_600_000, 3_600_000).await;
        let trigger = Trigger::start(engine, TriggerKind::Push);
        let job = trigger
            .push(r#"{"Email": "pushed@fakemail.com", "FirstName": "Pushed", "IsActive": true}"#)
            .await
            .unwrap();
        assert!(job.is_successful());
        assert!(b.find_by_key(ObjectType::User, "pushed@fakemail.com").is_some());
    }
}
