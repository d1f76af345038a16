use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crm::CrmError;

/// Bounded exponential backoff for transient CRM failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Wait before retry number `attempt` (0-based): base * 2^attempt, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self.base_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Run `call` until it succeeds, fails with a non-transient error, or
    /// the retry budget is spent. `what` names the call in log lines.
    pub async fn run<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, CrmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CrmError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match call().await {
                Ok(val) => return Ok(val),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let wait = self.backoff(attempt);
                    log::warn!(
                        "{what} failed ({e}). Waiting {}ms before retry {}/{}",
                        wait.as_millis(),
                        attempt + 1,
                        self.max_retries
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
