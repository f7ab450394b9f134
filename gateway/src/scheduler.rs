//! The tick loop
//!
//! One cooperative task drives every connection: submission first, then
//! ingestion, all under the connection's mutex. Failures are logged and
//! counted, never propagated out of the tick; transient upstream errors
//! put the connection on exponential backoff capped at ten minutes.

use crate::{Gateway, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Scheduler pacing.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between ticks
    pub tick: Duration,
    /// First backoff delay after a transient failure
    pub backoff_base: Duration,
    /// Backoff ceiling
    pub backoff_cap: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct BackoffState {
    consecutive_failures: u32,
    retry_after: Option<DateTime<Utc>>,
}

/// Background loop driving submission and ingestion per connection.
pub struct Scheduler {
    gateway: Arc<Gateway>,
    config: SchedulerConfig,
    backoff: Mutex<HashMap<String, BackoffState>>,
    failure_count: AtomicU64,
}

impl Scheduler {
    pub fn new(gateway: Arc<Gateway>, config: SchedulerConfig) -> Self {
        Self {
            gateway,
            config,
            backoff: Mutex::new(HashMap::new()),
            failure_count: AtomicU64::new(0),
        }
    }

    /// Run forever; cancel the task to stop.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.config.tick);
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    /// Total failed tick-actions, for observability and tests.
    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// One pass over a snapshot of the connections.
    pub async fn tick(&self) {
        let connections = self.gateway.list_connection_ids().await;
        let now = self.gateway.clock.now();

        for connection_id in connections {
            if self.in_backoff(&connection_id, now).await {
                continue;
            }
            match self.run_connection(&connection_id).await {
                Ok(()) => {
                    self.backoff.lock().await.remove(&connection_id);
                }
                Err(err) => {
                    self.failure_count.fetch_add(1, Ordering::Relaxed);
                    if err.is_retryable() {
                        let delay = self.note_failure(&connection_id, now).await;
                        warn!(
                            connection = %connection_id,
                            retry_in_secs = delay.as_secs(),
                            "tick action failed transiently: {}",
                            err
                        );
                    } else {
                        warn!(connection = %connection_id, "tick action failed: {}", err);
                    }
                }
            }
        }
    }

    async fn run_connection(&self, connection_id: &str) -> Result<()> {
        let connection = self.gateway.connection(connection_id).await?;
        if !connection.is_ready() {
            // Nothing can move before the handshake is complete.
            debug!(connection = %connection_id, "skipping tick, connection not ready");
            return Ok(());
        }
        self.gateway.submit_pending_payments(connection_id).await?;
        self.gateway.fetch_statements(connection_id, None).await?;
        Ok(())
    }

    async fn in_backoff(&self, connection_id: &str, now: DateTime<Utc>) -> bool {
        let backoff = self.backoff.lock().await;
        backoff
            .get(connection_id)
            .and_then(|state| state.retry_after)
            .map(|retry_after| now < retry_after)
            .unwrap_or(false)
    }

    async fn note_failure(&self, connection_id: &str, now: DateTime<Utc>) -> Duration {
        let mut backoff = self.backoff.lock().await;
        let state = backoff.entry(connection_id.to_string()).or_default();
        state.consecutive_failures += 1;
        let delay = backoff_delay(
            self.config.backoff_base,
            self.config.backoff_cap,
            state.consecutive_failures,
        );
        state.retry_after =
            Some(now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()));
        delay
    }
}

/// `base * 2^(failures-1)`, capped.
fn backoff_delay(base: Duration, cap: Duration, consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(20);
    let delay = base.saturating_mul(1u32 << exponent);
    delay.min(cap)
}
