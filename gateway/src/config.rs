//! Environment-driven configuration

use crate::scheduler::SchedulerConfig;
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Seconds between scheduler ticks
    pub tick_seconds: u64,
    /// First backoff delay after a transient failure
    pub backoff_base_seconds: u64,
    /// Backoff ceiling
    pub backoff_cap_seconds: u64,
    /// How far back the first statement fetch reaches
    pub fetch_window_days: i64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 1,
            backoff_base_seconds: 2,
            backoff_cap_seconds: 600,
            fetch_window_days: 30,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            tick_seconds: env_u64("GATEWAY_TICK_SECONDS", defaults.tick_seconds),
            backoff_base_seconds: env_u64(
                "GATEWAY_BACKOFF_BASE_SECONDS",
                defaults.backoff_base_seconds,
            ),
            backoff_cap_seconds: env_u64(
                "GATEWAY_BACKOFF_CAP_SECONDS",
                defaults.backoff_cap_seconds,
            ),
            fetch_window_days: env_u64("GATEWAY_FETCH_WINDOW_DAYS", defaults.fetch_window_days as u64)
                as i64,
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick: Duration::from_secs(self.tick_seconds),
            backoff_base: Duration::from_secs(self.backoff_base_seconds),
            backoff_cap: Duration::from_secs(self.backoff_cap_seconds),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
