//! Cached provider health checks.
//!
//! Health records are a cache with a fixed freshness window (default 5
//! minutes). A stale record is never trusted: expiry triggers a synchronous
//! re-probe under its own short timeout before the answer is returned.
//! A probe that times out or errors counts as unhealthy.
//!
//! Health is advisory — it lets the router skip a candidate without paying
//! for a failed call. The circuit breaker stays the authoritative gate.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::provider::Provider;

/// Health monitor tuning.
#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    /// How long a cached record stays trusted.
    pub freshness: Duration,
    /// Probe deadline. Must stay well below invoke timeouts so a slow
    /// probe cannot eat the caller's time budget.
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            freshness: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct HealthRecord {
    healthy: bool,
    checked_at: Instant,
}

/// Per-provider cached health state.
pub struct HealthMonitor {
    config: HealthConfig,
    records: Mutex<HashMap<String, HealthRecord>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `provider` looks reachable, probing if the cache is stale.
    ///
    /// Two callers racing on the same stale record may both probe; the
    /// second write wins and both observe a fresh answer.
    pub async fn is_healthy(&self, provider: &dyn Provider) -> bool {
        let name = provider.spec().name.clone();

        if let Some(record) = self.cached(&name) {
            if record.checked_at.elapsed() < self.config.freshness {
                return record.healthy;
            }
        }

        let healthy = match tokio::time::timeout(self.config.probe_timeout, provider.health_check())
            .await
        {
            Ok(healthy) => healthy,
            Err(_) => {
                debug!(provider = %name, "health probe timed out; treating as unhealthy");
                false
            }
        };

        self.store(&name, healthy);
        debug!(provider = %name, healthy, "health record refreshed");
        healthy
    }

    /// Drop the cached record for `provider`, forcing the next query to probe.
    pub fn invalidate(&self, provider: &str) {
        if let Ok(mut records) = self.records.lock() {
            records.remove(provider);
        }
    }

    fn cached(&self, name: &str) -> Option<HealthRecord> {
        self.records.lock().ok().and_then(|r| r.get(name).copied())
    }

    fn store(&self, name: &str, healthy: bool) {
        if let Ok(mut records) = self.records.lock() {
            records.insert(
                name.to_string(),
                HealthRecord {
                    healthy,
                    checked_at: Instant::now(),
                },
            );
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cached = self.records.lock().map(|r| r.len()).unwrap_or(0);
        f.debug_struct("HealthMonitor")
            .field("freshness", &self.config.freshness)
            .field("probe_timeout", &self.config.probe_timeout)
            .field("cached_records", &cached)
            .finish()
    }
}
