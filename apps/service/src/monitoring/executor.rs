use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::checker::{Checker, HttpChecker};
use super::types::ProbeOutcome;

/// Monitoring executor - runs a probe and classifies it
pub struct MonitoringExecutor {
    checker: Arc<dyn Checker>,
}

impl MonitoringExecutor {
    /// Executor backed by a real HTTP client
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self::with_checker(Arc::new(HttpChecker::new(timeout)?)))
    }

    pub fn with_checker(checker: Arc<dyn Checker>) -> Self {
        Self { checker }
    }

    /// Probe a target. Never fails: an unreachable target is a Down outcome.
    pub async fn execute_check(&self, target: &str) -> ProbeOutcome {
        let start = Instant::now();
        let result = self.checker.check(target).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(status_code) => ProbeOutcome::up(latency_ms, status_code),
            Err(e) => {
                tracing::debug!(target_url = target, error = %e, "Probe failed");
                ProbeOutcome::down(latency_ms, e.to_string())
            }
        }
    }
}
