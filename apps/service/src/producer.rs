//! Job producer: one check job per endpoint per scheduling tick.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::database::Store;
use crate::queue::{JobPayload, JobQueue};
use crate::shutdown::ShutdownSignal;

/// Counts of one production pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProduceReport {
    pub queued: usize,
    pub failed: usize,
}

pub struct JobProducer {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    stream: String,
}

impl JobProducer {
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn JobQueue>, stream: impl Into<String>) -> Self {
        Self { store, queue, stream: stream.into() }
    }

    /// Enqueue a job for every endpoint.
    ///
    /// Failing to list endpoints aborts the pass; a failed append is logged
    /// and the remaining endpoints are still queued. Overlapping passes
    /// produce duplicate jobs, which workers tolerate.
    pub async fn produce_jobs(&self) -> Result<ProduceReport> {
        let endpoints = self.store.list_endpoints().await.context("failed to list endpoints")?;
        let mut report = ProduceReport::default();

        for endpoint in &endpoints {
            let payload = JobPayload::new(endpoint.id.clone(), endpoint.url.clone());
            let appended = match payload.to_json() {
                Ok(json) => self.queue.append(&self.stream, &json).await,
                Err(e) => Err(e.into()),
            };

            match appended {
                Ok(id) => {
                    debug!(endpoint = %endpoint.id, job = %id, "Queued check job");
                    report.queued += 1;
                }
                Err(e) => {
                    warn!(endpoint = %endpoint.id, "Failed to queue check job: {:#}", e);
                    report.failed += 1;
                }
            }
        }

        info!("Queued {} uptime jobs ({} failed)", report.queued, report.failed);
        Ok(report)
    }

    /// Produce on a fixed interval until shutdown
    pub async fn run(&self, every: Duration, mut shutdown: ShutdownSignal) -> Result<()> {
        let mut timer = interval(every);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(stream = %self.stream, "Producing jobs every {:?}", every);

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = timer.tick() => {}
            }

            if let Err(e) = self.produce_jobs().await {
                error!("Production pass failed: {:#}", e);
                continue;
            }

            match self.queue.trim_acknowledged(&self.stream).await {
                Ok(0) => {}
                Ok(trimmed) => debug!("Trimmed {} acknowledged jobs", trimmed),
                Err(e) => warn!("Failed to trim job stream: {:#}", e),
            }
        }

        info!("Producer stopped");
        Ok(())
    }
}
