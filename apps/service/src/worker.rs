//! Check worker.
//!
//! Each worker process is one consumer in a shared group. A batch is claimed,
//! probed concurrently, recorded as ticks, evaluated, and only then
//! acknowledged. Anything that goes wrong before the acknowledgement leaves
//! the jobs pending, so they are redelivered; probing twice and recording a
//! second tick are both harmless.

use anyhow::Result;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::database::Store;
use crate::database::models::{NewTick, Region};
use crate::evaluator::StatusEvaluator;
use crate::monitoring::MonitoringExecutor;
use crate::queue::{JobPayload, JobQueue, QueueMessage};
use crate::shutdown::ShutdownSignal;

/// Queue placement and pacing of a worker
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub stream: String,
    pub group: String,
    pub worker_id: String,
    pub batch_size: usize,
    /// Maximum wait for jobs in one claim
    pub block: Duration,
    /// Pause after a failed batch
    pub backoff: Duration,
    /// Jobs pending longer than this with any consumer are taken over
    pub redeliver_after: Option<Duration>,
}

/// What happened to one claimed job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Checked { endpoint_id: String },
    EndpointMissing,
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchReport {
    pub claimed: usize,
    pub checked: usize,
    pub skipped: usize,
    pub evaluated: usize,
    pub acknowledged: usize,
}

pub struct CheckWorker {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    executor: Arc<MonitoringExecutor>,
    evaluator: Arc<StatusEvaluator>,
    settings: WorkerSettings,
    region: Region,
}

impl CheckWorker {
    /// Resolve this worker's region (creating it on first run) and make sure
    /// the consumer group exists
    pub async fn start(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        executor: Arc<MonitoringExecutor>,
        evaluator: Arc<StatusEvaluator>,
        settings: WorkerSettings,
        region_name: &str,
    ) -> Result<Self> {
        let region = store.ensure_region(region_name).await?;

        if queue.ensure_consumer_group(&settings.stream, &settings.group).await? {
            info!(group = %settings.group, stream = %settings.stream, "Consumer group created");
        }

        Ok(Self { store, queue, executor, evaluator, settings, region })
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Claim, process and acknowledge one batch
    pub async fn process_batch(&self) -> Result<BatchReport> {
        let messages = self.claim_batch().await?;
        self.handle_batch(messages).await
    }

    /// Abandoned jobs first, then fresh ones up to the batch size
    async fn claim_batch(&self) -> Result<Vec<QueueMessage>> {
        let s = &self.settings;
        let mut messages = match s.redeliver_after {
            Some(min_idle) => {
                self.queue
                    .reclaim_idle(&s.stream, &s.group, &s.worker_id, min_idle, s.batch_size)
                    .await?
            }
            None => Vec::new(),
        };

        if !messages.is_empty() {
            info!(worker = %s.worker_id, "Took over {} abandoned jobs", messages.len());
        }

        let remaining = s.batch_size.saturating_sub(messages.len());
        if remaining > 0 {
            // Only wait for new jobs when there is nothing to do already
            let block = if messages.is_empty() { s.block } else { Duration::ZERO };
            let fresh = self.queue.claim(&s.stream, &s.group, &s.worker_id, remaining, block).await?;
            messages.extend(fresh);
        }

        Ok(messages)
    }

    async fn handle_batch(&self, messages: Vec<QueueMessage>) -> Result<BatchReport> {
        let mut report = BatchReport { claimed: messages.len(), ..BatchReport::default() };
        if messages.is_empty() {
            return Ok(report);
        }

        debug!(worker = %self.settings.worker_id, "Processing {} jobs", messages.len());

        let outcomes = join_all(messages.iter().map(|message| self.process_job(message))).await;

        let mut touched = BTreeSet::new();
        for outcome in outcomes {
            match outcome? {
                JobOutcome::Checked { endpoint_id } => {
                    report.checked += 1;
                    touched.insert(endpoint_id);
                }
                JobOutcome::EndpointMissing | JobOutcome::Malformed => report.skipped += 1,
            }
        }

        for endpoint_id in &touched {
            self.evaluator.evaluate(endpoint_id).await?;
            report.evaluated += 1;
        }

        for message in &messages {
            self.queue.ack(&self.settings.stream, &self.settings.group, message.id).await?;
            report.acknowledged += 1;
        }

        Ok(report)
    }

    /// Probe one job and record its tick
    async fn process_job(&self, message: &QueueMessage) -> Result<JobOutcome> {
        if message.deliveries > 1 {
            warn!(
                job = %message.id,
                deliveries = message.deliveries,
                "Job redelivered after an unacknowledged attempt"
            );
        }

        let payload = match JobPayload::parse(&message.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(job = %message.id, "Skipping job: {}", e);
                return Ok(JobOutcome::Malformed);
            }
        };

        if self.store.get_endpoint(&payload.endpoint_id).await?.is_none() {
            debug!(job = %message.id, endpoint = %payload.endpoint_id, "Endpoint no longer exists, skipping");
            return Ok(JobOutcome::EndpointMissing);
        }

        let outcome = self.executor.execute_check(&payload.url).await;
        self.store
            .create_tick(&NewTick {
                endpoint_id: payload.endpoint_id.clone(),
                region_id: self.region.id.clone(),
                latency_ms: outcome.latency_ms,
                status: outcome.status,
            })
            .await?;

        debug!(
            job = %message.id,
            endpoint = %payload.endpoint_id,
            latency_ms = outcome.latency_ms,
            "Recorded {} tick",
            outcome.status
        );

        Ok(JobOutcome::Checked { endpoint_id: payload.endpoint_id })
    }

    /// Run batches until shutdown. Batch failures are logged and retried
    /// after the backoff; they never end the loop.
    pub async fn run(&self, mut shutdown: ShutdownSignal) -> Result<()> {
        let s = &self.settings;
        info!(worker = %s.worker_id, region = %self.region.name, "Waiting for jobs");

        while !shutdown.is_triggered() {
            // An interrupted claim leaves its jobs pending for redelivery
            let claimed = tokio::select! {
                _ = shutdown.wait() => break,
                claimed = self.claim_batch() => claimed,
            };

            let result = match claimed {
                Ok(messages) => self.handle_batch(messages).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(report) if report.claimed > 0 => info!(
                    worker = %s.worker_id,
                    checked = report.checked,
                    skipped = report.skipped,
                    "Acknowledged {} jobs",
                    report.acknowledged
                ),
                Ok(_) => {}
                Err(e) => {
                    error!(worker = %s.worker_id, "Batch failed: {:#}", e);
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        _ = tokio::time::sleep(s.backoff) => {}
                    }
                }
            }
        }

        info!(worker = %s.worker_id, "Worker stopped");
        Ok(())
    }
}
