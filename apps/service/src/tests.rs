//! End-to-end flows across producer, queue, workers and evaluator.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::alerting::AlertDispatcher;
use crate::database::models::{Endpoint, EndpointStatus, IncidentStatus};
use crate::database::{LibsqlStore, Store};
use crate::evaluator::StatusEvaluator;
use crate::monitoring::MonitoringExecutor;
use crate::producer::JobProducer;
use crate::queue::{JobQueue, LibsqlQueue};
use crate::testing::{RecordingNotifier, StubChecker, create_test_pool};
use crate::worker::{CheckWorker, WorkerSettings};

const STREAM: &str = "uptime:jobs";
const GROUP: &str = "uptime-group";

/// One shared database with a checker per region
struct Deployment {
    store: Arc<LibsqlStore>,
    queue: Arc<LibsqlQueue>,
    notifier: Arc<RecordingNotifier>,
    producer: JobProducer,
    _dir: TempDir,
}

impl Deployment {
    async fn new() -> Result<Self> {
        let (pool, dir) = create_test_pool().await?;
        let store = Arc::new(LibsqlStore::new_from_pool(pool.clone()));
        let queue = Arc::new(
            LibsqlQueue::new_from_pool(pool).with_poll_interval(Duration::from_millis(10)),
        );
        let producer = JobProducer::new(store.clone(), queue.clone(), STREAM);
        Ok(Self {
            store,
            queue,
            notifier: Arc::new(RecordingNotifier::default()),
            producer,
            _dir: dir,
        })
    }

    async fn worker(&self, region: &str, checker: Arc<StubChecker>) -> Result<CheckWorker> {
        self.worker_named(&format!("worker-{region}"), region, checker).await
    }

    async fn worker_named(
        &self,
        worker_id: &str,
        region: &str,
        checker: Arc<StubChecker>,
    ) -> Result<CheckWorker> {
        let dispatcher = Arc::new(
            AlertDispatcher::new(self.store.clone(), self.notifier.clone())
                .with_dashboard_url(Some("https://dash.example".into())),
        );
        let evaluator = Arc::new(StatusEvaluator::new(self.store.clone(), dispatcher));
        let settings = WorkerSettings {
            stream: STREAM.into(),
            group: GROUP.into(),
            worker_id: worker_id.into(),
            batch_size: 10,
            block: Duration::from_millis(20),
            backoff: Duration::from_millis(20),
            redeliver_after: None,
        };
        CheckWorker::start(
            self.store.clone(),
            self.queue.clone(),
            Arc::new(MonitoringExecutor::with_checker(checker)),
            evaluator,
            settings,
            region,
        )
        .await
    }

    async fn status(&self, endpoint: &Endpoint) -> Result<EndpointStatus> {
        let stored = self.store.get_endpoint(&endpoint.id).await?;
        Ok(stored.map(|e| e.status).unwrap_or(EndpointStatus::Unknown))
    }
}

#[tokio::test]
async fn test_outage_and_recovery_across_regions() -> Result<()> {
    let d = Deployment::new().await?;
    let endpoint = Endpoint::new("alice", "https://shop.example");
    d.store.insert_endpoint(&endpoint).await?;
    d.store.insert_alert_channel("alice", "email", "alice@example.com", true).await?;

    let eu_checker = Arc::new(StubChecker::new());
    let us_checker = Arc::new(StubChecker::new());
    let eu = d.worker("eu-central", eu_checker.clone()).await?;
    let us = d.worker("us-east", us_checker.clone()).await?;

    // Both regions see the site up
    d.producer.produce_jobs().await?;
    eu.process_batch().await?;
    d.producer.produce_jobs().await?;
    us.process_batch().await?;
    assert_eq!(d.status(&endpoint).await?, EndpointStatus::Up);
    assert!(d.notifier.sent().is_empty());

    // One region down is a tie, which stays Up
    eu_checker.respond("https://shop.example", Err("connection reset".into()));
    d.producer.produce_jobs().await?;
    eu.process_batch().await?;
    assert_eq!(d.status(&endpoint).await?, EndpointStatus::Up);
    assert!(d.store.open_incidents(&endpoint.id).await?.is_empty());

    // Both down opens an incident and alerts once
    us_checker.respond("https://shop.example", Err("connection reset".into()));
    d.producer.produce_jobs().await?;
    us.process_batch().await?;
    assert_eq!(d.status(&endpoint).await?, EndpointStatus::Down);
    let open = d.store.open_incidents(&endpoint.id).await?;
    assert_eq!(open.len(), 1);

    // Still down, no second incident or alert
    d.producer.produce_jobs().await?;
    eu.process_batch().await?;
    assert_eq!(d.store.incidents_for(&endpoint.id).await?.len(), 1);
    assert_eq!(d.notifier.sent().len(), 1);
    assert_eq!(d.notifier.sent()[0].subject, "Incident started: https://shop.example");

    // Recovery in both regions closes the incident
    eu_checker.respond("https://shop.example", Ok(200));
    us_checker.respond("https://shop.example", Ok(200));
    d.producer.produce_jobs().await?;
    eu.process_batch().await?;
    assert_eq!(d.status(&endpoint).await?, EndpointStatus::Up);

    let incidents = d.store.incidents_for(&endpoint.id).await?;
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].status, IncidentStatus::Closed);
    assert!(incidents[0].ended_at.is_some());

    let sent = d.notifier.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].subject, "Incident resolved: https://shop.example");
    assert!(sent[1].html.contains("https://dash.example"));
    assert_eq!(d.store.count_alerts(open[0].id).await?, 2);
    Ok(())
}

#[tokio::test]
async fn test_endpoint_deleted_between_produce_and_check() -> Result<()> {
    let d = Deployment::new().await?;
    let endpoint = Endpoint::new("alice", "https://x");
    d.store.insert_endpoint(&endpoint).await?;

    let checker = Arc::new(StubChecker::new());
    let worker = d.worker("eu-central", checker.clone()).await?;

    assert_eq!(d.producer.produce_jobs().await?.queued, 1);
    d.store.delete_endpoint(&endpoint.id).await?;

    let report = worker.process_batch().await?;
    assert_eq!(report.acknowledged, 1);
    assert_eq!(report.checked, 0);
    assert_eq!(checker.calls(), 0);
    assert_eq!(d.store.count_ticks(&endpoint.id).await?, 0);
    assert!(d.notifier.sent().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_each_job_goes_to_one_worker() -> Result<()> {
    let d = Deployment::new().await?;
    for i in 0..6 {
        d.store.insert_endpoint(&Endpoint::new("alice", format!("https://site-{i}.example"))).await?;
    }

    let first_checker = Arc::new(StubChecker::new());
    let second_checker = Arc::new(StubChecker::new());
    // Same region, same group: competing consumers
    let first = d.worker_named("first", "eu-central", first_checker.clone()).await?;
    let second = d.worker_named("second", "eu-central", second_checker.clone()).await?;

    d.producer.produce_jobs().await?;
    let (a, b) = tokio::join!(first.process_batch(), second.process_batch());
    let (a, b) = (a?, b?);

    assert_eq!(a.checked + b.checked, 6);
    assert_eq!(first_checker.calls() + second_checker.calls(), 6);

    // Queue is drained
    assert_eq!(first.process_batch().await?.claimed, 0);
    Ok(())
}

#[tokio::test]
async fn test_trimming_keeps_unacknowledged_jobs() -> Result<()> {
    let d = Deployment::new().await?;
    let endpoint = Endpoint::new("alice", "https://example.com");
    d.store.insert_endpoint(&endpoint).await?;
    let worker = d.worker("eu-central", Arc::new(StubChecker::new())).await?;

    d.producer.produce_jobs().await?;
    worker.process_batch().await?;
    d.producer.produce_jobs().await?;

    assert_eq!(d.queue.trim_acknowledged(STREAM).await?, 1);
    assert_eq!(worker.process_batch().await?.checked, 1);
    Ok(())
}
