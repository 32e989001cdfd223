//! Shared fixtures for unit tests.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::{TempDir, tempdir};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::alerting::Notifier;
use crate::database::models::{
    AlertChannel, AlertType, Endpoint, EndpointStatus, EndpointTarget, Incident, NewTick, Region,
    RegionTick, Tick,
};
use crate::database::{LibsqlStore, Store, initialize_database};
use crate::monitoring::Checker;
use crate::pool::{LibsqlPool, open_pool};

/// Pool over a fresh migrated database. Keep the TempDir alive.
pub async fn create_test_pool() -> Result<(LibsqlPool, TempDir)> {
    let temp_dir = tempdir()?;
    let pool = open_pool(temp_dir.path().join("test.db")).await?;

    let conn = pool.get().await.map_err(|e| anyhow!("{}", e))?;
    initialize_database(&conn).await?;

    Ok((pool, temp_dir))
}

pub async fn create_test_store() -> Result<(Arc<LibsqlStore>, TempDir)> {
    let (pool, temp_dir) = create_test_pool().await?;
    Ok((Arc::new(LibsqlStore::new_from_pool(pool)), temp_dir))
}

/// Store that can fail a named operation once or pretend endpoints are gone
pub struct FaultyStore {
    inner: Arc<LibsqlStore>,
    fail_once: Mutex<HashSet<&'static str>>,
    hide_endpoints: AtomicBool,
}

impl FaultyStore {
    pub fn new(inner: Arc<LibsqlStore>) -> Self {
        Self { inner, fail_once: Mutex::default(), hide_endpoints: AtomicBool::new(false) }
    }

    /// The next call of `operation` fails with a lock error
    pub fn fail_once(&self, operation: &'static str) {
        self.fail_once.lock().unwrap().insert(operation);
    }

    pub fn hide_endpoints(&self) {
        self.hide_endpoints.store(true, Ordering::SeqCst);
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        if self.fail_once.lock().unwrap().remove(operation) {
            return Err(anyhow!("database is locked"));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn list_endpoints(&self) -> Result<Vec<EndpointTarget>> {
        self.check("list_endpoints")?;
        self.inner.list_endpoints().await
    }

    async fn get_endpoint(&self, id: &str) -> Result<Option<Endpoint>> {
        self.check("get_endpoint")?;
        if self.hide_endpoints.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.get_endpoint(id).await
    }

    async fn update_endpoint_status(
        &self,
        id: &str,
        status: EndpointStatus,
        checked_at: DateTime<Utc>,
    ) -> Result<()> {
        self.check("update_endpoint_status")?;
        self.inner.update_endpoint_status(id, status, checked_at).await
    }

    async fn ensure_region(&self, name: &str) -> Result<Region> {
        self.check("ensure_region")?;
        self.inner.ensure_region(name).await
    }

    async fn create_tick(&self, tick: &NewTick) -> Result<Tick> {
        self.check("create_tick")?;
        self.inner.create_tick(tick).await
    }

    async fn latest_tick_per_region(
        &self,
        endpoint_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RegionTick>> {
        self.check("latest_tick_per_region")?;
        self.inner.latest_tick_per_region(endpoint_id, since).await
    }

    async fn open_incidents(&self, endpoint_id: &str) -> Result<Vec<Incident>> {
        self.check("open_incidents")?;
        self.inner.open_incidents(endpoint_id).await
    }

    async fn get_incident(&self, id: Uuid) -> Result<Option<Incident>> {
        self.check("get_incident")?;
        self.inner.get_incident(id).await
    }

    async fn create_incident(
        &self,
        endpoint_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<Option<Incident>> {
        self.check("create_incident")?;
        self.inner.create_incident(endpoint_id, started_at).await
    }

    async fn close_incident(&self, id: Uuid, ended_at: DateTime<Utc>) -> Result<bool> {
        self.check("close_incident")?;
        self.inner.close_incident(id, ended_at).await
    }

    async fn create_alert_record_if_absent(
        &self,
        incident_id: Uuid,
        alert_type: AlertType,
    ) -> Result<bool> {
        self.check("create_alert_record_if_absent")?;
        self.inner.create_alert_record_if_absent(incident_id, alert_type).await
    }

    async fn list_active_email_channels_for_owner(
        &self,
        endpoint_id: &str,
    ) -> Result<Vec<AlertChannel>> {
        self.check("list_active_email_channels_for_owner")?;
        self.inner.list_active_email_channels_for_owner(endpoint_id).await
    }
}

/// Checker answering from a table; unknown targets answer 200
#[derive(Default)]
pub struct StubChecker {
    responses: Mutex<HashMap<String, Result<u16, String>>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl StubChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn respond(&self, target: &str, response: Result<u16, String>) {
        self.responses.lock().unwrap().insert(target.to_string(), response);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Checker for StubChecker {
    async fn check(&self, target: &str) -> Result<u16> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let response = self.responses.lock().unwrap().get(target).cloned().unwrap_or(Ok(200));
        response.map_err(|e| anyhow!(e))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub target: String,
    pub subject: String,
    pub text: String,
    pub html: String,
}

/// Notifier keeping every delivered message in memory
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentMessage>>,
    failing_target: Option<String>,
}

impl RecordingNotifier {
    /// Deliveries to `target` fail, everything else is recorded
    pub fn failing_for(target: &str) -> Self {
        Self { sent: Mutex::default(), failing_target: Some(target.to_string()) }
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, target: &str, subject: &str, text: &str, html: &str) -> Result<()> {
        if self.failing_target.as_deref() == Some(target) {
            return Err(anyhow!("mailbox {} unavailable", target));
        }
        self.sent.lock().unwrap().push(SentMessage {
            target: target.to_string(),
            subject: subject.to_string(),
            text: text.to_string(),
            html: html.to_string(),
        });
        Ok(())
    }
}

/// Answer one HTTP request with `response`; the handle yields the raw request
pub async fn serve_http_once(response: &'static str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return String::new();
        };

        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let read = match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(read) => read,
            };
            request.extend_from_slice(&buf[..read]);
            if request_complete(&request) {
                break;
            }
        }

        let _ = socket.write_all(response.as_bytes()).await;
        let _ = socket.shutdown().await;
        String::from_utf8_lossy(&request).into_owned()
    });

    (format!("http://{}/", addr), handle)
}

fn request_complete(request: &[u8]) -> bool {
    let text = String::from_utf8_lossy(request);
    let Some((head, body)) = text.split_once("\r\n\r\n") else {
        return false;
    };
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length").then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);
    body.len() >= content_length
}
