//! Alert dispatch with storage-enforced dedupe.
//!
//! Sending is a two-step pattern: insert the (incident, alert type) marker,
//! then call the side effect only if the insert created it. The marker table's
//! unique constraint makes concurrent or repeated evaluations of the same
//! transition send at most once. The network send runs outside any
//! transaction.

pub mod message;
pub mod notifier;

pub use message::AlertMessage;
pub use notifier::{LogNotifier, Notifier, WebhookNotifier};

use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::database::Store;
use crate::database::models::{AlertType, Endpoint, Incident};

/// Run `send_fn` only if no alert of this type was recorded for the incident.
///
/// Returns `Ok(false)` without calling `send_fn` when the marker already
/// exists. Store failures other than the duplicate propagate.
pub async fn send_alert_once<F, Fut>(
    store: &dyn Store,
    incident_id: Uuid,
    alert_type: AlertType,
    send_fn: F,
) -> Result<bool>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    if !store.create_alert_record_if_absent(incident_id, alert_type).await? {
        debug!(incident = %incident_id, %alert_type, "Alert already sent, skipping");
        return Ok(false);
    }

    send_fn().await?;
    Ok(true)
}

/// Notifies an endpoint owner's channels about incident transitions
pub struct AlertDispatcher {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    dashboard_url: Option<String>,
}

impl AlertDispatcher {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier, dashboard_url: None }
    }

    pub fn with_dashboard_url(mut self, dashboard_url: Option<String>) -> Self {
        self.dashboard_url = dashboard_url;
        self
    }

    /// Send one alert per active email channel, at most once per incident and type.
    /// Returns whether this call was the one that sent it.
    pub async fn dispatch(
        &self,
        endpoint: &Endpoint,
        incident: &Incident,
        alert_type: AlertType,
    ) -> Result<bool> {
        send_alert_once(self.store.as_ref(), incident.id, alert_type, || {
            self.notify_channels(endpoint, incident, alert_type)
        })
        .await
    }

    async fn notify_channels(
        &self,
        endpoint: &Endpoint,
        incident: &Incident,
        alert_type: AlertType,
    ) -> Result<()> {
        let channels = self.store.list_active_email_channels_for_owner(&endpoint.id).await?;
        if channels.is_empty() {
            info!(endpoint = %endpoint.id, incident = %incident.id, %alert_type, "No active alert channels");
            return Ok(());
        }

        let message = AlertMessage::for_incident(
            alert_type,
            &endpoint.url,
            incident,
            self.dashboard_url.as_deref(),
        );

        let mut delivered = 0;
        for channel in &channels {
            // Delivery failures are reported, never retried here
            let sent = self
                .notifier
                .send(&channel.target, &message.subject, &message.text, &message.html)
                .await;
            match sent {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    endpoint = %endpoint.id,
                    incident = %incident.id,
                    channel = %channel.id,
                    "Failed to deliver {} alert: {:#}",
                    alert_type,
                    e
                ),
            }
        }

        info!(
            endpoint = %endpoint.id,
            incident = %incident.id,
            %alert_type,
            "Alert delivered to {}/{} channels",
            delivered,
            channels.len()
        );
        Ok(())
    }
}
