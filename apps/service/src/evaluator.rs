//! Endpoint status evaluation and the incident state machine.
//!
//! The aggregate status is a vote over the newest tick of every region:
//! Up wins ties. A region that stops reporting keeps voting with its last
//! tick until `max_tick_age` is configured; without it the staleness window
//! is unbounded.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::alerting::AlertDispatcher;
use crate::database::Store;
use crate::database::models::{
    AlertType, EndpointStatus, Incident, IncidentStatus, RegionTick, TickStatus,
};

/// Majority vote over the latest tick per region. `None` without ticks.
pub fn aggregate_status(ticks: &[RegionTick]) -> Option<EndpointStatus> {
    if ticks.is_empty() {
        return None;
    }

    let up = ticks.iter().filter(|t| t.status == TickStatus::Up).count();
    let down = ticks.len() - up;

    Some(if up >= down { EndpointStatus::Up } else { EndpointStatus::Down })
}

/// What a single evaluation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// No (fresh) ticks to vote with
    NoTicks,
    /// The endpoint was deleted
    EndpointMissing,
    /// The vote matches the stored status; nothing was written
    Unchanged(EndpointStatus),
    Transitioned {
        from: EndpointStatus,
        to: EndpointStatus,
        opened: Option<Incident>,
        closed: Vec<Incident>,
    },
}

pub struct StatusEvaluator {
    store: Arc<dyn Store>,
    dispatcher: Arc<AlertDispatcher>,
    max_tick_age: Option<Duration>,
}

impl StatusEvaluator {
    pub fn new(store: Arc<dyn Store>, dispatcher: Arc<AlertDispatcher>) -> Self {
        Self { store, dispatcher, max_tick_age: None }
    }

    /// Ignore ticks older than `max_tick_age` when voting
    pub fn with_max_tick_age(mut self, max_tick_age: Option<Duration>) -> Self {
        self.max_tick_age = max_tick_age;
        self
    }

    /// Vote, then apply any status transition.
    ///
    /// Incident writes and alerts happen before the status write, and each of
    /// them is safe to repeat. An error part way through leaves the old status
    /// stored, so evaluating again finishes the transition without opening a
    /// second incident or sending an alert twice.
    pub async fn evaluate(&self, endpoint_id: &str) -> Result<Evaluation> {
        let now = Utc::now();
        let since = self
            .max_tick_age
            .and_then(|age| chrono::Duration::from_std(age).ok())
            .map(|age| now - age);

        let ticks = self.store.latest_tick_per_region(endpoint_id, since).await?;
        let Some(candidate) = aggregate_status(&ticks) else {
            return Ok(Evaluation::NoTicks);
        };

        let Some(endpoint) = self.store.get_endpoint(endpoint_id).await? else {
            return Ok(Evaluation::EndpointMissing);
        };

        if endpoint.status == candidate {
            return Ok(Evaluation::Unchanged(candidate));
        }

        let from = endpoint.status;
        let mut endpoint = endpoint;
        endpoint.status = candidate;

        let mut opened = None;
        let mut closed = Vec::new();

        match candidate {
            EndpointStatus::Down => {
                // An incident left open by an interrupted evaluation is reused
                let existing = self.store.open_incidents(endpoint_id).await?.into_iter().next();
                let incident = match existing {
                    Some(existing) => Some(existing),
                    None => match self.store.create_incident(endpoint_id, now).await? {
                        Some(incident) => {
                            info!(endpoint = endpoint_id, incident = %incident.id, "Incident opened");
                            Some(incident)
                        }
                        // Another evaluator won the race; it owns the alert
                        None => {
                            warn!(endpoint = endpoint_id, "Incident already opened concurrently");
                            None
                        }
                    },
                };

                if let Some(incident) = &incident {
                    self.dispatcher.dispatch(&endpoint, incident, AlertType::IncidentStarted).await?;
                }
                opened = incident;
            }
            EndpointStatus::Up => {
                for incident in self.store.open_incidents(endpoint_id).await? {
                    let resolved = Incident {
                        status: IncidentStatus::Closed,
                        ended_at: Some(now),
                        ..incident
                    };
                    // Announced first; a failed close retries with the marker in place
                    self.dispatcher
                        .dispatch(&endpoint, &resolved, AlertType::IncidentResolved)
                        .await?;

                    if self.store.close_incident(resolved.id, now).await? {
                        info!(endpoint = endpoint_id, incident = %resolved.id, "Incident closed");
                        closed.push(resolved);
                    }
                }
            }
            EndpointStatus::Unknown => {}
        }

        // Written last: until it lands, a retry repeats the whole transition
        self.store.update_endpoint_status(endpoint_id, candidate, now).await?;
        info!(
            endpoint = endpoint_id,
            regions = ticks.len(),
            "Status changed {} -> {}",
            from,
            candidate
        );

        Ok(Evaluation::Transitioned { from, to: candidate, opened, closed })
    }
}
