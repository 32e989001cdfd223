use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Aggregate status of an endpoint across regions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    Up,
    Down,
    Unknown,
}

impl EndpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointStatus::Up => "up",
            EndpointStatus::Down => "down",
            EndpointStatus::Unknown => "unknown",
        }
    }

    /// Unrecognised values read back as `Unknown`
    pub fn parse(value: &str) -> Self {
        match value {
            "up" => EndpointStatus::Up,
            "down" => EndpointStatus::Down,
            _ => EndpointStatus::Unknown,
        }
    }
}

/// Outcome of a single probe. Never unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickStatus {
    Up,
    Down,
}

impl TickStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickStatus::Up => "up",
            TickStatus::Down => "down",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "up" => Some(TickStatus::Up),
            "down" => Some(TickStatus::Down),
            _ => None,
        }
    }
}

impl From<TickStatus> for EndpointStatus {
    fn from(status: TickStatus) -> Self {
        match status {
            TickStatus::Up => EndpointStatus::Up,
            TickStatus::Down => EndpointStatus::Down,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Open,
    Closed,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "open",
            IncidentStatus::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(IncidentStatus::Open),
            "closed" => Some(IncidentStatus::Closed),
            _ => None,
        }
    }
}

/// Incident lifecycle event an alert is sent for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertType {
    IncidentStarted,
    IncidentResolved,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::IncidentStarted => "IncidentStarted",
            AlertType::IncidentResolved => "IncidentResolved",
        }
    }
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for TickStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monitored target. Owned by the management layer; the engine only
/// writes `status` and `last_checked_at`.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: String,
    pub owner_id: String,
    pub url: String,
    pub check_interval_seconds: u64,
    pub status: EndpointStatus,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Endpoint {
    pub fn new(owner_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            url: url.into(),
            check_interval_seconds: 60,
            status: EndpointStatus::Unknown,
            last_checked_at: None,
            created_at: Utc::now(),
        }
    }
}

/// What the producer needs to build a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointTarget {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub id: String,
    pub name: String,
}

/// Tick about to be recorded
#[derive(Debug, Clone)]
pub struct NewTick {
    pub endpoint_id: String,
    pub region_id: String,
    pub latency_ms: u64,
    pub status: TickStatus,
}

/// Recorded probe result
#[derive(Debug, Clone)]
pub struct Tick {
    pub id: i64,
    pub endpoint_id: String,
    pub region_id: String,
    pub latency_ms: u64,
    pub status: TickStatus,
    pub created_at: DateTime<Utc>,
}

/// Newest tick of one region for an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionTick {
    pub region_id: String,
    pub status: TickStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incident {
    pub id: Uuid,
    pub endpoint_id: String,
    pub status: IncidentStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertChannel {
    pub id: String,
    pub owner_id: String,
    pub kind: String,
    pub target: String,
    pub active: bool,
}

/// Convert a timestamp to milliseconds since the Unix epoch
pub fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

/// Convert milliseconds since the Unix epoch back to a timestamp
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        for status in [EndpointStatus::Up, EndpointStatus::Down, EndpointStatus::Unknown] {
            assert_eq!(EndpointStatus::parse(status.as_str()), status);
        }
        assert_eq!(EndpointStatus::parse("degraded"), EndpointStatus::Unknown);
        assert_eq!(TickStatus::parse("unknown"), None);
        assert_eq!(IncidentStatus::parse("open"), Some(IncidentStatus::Open));
    }

    #[test]
    fn test_millis_conversion_keeps_precision() {
        let now = from_millis(to_millis(Utc::now()));
        assert_eq!(from_millis(to_millis(now)), now);
        assert_eq!(from_millis(1_700_000_000_123).timestamp_subsec_millis(), 123);
    }

    #[test]
    fn test_new_endpoint_starts_unknown() {
        let endpoint = Endpoint::new("owner-1", "https://example.com");
        assert_eq!(endpoint.status, EndpointStatus::Unknown);
        assert!(endpoint.last_checked_at.is_none());
        assert!(Uuid::parse_str(&endpoint.id).is_ok());
    }
}
