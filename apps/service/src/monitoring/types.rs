use crate::database::models::TickStatus;

/// Result of one probe, before it is recorded as a tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// Up if the request completed, Down on any transport error or timeout
    pub status: TickStatus,

    /// Wall-clock time spent on the probe in milliseconds
    pub latency_ms: u64,

    /// HTTP status code, when a response arrived
    pub status_code: Option<u16>,

    /// Why the probe failed
    pub error_message: Option<String>,
}

impl ProbeOutcome {
    /// Mark the probe as reachable
    pub fn up(latency_ms: u64, status_code: u16) -> Self {
        Self {
            status: TickStatus::Up,
            latency_ms,
            status_code: Some(status_code),
            error_message: None,
        }
    }

    /// Mark the probe as failed
    pub fn down(latency_ms: u64, error: String) -> Self {
        Self { status: TickStatus::Down, latency_ms, status_code: None, error_message: Some(error) }
    }
}
