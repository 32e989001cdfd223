pub mod checker;
/// Probe module - executes the network check behind every tick
///
/// This module is responsible for:
/// - Issuing the HTTP request with a bounded timeout
/// - Timing it
/// - Folding transport failures into a Down observation
pub mod executor;
pub mod types;

pub use checker::{Checker, HttpChecker};
pub use executor::MonitoringExecutor;
pub use types::ProbeOutcome;
