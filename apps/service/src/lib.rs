//! Distributed uptime monitoring: a producer schedules check jobs, regional
//! workers probe endpoints and record ticks, and the evaluator turns ticks
//! into endpoint status, incidents and deduplicated alerts.

pub mod alerting;
pub mod config;
pub mod database;
pub mod evaluator;
pub mod monitoring;
pub mod pool;
pub mod producer;
pub mod queue;
pub mod shutdown;
pub mod worker;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;
