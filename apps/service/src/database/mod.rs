/// Database abstraction layer
///
/// Schema, row models and the `Store` trait through which the engine reads
/// endpoints and writes ticks, incidents and alert markers.
pub mod migrations;
pub mod models;
pub mod repository;

pub use repository::{LibsqlStore, Store};

use anyhow::Result;

/// Initialize database with schema
pub async fn initialize_database(conn: &libsql::Connection) -> Result<()> {
    migrations::run_migrations(conn).await
}
