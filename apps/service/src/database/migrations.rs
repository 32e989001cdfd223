use anyhow::Result;
use libsql::Connection;

/// Schema version - increment when making schema changes
const SCHEMA_VERSION: i32 = 2;

/// Run database migrations
///
/// Producer and workers both call this on startup; every step is guarded by
/// the recorded version and uses IF NOT EXISTS, so concurrent starts converge.
pub async fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL,
            description TEXT
        )",
        (),
    )
    .await?;

    let current_version = get_current_version(conn).await?;

    if current_version >= SCHEMA_VERSION {
        tracing::debug!("Database schema is up to date (version {})", current_version);
        return Ok(());
    }

    tracing::info!("Running migrations from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        run_migration_v1(conn).await?;
        record_migration(conn, 1, "Endpoints, regions, ticks, incidents and alerts").await?;
    }

    if current_version < 2 {
        run_migration_v2(conn).await?;
        record_migration(conn, 2, "Durable job stream with consumer groups").await?;
    }

    tracing::info!("Database migrations completed successfully (now at version {})", SCHEMA_VERSION);
    Ok(())
}

/// Get current schema version from database
async fn get_current_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn.query("SELECT MAX(version) FROM schema_migrations", ()).await?;

    if let Some(row) = rows.next().await? {
        let version: Option<i32> = row.get(0)?;
        Ok(version.unwrap_or(0))
    } else {
        Ok(0)
    }
}

/// Record that a migration was applied
async fn record_migration(conn: &Connection, version: i32, description: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations (version, applied_at, description) VALUES (?, ?, ?)",
        libsql::params![version, now, description],
    )
    .await?;

    tracing::info!("Applied migration v{}: {}", version, description);
    Ok(())
}

/// Migration v1: monitoring schema
async fn run_migration_v1(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS endpoints (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            url TEXT NOT NULL,
            check_interval_seconds INTEGER NOT NULL DEFAULT 60,
            status TEXT NOT NULL DEFAULT 'unknown',
            last_checked_at INTEGER,
            created_at INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS regions (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        (),
    )
    .await?;

    // Append-only, the engine never updates or deletes ticks
    conn.execute(
        "CREATE TABLE IF NOT EXISTS ticks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            endpoint_id TEXT NOT NULL,
            region_id TEXT NOT NULL,
            latency_ms INTEGER NOT NULL,
            status TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (endpoint_id) REFERENCES endpoints(id) ON DELETE CASCADE,
            FOREIGN KEY (region_id) REFERENCES regions(id)
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS incidents (
            id TEXT PRIMARY KEY,
            endpoint_id TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            ended_at INTEGER,
            FOREIGN KEY (endpoint_id) REFERENCES endpoints(id) ON DELETE CASCADE
        )",
        (),
    )
    .await?;

    // Dedupe marker: one row per incident and lifecycle event
    conn.execute(
        "CREATE TABLE IF NOT EXISTS alerts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            incident_id TEXT NOT NULL,
            alert_type TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE (incident_id, alert_type),
            FOREIGN KEY (incident_id) REFERENCES incidents(id) ON DELETE CASCADE
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS alert_channels (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            target TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    // At most one open incident per endpoint, even with racing evaluators
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_incidents_one_open ON incidents(endpoint_id) WHERE status = 'open'",
        (),
    )
    .await?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_ticks_endpoint_region_created ON ticks(endpoint_id, region_id, created_at DESC)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_incidents_endpoint_status ON incidents(endpoint_id, status)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_alert_channels_owner ON alert_channels(owner_id, kind, active)", ()).await?;

    Ok(())
}

/// Migration v2: job stream tables
async fn run_migration_v2(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS queue_entries (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            stream TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS queue_groups (
            stream TEXT NOT NULL,
            group_name TEXT NOT NULL,
            last_delivered_seq INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (stream, group_name)
        )",
        (),
    )
    .await?;

    // Delivered but not yet acknowledged entries, per group
    conn.execute(
        "CREATE TABLE IF NOT EXISTS queue_pending (
            stream TEXT NOT NULL,
            group_name TEXT NOT NULL,
            seq INTEGER NOT NULL,
            consumer TEXT NOT NULL,
            delivered_at INTEGER NOT NULL,
            delivery_count INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (stream, group_name, seq)
        )",
        (),
    )
    .await?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_queue_entries_stream_seq ON queue_entries(stream, seq)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_queue_pending_delivered ON queue_pending(stream, group_name, delivered_at)", ()).await?;

    Ok(())
}
