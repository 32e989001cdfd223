use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Row, params};
use uuid::Uuid;

use super::models::{
    AlertChannel, AlertType, Endpoint, EndpointStatus, EndpointTarget, Incident, IncidentStatus,
    NewTick, Region, RegionTick, Tick, TickStatus, from_millis, to_millis,
};
use crate::pool::{LibsqlManager, LibsqlPool};

/// Data store shared by the producer, every worker and the evaluator.
///
/// The only concurrency guarantees relied upon are the uniqueness constraints
/// (one alert per incident and type, one open incident per endpoint) and
/// read-your-writes for a single status update.
#[async_trait]
pub trait Store: Send + Sync {
    /// Every monitored endpoint, unfiltered
    async fn list_endpoints(&self) -> Result<Vec<EndpointTarget>>;

    async fn get_endpoint(&self, id: &str) -> Result<Option<Endpoint>>;

    async fn update_endpoint_status(
        &self,
        id: &str,
        status: EndpointStatus,
        checked_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Look a region up by name, creating it on first use
    async fn ensure_region(&self, name: &str) -> Result<Region>;

    async fn create_tick(&self, tick: &NewTick) -> Result<Tick>;

    /// Newest tick of every region that reported for the endpoint,
    /// ignoring ticks older than `since` when given
    async fn latest_tick_per_region(
        &self,
        endpoint_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RegionTick>>;

    /// Open incidents of an endpoint, oldest first
    async fn open_incidents(&self, endpoint_id: &str) -> Result<Vec<Incident>>;

    async fn get_incident(&self, id: Uuid) -> Result<Option<Incident>>;

    /// Open a new incident. `None` when the endpoint already has an open one.
    async fn create_incident(
        &self,
        endpoint_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<Option<Incident>>;

    /// Close an open incident. Returns false if it was not open.
    async fn close_incident(&self, id: Uuid, ended_at: DateTime<Utc>) -> Result<bool>;

    /// Insert the dedupe marker; false when it already existed
    async fn create_alert_record_if_absent(
        &self,
        incident_id: Uuid,
        alert_type: AlertType,
    ) -> Result<bool>;

    /// Active email channels of whoever owns the endpoint
    async fn list_active_email_channels_for_owner(
        &self,
        endpoint_id: &str,
    ) -> Result<Vec<AlertChannel>>;
}

/// LibSQL store implementation
pub struct LibsqlStore {
    pool: LibsqlPool,
}

impl LibsqlStore {
    /// Create a new store from a pool
    pub fn new_from_pool(pool: LibsqlPool) -> Self {
        Self { pool }
    }

    /// Get a connection from the pool
    async fn get_conn(&self) -> Result<deadpool::managed::Object<LibsqlManager>> {
        self.pool.get().await.map_err(|e| anyhow!("failed to get database connection: {}", e))
    }

    /// Insert an endpoint (seeding and tests; management normally does this)
    pub async fn insert_endpoint(&self, endpoint: &Endpoint) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO endpoints (id, owner_id, url, check_interval_seconds, status, last_checked_at, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                endpoint.id.clone(),
                endpoint.owner_id.clone(),
                endpoint.url.clone(),
                endpoint.check_interval_seconds as i64,
                endpoint.status.as_str(),
                endpoint.last_checked_at.map(to_millis),
                to_millis(endpoint.created_at)
            ],
        )
        .await?;
        Ok(())
    }

    /// Delete an endpoint; its ticks and incidents go with it
    pub async fn delete_endpoint(&self, id: &str) -> Result<bool> {
        let conn = self.get_conn().await?;
        let deleted = conn.execute("DELETE FROM endpoints WHERE id = ?", params![id]).await?;
        Ok(deleted > 0)
    }

    /// Register a notification channel for an owner
    pub async fn insert_alert_channel(
        &self,
        owner_id: &str,
        kind: &str,
        target: &str,
        active: bool,
    ) -> Result<AlertChannel> {
        let conn = self.get_conn().await?;
        let channel = AlertChannel {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            kind: kind.to_string(),
            target: target.to_string(),
            active,
        };

        conn.execute(
            "INSERT INTO alert_channels (id, owner_id, kind, target, active, created_at) VALUES (?, ?, ?, ?, ?, ?)",
            params![
                channel.id.clone(),
                channel.owner_id.clone(),
                channel.kind.clone(),
                channel.target.clone(),
                if active { 1 } else { 0 },
                to_millis(Utc::now())
            ],
        )
        .await?;

        Ok(channel)
    }
}

fn row_to_endpoint(row: &Row) -> Result<Endpoint> {
    let status: String = row.get(4)?;
    Ok(Endpoint {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        url: row.get(2)?,
        check_interval_seconds: row.get::<i64>(3)? as u64,
        status: EndpointStatus::parse(&status),
        last_checked_at: row.get::<Option<i64>>(5)?.map(from_millis),
        created_at: from_millis(row.get(6)?),
    })
}

fn row_to_incident(row: &Row) -> Result<Incident> {
    let id: String = row.get(0)?;
    let status: String = row.get(2)?;
    Ok(Incident {
        id: Uuid::parse_str(&id)?,
        endpoint_id: row.get(1)?,
        status: IncidentStatus::parse(&status)
            .ok_or_else(|| anyhow!("unexpected incident status '{}'", status))?,
        started_at: from_millis(row.get(3)?),
        ended_at: row.get::<Option<i64>>(4)?.map(from_millis),
    })
}

fn parse_tick_status(value: &str) -> Result<TickStatus> {
    TickStatus::parse(value).ok_or_else(|| anyhow!("unexpected tick status '{}'", value))
}

#[async_trait]
impl Store for LibsqlStore {
    async fn list_endpoints(&self) -> Result<Vec<EndpointTarget>> {
        let conn = self.get_conn().await?;
        let mut rows = conn.query("SELECT id, url FROM endpoints ORDER BY created_at", ()).await?;

        let mut endpoints = Vec::new();
        while let Some(row) = rows.next().await? {
            endpoints.push(EndpointTarget { id: row.get(0)?, url: row.get(1)? });
        }
        Ok(endpoints)
    }

    async fn get_endpoint(&self, id: &str) -> Result<Option<Endpoint>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, owner_id, url, check_interval_seconds, status, last_checked_at, created_at FROM endpoints WHERE id = ?",
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_endpoint(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_endpoint_status(
        &self,
        id: &str,
        status: EndpointStatus,
        checked_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "UPDATE endpoints SET status = ?, last_checked_at = ? WHERE id = ?",
            params![status.as_str(), to_millis(checked_at), id],
        )
        .await?;
        Ok(())
    }

    async fn ensure_region(&self, name: &str) -> Result<Region> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO regions (id, name) VALUES (?, ?) ON CONFLICT(name) DO NOTHING",
            params![Uuid::new_v4().to_string(), name],
        )
        .await?;

        let mut rows = conn.query("SELECT id, name FROM regions WHERE name = ?", params![name]).await?;
        let row = rows.next().await?.ok_or_else(|| anyhow!("region '{}' vanished after insert", name))?;
        Ok(Region { id: row.get(0)?, name: row.get(1)? })
    }

    async fn create_tick(&self, tick: &NewTick) -> Result<Tick> {
        let conn = self.get_conn().await?;
        let created_at = Utc::now();

        conn.execute(
            "INSERT INTO ticks (endpoint_id, region_id, latency_ms, status, created_at) VALUES (?, ?, ?, ?, ?)",
            params![
                tick.endpoint_id.clone(),
                tick.region_id.clone(),
                tick.latency_ms as i64,
                tick.status.as_str(),
                to_millis(created_at)
            ],
        )
        .await?;

        Ok(Tick {
            id: conn.last_insert_rowid(),
            endpoint_id: tick.endpoint_id.clone(),
            region_id: tick.region_id.clone(),
            latency_ms: tick.latency_ms,
            status: tick.status,
            created_at: from_millis(to_millis(created_at)),
        })
    }

    async fn latest_tick_per_region(
        &self,
        endpoint_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RegionTick>> {
        let conn = self.get_conn().await?;
        let since = since.map(to_millis).unwrap_or(i64::MIN);

        // Ties on created_at fall back to insertion order
        let mut rows = conn
            .query(
                "SELECT region_id, status, created_at FROM (
                    SELECT region_id, status, created_at,
                        ROW_NUMBER() OVER (PARTITION BY region_id ORDER BY created_at DESC, id DESC) AS rn
                    FROM ticks
                    WHERE endpoint_id = ? AND created_at >= ?
                ) WHERE rn = 1 ORDER BY region_id",
                params![endpoint_id, since],
            )
            .await?;

        let mut ticks = Vec::new();
        while let Some(row) = rows.next().await? {
            let status: String = row.get(1)?;
            ticks.push(RegionTick {
                region_id: row.get(0)?,
                status: parse_tick_status(&status)?,
                created_at: from_millis(row.get(2)?),
            });
        }
        Ok(ticks)
    }

    async fn open_incidents(&self, endpoint_id: &str) -> Result<Vec<Incident>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, endpoint_id, status, started_at, ended_at FROM incidents WHERE endpoint_id = ? AND status = 'open' ORDER BY started_at",
                params![endpoint_id],
            )
            .await?;

        let mut incidents = Vec::new();
        while let Some(row) = rows.next().await? {
            incidents.push(row_to_incident(&row)?);
        }
        Ok(incidents)
    }

    async fn get_incident(&self, id: Uuid) -> Result<Option<Incident>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, endpoint_id, status, started_at, ended_at FROM incidents WHERE id = ?",
                params![id.to_string()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_incident(&row)?)),
            None => Ok(None),
        }
    }

    async fn create_incident(
        &self,
        endpoint_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<Option<Incident>> {
        let conn = self.get_conn().await?;
        let incident = Incident {
            id: Uuid::new_v4(),
            endpoint_id: endpoint_id.to_string(),
            status: IncidentStatus::Open,
            started_at: from_millis(to_millis(started_at)),
            ended_at: None,
        };

        // The partial unique index turns a racing second open into a no-op
        let inserted = conn
            .execute(
                "INSERT INTO incidents (id, endpoint_id, status, started_at) VALUES (?, ?, 'open', ?) ON CONFLICT DO NOTHING",
                params![incident.id.to_string(), endpoint_id, to_millis(started_at)],
            )
            .await?;

        Ok((inserted > 0).then_some(incident))
    }

    async fn close_incident(&self, id: Uuid, ended_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.get_conn().await?;
        let updated = conn
            .execute(
                "UPDATE incidents SET status = 'closed', ended_at = ? WHERE id = ? AND status = 'open'",
                params![to_millis(ended_at), id.to_string()],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn create_alert_record_if_absent(
        &self,
        incident_id: Uuid,
        alert_type: AlertType,
    ) -> Result<bool> {
        let conn = self.get_conn().await?;
        // Only the (incident_id, alert_type) conflict is absorbed; anything else errors
        let inserted = conn
            .execute(
                "INSERT INTO alerts (incident_id, alert_type, created_at) VALUES (?, ?, ?) ON CONFLICT(incident_id, alert_type) DO NOTHING",
                params![incident_id.to_string(), alert_type.as_str(), to_millis(Utc::now())],
            )
            .await?;
        Ok(inserted > 0)
    }

    async fn list_active_email_channels_for_owner(
        &self,
        endpoint_id: &str,
    ) -> Result<Vec<AlertChannel>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT c.id, c.owner_id, c.kind, c.target, c.active
                 FROM alert_channels c
                 JOIN endpoints e ON e.owner_id = c.owner_id
                 WHERE e.id = ? AND c.kind = 'email' AND c.active = 1
                 ORDER BY c.created_at",
                params![endpoint_id],
            )
            .await?;

        let mut channels = Vec::new();
        while let Some(row) = rows.next().await? {
            channels.push(AlertChannel {
                id: row.get(0)?,
                owner_id: row.get(1)?,
                kind: row.get(2)?,
                target: row.get(3)?,
                active: row.get::<i64>(4)? != 0,
            });
        }
        Ok(channels)
    }
}

#[cfg(test)]
impl LibsqlStore {
    pub async fn count_ticks(&self, endpoint_id: &str) -> Result<i64> {
        let conn = self.get_conn().await?;
        let mut rows =
            conn.query("SELECT COUNT(*) FROM ticks WHERE endpoint_id = ?", params![endpoint_id]).await?;
        let row = rows.next().await?.ok_or_else(|| anyhow!("count returned no rows"))?;
        Ok(row.get(0)?)
    }

    pub async fn incidents_for(&self, endpoint_id: &str) -> Result<Vec<Incident>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, endpoint_id, status, started_at, ended_at FROM incidents WHERE endpoint_id = ? ORDER BY started_at",
                params![endpoint_id],
            )
            .await?;
        let mut incidents = Vec::new();
        while let Some(row) = rows.next().await? {
            incidents.push(row_to_incident(&row)?);
        }
        Ok(incidents)
    }

    pub async fn count_alerts(&self, incident_id: Uuid) -> Result<i64> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query("SELECT COUNT(*) FROM alerts WHERE incident_id = ?", params![incident_id.to_string()])
            .await?;
        let row = rows.next().await?.ok_or_else(|| anyhow!("count returned no rows"))?;
        Ok(row.get(0)?)
    }

    /// Write a tick with an explicit timestamp
    pub async fn insert_tick_at(
        &self,
        endpoint_id: &str,
        region_id: &str,
        status: TickStatus,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO ticks (endpoint_id, region_id, latency_ms, status, created_at) VALUES (?, ?, 0, ?, ?)",
            params![endpoint_id, region_id, status.as_str(), to_millis(created_at)],
        )
        .await?;
        Ok(())
    }
}
