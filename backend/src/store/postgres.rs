use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool, Row};
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, info, instrument, warn};

use super::{PersistedReading, ReadingStore};
use crate::clock::to_datetime;
use crate::error::StoreError;
use crate::registry::{Device, DeviceRegistry, DeviceStateUpdate, DeviceStatus, NewDevice, Position};

// PostgreSQL SQLSTATE for unique_violation
const UNIQUE_VIOLATION: &str = "23505";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS devices (
        device_id        TEXT PRIMARY KEY,
        secret           TEXT,
        firmware_version TEXT,
        status           TEXT NOT NULL DEFAULT 'offline',
        last_lat         DOUBLE PRECISION,
        last_lng         DOUBLE PRECISION,
        last_speed_kph   DOUBLE PRECISION,
        last_fuel_pct    DOUBLE PRECISION,
        last_seen_at     TIMESTAMPTZ,
        created_at       TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS telemetry_readings (
        device_id        TEXT NOT NULL,
        seq              BIGINT NOT NULL,
        sent_at          TIMESTAMPTZ NOT NULL,
        received_at      TIMESTAMPTZ NOT NULL,
        firmware_version TEXT,
        lat              DOUBLE PRECISION,
        lng              DOUBLE PRECISION,
        speed_kph        DOUBLE PRECISION,
        heading_deg      DOUBLE PRECISION,
        status           TEXT,
        fuel_pct         DOUBLE PRECISION,
        def_pct          DOUBLE PRECISION,
        rpm              DOUBLE PRECISION,
        load_pct         DOUBLE PRECISION,
        payload          JSONB NOT NULL,
        PRIMARY KEY (device_id, seq)
    )",
];

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e.as_database_error().and_then(|d| d.code()) {
            Some(code) if code == UNIQUE_VIOLATION => StoreError::Duplicate,
            _ => StoreError::Unavailable(e.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lazy pool: no connection is made until the first query, so the server
    /// starts (and serves the fallback path) while the database is down.
    pub fn connect_lazy(url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .acquire_timeout(Duration::from_secs(3))
            .connect_lazy(url)?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        info!("schema_ready");
        Ok(())
    }
}

/// Creates the schema, retrying every `every` until the database accepts it.
/// Until then lookups fail as unavailable and requests take the fallback path.
pub async fn ensure_schema(store: Arc<PgStore>, every: Duration) {
    let attempts = retry_until_ok(every, || store.migrate()).await;
    info!(attempts, "schema_migration_done");
}

async fn retry_until_ok<F, Fut, E>(every: Duration, mut op: F) -> u32
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match op().await {
            Ok(()) => return attempts,
            Err(e) => {
                warn!(attempts, error = %e, retry_in_ms = every.as_millis() as u64, "schema_migration_failed");
                tokio::time::sleep(every).await;
            }
        }
    }
}

#[async_trait]
impl DeviceRegistry for PgStore {
    #[instrument(skip(self))]
    async fn find_by_device_id(&self, device_id: &str) -> Result<Option<Device>, StoreError> {
        let row = sqlx::query(
            "SELECT device_id, secret, firmware_version, status, last_lat, last_lng,
                    last_speed_kph, last_fuel_pct, last_seen_at
             FROM devices WHERE device_id = $1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let status: String = row.try_get("status")?;
        let lat: Option<f64> = row.try_get("last_lat")?;
        let lng: Option<f64> = row.try_get("last_lng")?;
        Ok(Some(Device {
            device_id: row.try_get("device_id")?,
            secret: row.try_get("secret")?,
            firmware_version: row.try_get("firmware_version")?,
            status: status.parse().unwrap_or(DeviceStatus::Offline),
            last_known_position: lat.zip(lng).map(|(lat, lng)| Position { lat, lng }),
            last_speed_kph: row.try_get("last_speed_kph")?,
            last_fuel_pct: row.try_get("last_fuel_pct")?,
            last_seen_at: row.try_get("last_seen_at")?,
        }))
    }

    #[instrument(skip(self, d), fields(device_id = %d.device_id))]
    async fn insert_device(&self, d: NewDevice) -> Result<Device, StoreError> {
        sqlx::query("INSERT INTO devices (device_id, secret, firmware_version, status) VALUES ($1, $2, $3, 'offline')")
            .bind(&d.device_id)
            .bind(&d.secret)
            .bind(&d.firmware_version)
            .execute(&self.pool)
            .await?;
        debug!("registered device");
        Ok(Device {
            device_id: d.device_id,
            secret: Some(d.secret),
            firmware_version: d.firmware_version,
            status: DeviceStatus::Offline,
            last_known_position: None,
            last_speed_kph: None,
            last_fuel_pct: None,
            last_seen_at: None,
        })
    }

    #[instrument(skip(self, u))]
    async fn update_device_state(&self, device_id: &str, u: &DeviceStateUpdate) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE devices SET
                status           = $2,
                last_lat         = COALESCE($3, last_lat),
                last_lng         = COALESCE($4, last_lng),
                last_speed_kph   = COALESCE($5, last_speed_kph),
                last_fuel_pct    = COALESCE($6, last_fuel_pct),
                firmware_version = COALESCE($7, firmware_version),
                last_seen_at     = $8
             WHERE device_id = $1",
        )
        .bind(device_id)
        .bind(u.status.as_str())
        .bind(u.position.map(|p| p.lat))
        .bind(u.position.map(|p| p.lng))
        .bind(u.speed_kph)
        .bind(u.fuel_pct)
        .bind(&u.firmware_version)
        .bind(u.last_seen_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ReadingStore for PgStore {
    #[instrument(skip(self, r), fields(device_id = %r.device_id, seq = r.seq))]
    async fn insert_reading(&self, r: &PersistedReading) -> Result<(), StoreError> {
        let f = &r.fields;
        let sent_at = to_datetime(r.sent_at_ms)
            .ok_or_else(|| StoreError::Invalid(format!("sent_at {} out of range", r.sent_at_ms)))?;
        sqlx::query(
            "INSERT INTO telemetry_readings
                (device_id, seq, sent_at, received_at, firmware_version, lat, lng, speed_kph,
                 heading_deg, status, fuel_pct, def_pct, rpm, load_pct, payload)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(&r.device_id)
        .bind(r.seq)
        .bind(sent_at)
        .bind(r.received_at)
        .bind(&r.firmware_version)
        .bind(f.lat)
        .bind(f.lng)
        .bind(f.speed_kph)
        .bind(f.heading_deg)
        .bind(&f.status)
        .bind(f.fuel_pct)
        .bind(f.def_pct)
        .bind(f.rpm)
        .bind(f.load_pct)
        .bind(Json(&r.payload))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_schema_retry_runs_until_database_accepts() {
        let calls = AtomicU32::new(0);
        let attempts = retry_until_ok(Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { if n < 2 { Err("connection refused") } else { Ok(()) } }
        })
        .await;
        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_schema_retry_keeps_going_while_database_down() {
        let store = Arc::new(PgStore::connect_lazy("postgres://fieldlink@127.0.0.1:1/fieldlink").unwrap());
        let task = tokio::spawn(ensure_schema(store, Duration::from_millis(5)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!task.is_finished());
        task.abort();
    }
}
