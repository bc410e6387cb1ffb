// =============================================================================
// FIELDLINK — Reading sinks (database path / file fallback path)
// =============================================================================
// The pipeline picks one sink per request from the resolver outcome. A sink
// performs at most one logical write: readings + one device-state update for
// the database, one append for the file.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{io::Write, path::PathBuf, sync::Arc};
use tracing::{debug, error, info, warn};

use crate::envelope::TelemetryEnvelope;
use crate::error::{Reject, StoreError};
use crate::metrics::Metrics;
use crate::registry::{DeviceRegistry, DeviceStateUpdate};
use crate::store::{PersistedReading, ReadingStore};

/// Validated, authenticated items of one request, all for `device_id`.
pub struct Accepted<'a> {
    pub device_id: &'a str,
    pub items: &'a [TelemetryEnvelope],
    pub received_at: DateTime<Utc>,
    /// Why the registry path was not taken; `None` on the database path.
    pub fallback_reason: Option<&'static str>,
    pub signature_verified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredTo {
    Database,
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stored {
    /// Newly inserted plus already-present items.
    pub ingested: usize,
    pub stored_to: StoredTo,
}

#[async_trait]
pub trait ReadingSink: Send + Sync {
    async fn store(&self, batch: &Accepted<'_>) -> Result<Stored, Reject>;
}

pub struct DatabaseSink {
    readings: Arc<dyn ReadingStore>,
    registry: Arc<dyn DeviceRegistry>,
    metrics: Arc<Metrics>,
}

impl DatabaseSink {
    pub fn new(readings: Arc<dyn ReadingStore>, registry: Arc<dyn DeviceRegistry>, metrics: Arc<Metrics>) -> Self {
        Self { readings, registry, metrics }
    }
}

#[async_trait]
impl ReadingSink for DatabaseSink {
    async fn store(&self, batch: &Accepted<'_>) -> Result<Stored, Reject> {
        let device_id = batch.device_id;
        let (mut inserted, mut duplicates) = (0usize, 0usize);
        let mut last: Option<PersistedReading> = None;
        let mut failed = false;

        for env in batch.items {
            let reading = PersistedReading::from_envelope(env, batch.received_at);
            match self.readings.insert_reading(&reading).await {
                Ok(()) => inserted += 1,
                Err(StoreError::Duplicate) => {
                    duplicates += 1;
                    debug!(device_id, seq = env.seq, "duplicate_reading");
                }
                Err(e) => {
                    error!(device_id, seq = env.seq, error = %e, "telemetry_insert_failed");
                    failed = true;
                    break;
                }
            }
            last = Some(reading);
        }
        Metrics::add(&self.metrics.accepted, inserted as u64);
        Metrics::add(&self.metrics.duplicates, duplicates as u64);
        let ingested = inserted + duplicates;

        // latest wins: live state comes from the last item that made it in
        if let Some(r) = last {
            let firmware = batch.items[..ingested].iter().rev().find_map(|e| e.firmware_version.clone());
            let update = DeviceStateUpdate::from_fields(&r.fields, firmware, batch.received_at);
            if let Err(e) = self.registry.update_device_state(device_id, &update).await {
                warn!(device_id, seq = r.seq, error = %e, "device_state_update_failed");
            }
        }

        if failed {
            return Err(Reject::TelemetryInsertFailed { ingested });
        }
        Ok(Stored { ingested, stored_to: StoredTo::Database })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FallbackLine<'a> {
    received_at: DateTime<Utc>,
    reason: &'a str,
    signature_verified: bool,
    envelope: &'a TelemetryEnvelope,
}

/// Append-only JSON lines, one file per device per UTC day:
/// `<dir>/<device>/<YYYY-MM-DD>.jsonl`.
pub struct FileSink {
    dir: PathBuf,
    metrics: Arc<Metrics>,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>, metrics: Arc<Metrics>) -> Self {
        Self { dir: dir.into(), metrics }
    }

    pub fn path_for(&self, device_id: &str, day: DateTime<Utc>) -> PathBuf {
        self.dir.join(path_component(device_id)).join(format!("{}.jsonl", day.format("%Y-%m-%d")))
    }
}

/// Device ids come from the network; keep them to one harmless path segment.
fn path_component(device_id: &str) -> String {
    let s: String = device_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect();
    if s.is_empty() || s.starts_with('.') { format!("_{s}") } else { s }
}

#[async_trait]
impl ReadingSink for FileSink {
    async fn store(&self, batch: &Accepted<'_>) -> Result<Stored, Reject> {
        let path = self.path_for(batch.device_id, batch.received_at);
        let reason = batch.fallback_reason.unwrap_or("fallback");

        let mut buf = Vec::with_capacity(512 * batch.items.len());
        for env in batch.items {
            let line = FallbackLine {
                received_at: batch.received_at,
                reason,
                signature_verified: batch.signature_verified,
                envelope: env,
            };
            if let Err(e) = serde_json::to_writer(&mut buf, &line) {
                error!(device_id = batch.device_id, seq = env.seq, error = %e, "fallback_encode_failed");
                return Err(Reject::FallbackWriteFailed);
            }
            buf.push(b'\n');
        }

        // One write on an O_APPEND handle per request: concurrent writers to the
        // same file never interleave inside a line.
        let target = path.clone();
        let written = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut f = std::fs::OpenOptions::new().create(true).append(true).open(&target)?;
            f.write_all(&buf)
        })
        .await;

        match written {
            Ok(Ok(())) => {
                Metrics::add(&self.metrics.file_fallback, batch.items.len() as u64);
                info!(device_id = batch.device_id, items = batch.items.len(), reason, file = %path.display(), "file_fallback");
                Ok(Stored { ingested: batch.items.len(), stored_to: StoredTo::File(path) })
            }
            Ok(Err(e)) => {
                error!(device_id = batch.device_id, file = %path.display(), error = %e, "fallback_write_failed");
                Err(Reject::FallbackWriteFailed)
            }
            Err(e) => {
                error!(device_id = batch.device_id, error = %e, "fallback_write_task_failed");
                Err(Reject::FallbackWriteFailed)
            }
        }
    }
}
