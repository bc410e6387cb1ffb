// =============================================================================
// FIELDLINK — Reading store collaborator
// =============================================================================
// Two backends implement both the device registry and the reading table:
// Postgres for deployments, an in-memory map for tests and local bring-up.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::envelope::TelemetryEnvelope;
use crate::error::StoreError;
use crate::extract::{extract_fields, ExtractedFields};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// One accepted envelope as stored. Unique on `(device_id, seq)`.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedReading {
    pub device_id: String,
    pub seq: i64,
    pub sent_at_ms: i64,
    pub received_at: DateTime<Utc>,
    pub firmware_version: Option<String>,
    pub fields: ExtractedFields,
    pub payload: Value,
}

impl PersistedReading {
    pub fn from_envelope(env: &TelemetryEnvelope, received_at: DateTime<Utc>) -> Self {
        Self {
            device_id: env.device_id.clone(),
            seq: env.seq,
            sent_at_ms: env.sent_at,
            received_at,
            firmware_version: env.firmware_version.clone(),
            fields: extract_fields(&env.payload),
            payload: Value::Object(env.payload.clone()),
        }
    }
}

#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Fails with `StoreError::Duplicate` when `(device_id, seq)` already exists.
    async fn insert_reading(&self, reading: &PersistedReading) -> Result<(), StoreError>;
}
