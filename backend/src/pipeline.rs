// =============================================================================
// FIELDLINK — Ingestion pipeline
// =============================================================================
// validate → device id check → resolve device → verify signature → sink
//
// Registry down or device unknown:
//   fallback off → 503 db_unavailable / 401 device_not_registered
//   fallback on  → verify against X-Device-Secret (when signatures are
//                  required), then append to the device's daily file
// Every path returns a Result; nothing here panics or bubbles up untyped.
// =============================================================================

use axum::http::HeaderMap;
use chrono::Utc;
use serde::Serialize;
use std::{path::PathBuf, sync::Arc};
use tracing::{info, warn};

use crate::clock::{to_datetime, Clock};
use crate::envelope::{parse_batch, parse_envelope, TelemetryEnvelope};
use crate::error::Reject;
use crate::metrics::Metrics;
use crate::nonce::NonceCache;
use crate::registry::{DeviceRegistry, DeviceResolver, Resolution};
use crate::signature::{self, SignatureHeaders, SignedRequest};
use crate::sink::{Accepted, DatabaseSink, FileSink, ReadingSink, Stored, StoredTo};
use crate::store::ReadingStore;

pub const HDR_DEVICE_ID: &str = "x-device-id";
pub const HDR_DEVICE_SECRET: &str = "x-device-secret";

#[derive(Debug, Clone)]
pub struct IngestPolicy {
    pub require_signature: bool,
    pub allow_auto_register: bool,
    pub max_skew_ms: i64,
    pub file_fallback: bool,
    pub fallback_dir: PathBuf,
    pub max_batch_items: usize,
}

impl Default for IngestPolicy {
    fn default() -> Self {
        Self {
            require_signature: true,
            allow_auto_register: false,
            max_skew_ms: 300_000,
            file_fallback: false,
            fallback_dir: PathBuf::from("./telemetry-fallback"),
            max_batch_items: crate::envelope::MAX_BATCH_ITEMS,
        }
    }
}

/// The raw request as seen by the HTTP layer.
pub struct RequestMeta<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub body: &'a [u8],
    pub headers: &'a HeaderMap,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub ok: bool,
    pub server_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stored_to: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingested: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl IngestResponse {
    fn from_stored(server_time: i64, stored: Stored, batch: bool) -> Self {
        let (stored_to, file) = match stored.stored_to {
            StoredTo::Database => (None, None),
            StoredTo::File(p) => (Some("file"), Some(p.display().to_string())),
        };
        Self { ok: true, server_time, stored_to, ingested: batch.then_some(stored.ingested), file }
    }
}

fn text_header(h: &HeaderMap, name: &str) -> Option<String> {
    h.get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

pub struct Ingestor {
    policy: IngestPolicy,
    resolver: DeviceResolver,
    database: DatabaseSink,
    fallback: Option<FileSink>,
    nonces: Arc<dyn NonceCache>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl Ingestor {
    pub fn new(
        policy: IngestPolicy,
        registry: Arc<dyn DeviceRegistry>,
        readings: Arc<dyn ReadingStore>,
        nonces: Arc<dyn NonceCache>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let fallback = policy.file_fallback.then(|| FileSink::new(policy.fallback_dir.clone(), metrics.clone()));
        Self {
            resolver: DeviceResolver::new(registry.clone(), policy.allow_auto_register),
            database: DatabaseSink::new(readings, registry, metrics.clone()),
            fallback,
            policy,
            nonces,
            clock,
            metrics,
        }
    }

    pub async fn ingest_single(&self, req: &RequestMeta<'_>) -> Result<IngestResponse, Reject> {
        let env = parse_envelope(req.body).map_err(|r| self.malformed(req, r))?;
        self.run(req, vec![env], false).await
    }

    pub async fn ingest_batch(&self, req: &RequestMeta<'_>) -> Result<IngestResponse, Reject> {
        let items = parse_batch(req.body, self.policy.max_batch_items).map_err(|r| self.malformed(req, r))?;
        self.run(req, items, true).await
    }

    fn malformed(&self, req: &RequestMeta<'_>, r: Reject) -> Reject {
        if let Reject::BadBody(d) = &r {
            warn!(path = req.path, problems = d.len(), first = ?d.first(), "malformed_body");
        }
        self.metrics.record_reject(&r);
        r
    }

    async fn run(&self, req: &RequestMeta<'_>, items: Vec<TelemetryEnvelope>, batch: bool) -> Result<IngestResponse, Reject> {
        // parse_* never hands back an empty list
        let device_id = items[0].device_id.clone();
        match self.ingest(req, &device_id, items).await {
            Ok(stored) => Ok(IngestResponse::from_stored(self.clock.now_ms(), stored, batch)),
            Err(r) => {
                self.metrics.record_reject(&r);
                if r.is_auth() {
                    warn!(device_id = %device_id, path = req.path, reason = r.code(), "auth_reject");
                }
                Err(r)
            }
        }
    }

    async fn ingest(&self, req: &RequestMeta<'_>, device_id: &str, mut items: Vec<TelemetryEnvelope>) -> Result<Stored, Reject> {
        if let Some(claimed) = text_header(req.headers, HDR_DEVICE_ID) {
            if claimed != device_id {
                return Err(Reject::DeviceIdMismatch);
            }
        }

        let before = items.len();
        items.retain(|e| e.device_id == device_id);
        let skipped = before - items.len();
        if skipped > 0 {
            Metrics::add(&self.metrics.batch_skipped, skipped as u64);
            info!(device_id, skipped, kept = items.len(), "batch_items_skipped");
        }

        let supplied_secret = text_header(req.headers, HDR_DEVICE_SECRET);
        let firmware = items.iter().rev().find_map(|e| e.firmware_version.as_deref());
        let now = self.clock.now_ms();
        let sig = SignatureHeaders::from_headers(req.headers);
        let signed = SignedRequest { method: req.method, path: req.path, body: req.body, headers: &sig };

        let resolution = self.resolver.resolve(device_id, firmware, supplied_secret.as_deref()).await;
        let (sink, fallback_reason): (&dyn ReadingSink, Option<&'static str>) = match resolution {
            Resolution::Resolved { secret, registered } => {
                if registered {
                    Metrics::add(&self.metrics.auto_registered, 1);
                }
                if self.policy.require_signature {
                    signature::verify(&signed, device_id, &secret, self.policy.max_skew_ms, self.nonces.as_ref(), now)?;
                }
                (&self.database as &dyn ReadingSink, None)
            }
            unresolved => {
                let (reason, refusal) = match unresolved {
                    Resolution::Unavailable => ("registry_unavailable", Reject::DbUnavailable),
                    _ => ("device_not_registered", Reject::DeviceNotRegistered),
                };
                let Some(fallback) = &self.fallback else {
                    return Err(refusal);
                };
                if self.policy.require_signature {
                    let Some(secret) = supplied_secret.as_deref() else {
                        return Err(Reject::MissingDeviceSecretForSignature);
                    };
                    signature::verify(&signed, device_id, secret, self.policy.max_skew_ms, self.nonces.as_ref(), now)?;
                }
                (fallback as &dyn ReadingSink, Some(reason))
            }
        };

        let accepted = Accepted {
            device_id,
            items: &items,
            received_at: to_datetime(now).unwrap_or_else(Utc::now),
            fallback_reason,
            signature_verified: self.policy.require_signature,
        };
        sink.store(&accepted).await
    }
}
