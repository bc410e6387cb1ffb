// =============================================================================
// FIELDLINK — Device telemetry ingestion
// =============================================================================
// Machines post signed JSON envelopes; the server validates, authenticates,
// deduplicates by (device, seq) and keeps each device's live state current.
// When the registry is unreachable readings can land in per-device daily
// JSON-lines files instead.
// =============================================================================

pub mod clock;
pub mod config;
pub mod envelope;
pub mod error;
pub mod extract;
pub mod metrics;
pub mod nonce;
pub mod pipeline;
pub mod registry;
pub mod routes;
pub mod signature;
pub mod sink;
pub mod store;

pub use config::Config;
pub use error::{Reject, StoreError};
pub use pipeline::{IngestPolicy, Ingestor};
pub use routes::{router, AppState};
