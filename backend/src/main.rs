// =============================================================================
// FIELDLINK — Telemetry Ingestion Server (Rust/Axum/Tokio)
// =============================================================================

use anyhow::Context;
use clap::Parser;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing::{info, warn};

use fieldlink_ingest::{
    clock::{Clock, SystemClock},
    envelope::SCHEMA_VERSION,
    metrics::Metrics,
    nonce::{self, MemoryNonceCache, NonceCache},
    registry::DeviceRegistry,
    router,
    store::{postgres, MemoryStore, PgStore, ReadingStore},
    AppState, Config, Ingestor,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or("fieldlink_ingest=info,tower_http=info".into()))
        .json()
        .init();

    let cfg = Config::parse();
    info!(schema = SCHEMA_VERSION, require_signature = cfg.require_signature, file_fallback = cfg.file_fallback, "FieldLink ingest server starting");

    let (registry, readings): (Arc<dyn DeviceRegistry>, Arc<dyn ReadingStore>) = match &cfg.database_url {
        Some(url) => {
            let pg = Arc::new(PgStore::connect_lazy(url).context("invalid DATABASE_URL")?);
            tokio::spawn(postgres::ensure_schema(pg.clone(), Duration::from_secs(5)));
            let registry: Arc<dyn DeviceRegistry> = pg.clone();
            let readings: Arc<dyn ReadingStore> = pg;
            (registry, readings)
        }
        None => {
            let seeds = cfg.seeded_devices().map_err(anyhow::Error::msg)?;
            warn!(devices = seeds.len(), "no DATABASE_URL, using in-memory store");
            let mem = Arc::new(MemoryStore::with_devices(seeds));
            let registry: Arc<dyn DeviceRegistry> = mem.clone();
            let readings: Arc<dyn ReadingStore> = mem;
            (registry, readings)
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let metrics = Arc::new(Metrics::new());
    let nonces: Arc<dyn NonceCache> = Arc::new(MemoryNonceCache::new(cfg.nonce_ttl_ms, cfg.nonce_cache_max));
    tokio::spawn(nonce::eviction(nonces.clone(), clock.clone(), Duration::from_secs(60)));

    let ingestor = Ingestor::new(cfg.policy(), registry, readings, nonces.clone(), clock, metrics.clone());
    let app = router(AppState { ingestor: Arc::new(ingestor), metrics, nonces }, cfg.max_body_bytes);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async { tokio::signal::ctrl_c().await.ok(); info!("shutdown"); })
        .await?;
    Ok(())
}
