// =============================================================================
// FIELDLINK — HTTP surface
// =============================================================================

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing::instrument;

use crate::metrics::Metrics;
use crate::nonce::NonceCache;
use crate::pipeline::{Ingestor, RequestMeta};

#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    pub metrics: Arc<Metrics>,
    pub nonces: Arc<dyn NonceCache>,
}

pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/telemetry", post(telemetry))
        .route("/telemetry/batch", post(telemetry_batch))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(CompressionLayer::new()))
}

#[instrument(skip_all)]
async fn telemetry(State(s): State<AppState>, method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    let req = RequestMeta { method: method.as_str(), path: uri.path(), body: &body, headers: &headers };
    match s.ingestor.ingest_single(&req).await {
        Ok(r) => (StatusCode::OK, Json(r)).into_response(),
        Err(r) => r.into_response(),
    }
}

#[instrument(skip_all)]
async fn telemetry_batch(State(s): State<AppState>, method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    let req = RequestMeta { method: method.as_str(), path: uri.path(), body: &body, headers: &headers };
    match s.ingestor.ingest_batch(&req).await {
        Ok(r) => (StatusCode::OK, Json(r)).into_response(),
        Err(r) => r.into_response(),
    }
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(s): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(s.metrics.snapshot(s.nonces.len())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::nonce::MemoryNonceCache;
    use crate::pipeline::tests::{envelope, signed_headers, NOW};
    use crate::pipeline::{IngestPolicy, HDR_DEVICE_SECRET};
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::{HeaderValue, Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app(policy: IngestPolicy, store: Arc<MemoryStore>) -> Router {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(NOW));
        let metrics = Arc::new(Metrics::new());
        let nonces: Arc<dyn NonceCache> = Arc::new(MemoryNonceCache::new(600_000, 10_000));
        let ingestor = Ingestor::new(policy, store.clone(), store, nonces.clone(), clock, metrics.clone());
        router(AppState { ingestor: Arc::new(ingestor), metrics, nonces }, 1024 * 1024)
    }

    async fn post(app: &Router, path: &str, headers: HeaderMap, body: String) -> (StatusCode, Value) {
        let mut req = Request::builder().method("POST").uri(path).body(Body::from(body)).unwrap();
        *req.headers_mut() = headers;
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_single_envelope_ok() {
        let store = Arc::new(MemoryStore::with_devices([("D1", "d1-secret")]));
        let app = app(IngestPolicy::default(), store.clone());
        let body = envelope("D1", 42, json!({ "state": { "status": "working" }, "consumables": { "fuelPct": 63.5 } })).to_string();
        let headers = signed_headers("d1-secret", NOW, "n-1", "/telemetry", body.as_bytes());

        let (status, v) = post(&app, "/telemetry", headers, body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(v, json!({ "ok": true, "serverTime": NOW }));
        assert_eq!(store.device("D1").unwrap().last_fuel_pct, Some(63.5));
    }

    #[tokio::test]
    async fn test_signed_for_other_path_rejected() {
        let store = Arc::new(MemoryStore::with_devices([("D1", "d1-secret")]));
        let app = app(IngestPolicy::default(), store);
        let body = json!({ "items": [envelope("D1", 1, json!({}))] }).to_string();
        let headers = signed_headers("d1-secret", NOW, "n-1", "/telemetry", body.as_bytes());

        let (status, v) = post(&app, "/telemetry/batch", headers, body).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(v["error"], "bad_signature");
    }

    #[tokio::test]
    async fn test_skew_limit_over_http() {
        let store = Arc::new(MemoryStore::with_devices([("D1", "d1-secret")]));
        let app = app(IngestPolicy::default(), store);
        let body = envelope("D1", 1, json!({})).to_string();

        let edge = signed_headers("d1-secret", NOW - 300_000, "n-1", "/telemetry", body.as_bytes());
        assert_eq!(post(&app, "/telemetry", edge, body.clone()).await.0, StatusCode::OK);

        let late = signed_headers("d1-secret", NOW - 300_001, "n-2", "/telemetry", body.as_bytes());
        let (status, v) = post(&app, "/telemetry", late, body).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(v["error"], "timestamp_skew");
    }

    #[tokio::test]
    async fn test_bad_body_is_400() {
        let app = app(IngestPolicy::default(), Arc::new(MemoryStore::new()));
        let (status, v) = post(&app, "/telemetry/batch", HeaderMap::new(), json!({ "items": [] }).to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"], "bad_body");
        assert_eq!(v["details"][0]["path"], "items");
    }

    #[tokio::test]
    async fn test_registry_down_is_503() {
        let store = Arc::new(MemoryStore::with_devices([("D1", "d1-secret")]));
        store.set_unavailable(true);
        let app = app(IngestPolicy::default(), store);
        let body = envelope("D1", 1, json!({})).to_string();
        let headers = signed_headers("d1-secret", NOW, "n-1", "/telemetry", body.as_bytes());

        let (status, v) = post(&app, "/telemetry", headers, body).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(v["error"], "db_unavailable");
    }

    #[tokio::test]
    async fn test_concurrent_fallback_appends_are_whole_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let policy = IngestPolicy { file_fallback: true, fallback_dir: dir.path().into(), ..Default::default() };
        let app = app(policy, store);

        const N: i64 = 40;
        let mut tasks = Vec::new();
        for seq in 0..N {
            let app = app.clone();
            tasks.push(tokio::spawn(async move {
                let body = envelope("D7", seq, json!({ "pad": "x".repeat(2048) })).to_string();
                let mut headers = signed_headers("d7-secret", NOW, &format!("n-{seq}"), "/telemetry", body.as_bytes());
                headers.insert(HDR_DEVICE_SECRET, HeaderValue::from_static("d7-secret"));
                post(&app, "/telemetry", headers, body).await
            }));
        }
        let mut file = None;
        for t in tasks {
            let (status, v) = t.await.unwrap();
            assert_eq!(status, StatusCode::OK);
            assert_eq!(v["storedTo"], "file");
            file = v["file"].as_str().map(str::to_owned);
        }

        let text = std::fs::read_to_string(file.unwrap()).unwrap();
        let mut seqs: Vec<i64> = text
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).unwrap()["envelope"]["seq"].as_i64().unwrap())
            .collect();
        seqs.sort_unstable();
        assert_eq!(seqs, (0..N).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_oversized_body_is_413() {
        let app = app(IngestPolicy::default(), Arc::new(MemoryStore::new()));
        let req = Request::post("/telemetry").body(Body::from(vec![b' '; 2 * 1024 * 1024])).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let app = app(IngestPolicy::default(), Arc::new(MemoryStore::new()));
        let resp = app.clone().oneshot(Request::get("/health").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        post(&app, "/telemetry", HeaderMap::new(), "nope".into()).await;
        let resp = app.oneshot(Request::get("/metrics").body(Body::empty()).unwrap()).await.unwrap();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let v: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["malformed"], 1);
        assert_eq!(v["nonce_cache_size"], 0);
    }
}
