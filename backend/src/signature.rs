// =============================================================================
// FIELDLINK — HMAC-SHA256 request signatures
// =============================================================================
// Canonical string (newline-joined):
//   X-Timestamp \n X-Nonce \n METHOD \n path \n hex(sha256(raw body))
// The body hash is taken over the bytes as received, never re-serialized JSON.
// Checks run in a fixed order: headers, alg, timestamp, skew, nonce, HMAC.
// =============================================================================

use axum::http::HeaderMap;
use hmac::{digest::InvalidLength, Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::Reject;
use crate::nonce::NonceCache;

pub const ALG_HMAC_SHA256: &str = "HMAC-SHA256";

pub const HDR_TIMESTAMP: &str = "x-timestamp";
pub const HDR_NONCE: &str = "x-nonce";
pub const HDR_SIGNATURE: &str = "x-signature";
pub const HDR_SIGNATURE_ALG: &str = "x-signature-alg";

type HmacSha256 = Hmac<Sha256>;

fn header(h: &HeaderMap, name: &str) -> Option<String> {
    h.get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

#[derive(Debug, Clone, Default)]
pub struct SignatureHeaders {
    pub timestamp: Option<String>,
    pub nonce: Option<String>,
    pub signature: Option<String>,
    pub alg: Option<String>,
}

impl SignatureHeaders {
    pub fn from_headers(h: &HeaderMap) -> Self {
        Self {
            timestamp: header(h, HDR_TIMESTAMP),
            nonce: header(h, HDR_NONCE),
            signature: header(h, HDR_SIGNATURE),
            alg: header(h, HDR_SIGNATURE_ALG),
        }
    }
}

/// The parts of an HTTP request that a signature covers.
pub struct SignedRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub body: &'a [u8],
    pub headers: &'a SignatureHeaders,
}

pub fn body_hash_hex(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

pub fn canonical_string(timestamp: &str, nonce: &str, method: &str, path: &str, body: &[u8]) -> String {
    format!("{timestamp}\n{nonce}\n{}\n{path}\n{}", method.to_ascii_uppercase(), body_hash_hex(body))
}

/// Client side: hex HMAC-SHA256 over the canonical string.
pub fn sign_request(
    secret: &str,
    timestamp: &str,
    nonce: &str,
    method: &str,
    path: &str,
    body: &[u8],
) -> Result<String, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())?;
    mac.update(canonical_string(timestamp, nonce, method, path, body).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Server side verification. Records the nonce in `nonces` as a side effect
/// once the timestamp passed its checks.
pub fn verify(
    req: &SignedRequest<'_>,
    device_id: &str,
    secret: &str,
    max_skew_ms: i64,
    nonces: &dyn NonceCache,
    now_ms: i64,
) -> Result<(), Reject> {
    let h = req.headers;
    let (Some(ts), Some(nonce), Some(sig)) = (&h.timestamp, &h.nonce, &h.signature) else {
        return Err(Reject::MissingSignatureHeaders);
    };
    if let Some(alg) = &h.alg {
        if !alg.eq_ignore_ascii_case(ALG_HMAC_SHA256) {
            return Err(Reject::UnsupportedAlg);
        }
    }
    let Ok(ts_ms) = ts.parse::<i64>() else {
        return Err(Reject::BadTimestamp);
    };
    if now_ms.abs_diff(ts_ms) > max_skew_ms.max(0) as u64 {
        return Err(Reject::TimestampSkew);
    }
    if nonces.seen_recently(device_id, nonce, now_ms) {
        return Err(Reject::ReplayNonce);
    }

    let Ok(supplied) = hex::decode(sig) else {
        return Err(Reject::BadSignature);
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return Err(Reject::BadSignature);
    };
    mac.update(canonical_string(ts, nonce, req.method, req.path, req.body).as_bytes());
    // verify_slice compares in constant time
    mac.verify_slice(&supplied).map_err(|_| Reject::BadSignature)
}
