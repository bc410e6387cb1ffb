// =============================================================================
// FIELDLINK — Telemetry envelope + batch wrapper validation
// =============================================================================
// Bodies are parsed into a generic JSON tree first and checked field by field,
// so a bad request reports every problem at once instead of the first serde
// error. A batch with one malformed item is rejected as a whole.
// =============================================================================

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{FieldError, Reject};

pub const SCHEMA_VERSION: &str = "telemetry.v0.1";
pub const MAX_BATCH_ITEMS: usize = 2000;
/// Latest accepted `sentAt`: 9999-12-31T23:59:59.999Z. Earliest is the epoch.
pub const MAX_SENT_AT_MS: i64 = 253_402_300_799_999;

/// One reading from one device. Never mutated after validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEnvelope {
    pub schema_version: String,
    pub device_id: String,
    pub sent_at: i64,
    pub seq: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    pub payload: Map<String, Value>,
}

pub fn parse_envelope(body: &[u8]) -> Result<TelemetryEnvelope, Reject> {
    let root = parse_json(body)?;
    let mut errors = Vec::new();
    match validate_envelope(&root, "", &mut errors) {
        Some(env) if errors.is_empty() => Ok(env),
        _ => Err(Reject::BadBody(errors)),
    }
}

pub fn parse_batch(body: &[u8], max_items: usize) -> Result<Vec<TelemetryEnvelope>, Reject> {
    let root = parse_json(body)?;
    let Some(items) = root.get("items") else {
        return Err(Reject::BadBody(vec![FieldError::new("items", "required")]));
    };
    let Some(items) = items.as_array() else {
        return Err(Reject::BadBody(vec![FieldError::new("items", "expected array")]));
    };
    if items.is_empty() {
        return Err(Reject::BadBody(vec![FieldError::new("items", "must contain at least 1 item")]));
    }
    if items.len() > max_items {
        return Err(Reject::BadBody(vec![FieldError::new(
            "items",
            format!("must contain at most {max_items} items"),
        )]));
    }

    let mut errors = Vec::new();
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        if let Some(env) = validate_envelope(item, &format!("items.{i}"), &mut errors) {
            out.push(env);
        }
    }
    if errors.is_empty() { Ok(out) } else { Err(Reject::BadBody(errors)) }
}

fn parse_json(body: &[u8]) -> Result<Value, Reject> {
    serde_json::from_slice(body)
        .map_err(|e| Reject::BadBody(vec![FieldError::new("body", format!("invalid JSON: {e}"))]))
}

fn join(prefix: &str, field: &str) -> String {
    if prefix.is_empty() { field.to_string() } else { format!("{prefix}.{field}") }
}

/// Validates one envelope object, pushing problems onto `errors`. Returns the
/// typed envelope only when this object produced no errors.
pub fn validate_envelope(v: &Value, prefix: &str, errors: &mut Vec<FieldError>) -> Option<TelemetryEnvelope> {
    let Some(obj) = v.as_object() else {
        let path = if prefix.is_empty() { "body".to_string() } else { prefix.to_string() };
        errors.push(FieldError::new(path, "expected object"));
        return None;
    };
    let before = errors.len();

    match obj.get("schemaVersion") {
        None => errors.push(FieldError::new(join(prefix, "schemaVersion"), "required")),
        Some(Value::String(s)) if s == SCHEMA_VERSION => {}
        Some(_) => errors.push(FieldError::new(
            join(prefix, "schemaVersion"),
            format!("expected \"{SCHEMA_VERSION}\""),
        )),
    }

    let device_id = match obj.get("deviceId") {
        None => { errors.push(FieldError::new(join(prefix, "deviceId"), "required")); None }
        Some(Value::String(s)) if s.trim().is_empty() => {
            errors.push(FieldError::new(join(prefix, "deviceId"), "must not be empty"));
            None
        }
        Some(Value::String(s)) if s.trim() != s => {
            errors.push(FieldError::new(join(prefix, "deviceId"), "must not have leading or trailing whitespace"));
            None
        }
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => { errors.push(FieldError::new(join(prefix, "deviceId"), "expected string")); None }
    };

    let sent_at = match obj.get("sentAt") {
        None => { errors.push(FieldError::new(join(prefix, "sentAt"), "required")); None }
        Some(v) => match v.as_i64() {
            Some(ms) if (0..=MAX_SENT_AT_MS).contains(&ms) => Some(ms),
            Some(_) => {
                errors.push(FieldError::new(join(prefix, "sentAt"), format!("must be between 0 and {MAX_SENT_AT_MS}")));
                None
            }
            None => { errors.push(FieldError::new(join(prefix, "sentAt"), "expected integer milliseconds")); None }
        },
    };

    let seq = match obj.get("seq") {
        None => { errors.push(FieldError::new(join(prefix, "seq"), "required")); None }
        Some(v) => match v.as_i64() {
            Some(n) if n >= 0 => Some(n),
            _ => { errors.push(FieldError::new(join(prefix, "seq"), "expected non-negative integer")); None }
        },
    };

    let firmware_version = match obj.get("firmwareVersion") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => { errors.push(FieldError::new(join(prefix, "firmwareVersion"), "expected string")); None }
    };

    let payload = match obj.get("payload") {
        None => { errors.push(FieldError::new(join(prefix, "payload"), "required")); None }
        Some(Value::Object(m)) => Some(m.clone()),
        Some(_) => { errors.push(FieldError::new(join(prefix, "payload"), "expected object")); None }
    };

    if errors.len() != before {
        return None;
    }
    Some(TelemetryEnvelope {
        schema_version: SCHEMA_VERSION.to_string(),
        device_id: device_id?,
        sent_at: sent_at?,
        seq: seq?,
        firmware_version,
        payload: payload?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid() -> Value {
        json!({
            "schemaVersion": "telemetry.v0.1",
            "deviceId": "D1",
            "sentAt": 1_700_000_000_000i64,
            "seq": 42,
            "firmwareVersion": "1.4.2",
            "payload": { "position": { "lat": 46.85, "lng": 7.42 }, "vendorBlob": [1, 2, 3] }
        })
    }

    fn details(r: Reject) -> Vec<FieldError> {
        match r { Reject::BadBody(d) => d, other => panic!("expected bad_body, got {other:?}") }
    }

    #[test]
    fn test_valid_envelope_keeps_unknown_payload_keys() {
        let env = parse_envelope(valid().to_string().as_bytes()).unwrap();
        assert_eq!(env.device_id, "D1");
        assert_eq!(env.seq, 42);
        assert_eq!(env.firmware_version.as_deref(), Some("1.4.2"));
        assert_eq!(env.payload["vendorBlob"], json!([1, 2, 3]));
    }

    #[test]
    fn test_wrong_schema_version_rejected_not_coerced() {
        let mut v = valid();
        v["schemaVersion"] = json!("telemetry.v0.2");
        let d = details(parse_envelope(v.to_string().as_bytes()).unwrap_err());
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].path, "schemaVersion");
    }

    #[test]
    fn test_reports_every_bad_field() {
        let body = json!({ "schemaVersion": "telemetry.v0.1", "deviceId": "", "sentAt": "yesterday", "seq": -1, "payload": [] });
        let d = details(parse_envelope(body.to_string().as_bytes()).unwrap_err());
        let paths: Vec<_> = d.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["deviceId", "sentAt", "seq", "payload"]);
    }

    #[test]
    fn test_float_seq_rejected() {
        let mut v = valid();
        v["seq"] = json!(4.5);
        let d = details(parse_envelope(v.to_string().as_bytes()).unwrap_err());
        assert_eq!(d[0].path, "seq");
    }

    #[test]
    fn test_sent_at_range() {
        let mut v = valid();
        v["sentAt"] = json!(MAX_SENT_AT_MS);
        assert_eq!(parse_envelope(v.to_string().as_bytes()).unwrap().sent_at, MAX_SENT_AT_MS);
        v["sentAt"] = json!(0);
        assert!(parse_envelope(v.to_string().as_bytes()).is_ok());

        for bad in [MAX_SENT_AT_MS + 1, 10_000_000_000_000_000, -1] {
            v["sentAt"] = json!(bad);
            let d = details(parse_envelope(v.to_string().as_bytes()).unwrap_err());
            assert_eq!(d[0].path, "sentAt", "sentAt {bad}");
        }
    }

    #[test]
    fn test_padded_device_id_rejected() {
        let mut v = valid();
        v["deviceId"] = json!(" D1");
        let d = details(parse_envelope(v.to_string().as_bytes()).unwrap_err());
        assert_eq!(d[0].path, "deviceId");
        v["deviceId"] = json!("D1\t");
        assert!(parse_envelope(v.to_string().as_bytes()).is_err());
    }

    #[test]
    fn test_not_json() {
        let d = details(parse_envelope(b"{not json").unwrap_err());
        assert_eq!(d[0].path, "body");
    }

    #[test]
    fn test_batch_bounds() {
        let empty = json!({ "items": [] }).to_string();
        assert_eq!(details(parse_batch(empty.as_bytes(), MAX_BATCH_ITEMS).unwrap_err())[0].path, "items");

        let three = json!({ "items": [valid(), valid(), valid()] }).to_string();
        assert!(parse_batch(three.as_bytes(), 2).is_err());
        assert_eq!(parse_batch(three.as_bytes(), 3).unwrap().len(), 3);
    }

    #[test]
    fn test_batch_one_bad_item_rejects_all() {
        let mut bad = valid();
        bad.as_object_mut().unwrap().remove("payload");
        let body = json!({ "items": [valid(), bad] }).to_string();
        let d = details(parse_batch(body.as_bytes(), MAX_BATCH_ITEMS).unwrap_err());
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].path, "items.1.payload");
    }
}
