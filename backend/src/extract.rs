// =============================================================================
// FIELDLINK — Typed field extraction from freeform payloads
// =============================================================================
// A field of the wrong primitive type is absent, never coerced. New sensor
// keys can appear in payloads without touching anything downstream.
// =============================================================================

use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedFields {
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub speed_kph: Option<f64>,
    pub heading_deg: Option<f64>,
    pub status: Option<String>,
    pub fuel_pct: Option<f64>,
    pub def_pct: Option<f64>,
    pub rpm: Option<f64>,
    pub load_pct: Option<f64>,
}

impl ExtractedFields {
    pub fn reports_offline(&self) -> bool {
        self.status.as_deref().is_some_and(|s| s.eq_ignore_ascii_case("offline"))
    }
}

fn section<'a>(payload: &'a Map<String, Value>, name: &str) -> Option<&'a Map<String, Value>> {
    payload.get(name)?.as_object()
}

fn number(payload: &Map<String, Value>, sec: &str, key: &str) -> Option<f64> {
    section(payload, sec)?.get(key)?.as_f64()
}

fn string(payload: &Map<String, Value>, sec: &str, key: &str) -> Option<String> {
    section(payload, sec)?.get(key)?.as_str().map(str::to_owned)
}

pub fn extract_fields(payload: &Map<String, Value>) -> ExtractedFields {
    ExtractedFields {
        lat: number(payload, "position", "lat"),
        lng: number(payload, "position", "lng"),
        speed_kph: number(payload, "position", "speedKph"),
        heading_deg: number(payload, "position", "headingDeg"),
        status: string(payload, "state", "status"),
        fuel_pct: number(payload, "consumables", "fuelPct"),
        def_pct: number(payload, "consumables", "defPct"),
        rpm: number(payload, "powertrain", "rpm"),
        load_pct: number(payload, "powertrain", "loadPct"),
    }
}
