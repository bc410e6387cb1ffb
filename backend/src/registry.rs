// =============================================================================
// FIELDLINK — Device registry collaborator + secret resolution
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::extract::ExtractedFields;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Maintenance,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(DeviceStatus::Online),
            "offline" => Ok(DeviceStatus::Offline),
            "maintenance" => Ok(DeviceStatus::Maintenance),
            other => Err(format!("unknown device status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
}

/// Registry record. Owned by the device-management workflow; ingestion only
/// reads the secret and refreshes the live-state fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device_id: String,
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    pub firmware_version: Option<String>,
    pub status: DeviceStatus,
    pub last_known_position: Option<Position>,
    pub last_speed_kph: Option<f64>,
    pub last_fuel_pct: Option<f64>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl Device {
    /// Fields absent from the update keep their stored value.
    pub fn apply(&mut self, u: &DeviceStateUpdate) {
        self.status = u.status;
        if let Some(p) = u.position { self.last_known_position = Some(p); }
        if let Some(s) = u.speed_kph { self.last_speed_kph = Some(s); }
        if let Some(f) = u.fuel_pct { self.last_fuel_pct = Some(f); }
        if let Some(fw) = &u.firmware_version { self.firmware_version = Some(fw.clone()); }
        self.last_seen_at = Some(u.last_seen_at);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewDevice {
    pub device_id: String,
    pub secret: String,
    pub firmware_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStateUpdate {
    pub status: DeviceStatus,
    pub position: Option<Position>,
    pub speed_kph: Option<f64>,
    pub fuel_pct: Option<f64>,
    pub firmware_version: Option<String>,
    pub last_seen_at: DateTime<Utc>,
}

impl DeviceStateUpdate {
    pub fn from_fields(f: &ExtractedFields, firmware_version: Option<String>, seen_at: DateTime<Utc>) -> Self {
        let status = if f.reports_offline() { DeviceStatus::Offline } else { DeviceStatus::Online };
        let position = match (f.lat, f.lng) {
            (Some(lat), Some(lng)) => Some(Position { lat, lng }),
            _ => None,
        };
        Self { status, position, speed_kph: f.speed_kph, fuel_pct: f.fuel_pct, firmware_version, last_seen_at: seen_at }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn find_by_device_id(&self, device_id: &str) -> Result<Option<Device>, StoreError>;

    /// Fails with `StoreError::Duplicate` when the id is taken.
    async fn insert_device(&self, device: NewDevice) -> Result<Device, StoreError>;

    async fn update_device_state(&self, device_id: &str, update: &DeviceStateUpdate) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Secret to verify against; `registered` when this call created the record.
    Resolved { secret: String, registered: bool },
    /// Registry answered, but there is no usable secret for this device.
    Unresolved,
    /// Registry could not be consulted.
    Unavailable,
}

/// Finds the shared secret for a device, registering it on first contact
/// when allowed. Never invents a secret.
pub struct DeviceResolver {
    registry: Arc<dyn DeviceRegistry>,
    allow_auto_register: bool,
}

impl DeviceResolver {
    pub fn new(registry: Arc<dyn DeviceRegistry>, allow_auto_register: bool) -> Self {
        Self { registry, allow_auto_register }
    }

    pub async fn resolve(&self, device_id: &str, firmware: Option<&str>, supplied_secret: Option<&str>) -> Resolution {
        match self.registry.find_by_device_id(device_id).await {
            Ok(Some(d)) => return usable(d),
            Ok(None) => {}
            Err(e) => {
                warn!(device_id, error = %e, "registry_lookup_failed");
                return Resolution::Unavailable;
            }
        }

        let Some(secret) = supplied_secret.filter(|s| !s.is_empty()) else {
            return Resolution::Unresolved;
        };
        if !self.allow_auto_register {
            return Resolution::Unresolved;
        }

        let new = NewDevice {
            device_id: device_id.to_string(),
            secret: secret.to_string(),
            firmware_version: firmware.map(str::to_owned),
        };
        match self.registry.insert_device(new).await {
            Ok(_) => {
                info!(device_id, "device_auto_registered");
                Resolution::Resolved { secret: secret.to_string(), registered: true }
            }
            // lost a registration race; the first writer's secret stands
            Err(StoreError::Duplicate) => match self.registry.find_by_device_id(device_id).await {
                Ok(Some(d)) => usable(d),
                Ok(None) => Resolution::Unresolved,
                Err(_) => Resolution::Unavailable,
            },
            Err(e) => {
                warn!(device_id, error = %e, "device_registration_failed");
                Resolution::Unavailable
            }
        }
    }
}

fn usable(d: Device) -> Resolution {
    match d.secret {
        Some(secret) if !secret.is_empty() => Resolution::Resolved { secret, registered: false },
        _ => Resolution::Unresolved,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str, secret: Option<&str>) -> Device {
        Device {
            device_id: id.to_string(),
            secret: secret.map(str::to_owned),
            firmware_version: None,
            status: DeviceStatus::Offline,
            last_known_position: None,
            last_speed_kph: None,
            last_fuel_pct: None,
            last_seen_at: None,
        }
    }

    #[tokio::test]
    async fn test_found_device_returns_stored_secret() {
        let mut reg = MockDeviceRegistry::new();
        reg.expect_find_by_device_id()
            .withf(|id| id == "D1")
            .times(1)
            .returning(|_| Ok(Some(device("D1", Some("s3cret")))));
        reg.expect_insert_device().never();

        let r = DeviceResolver::new(Arc::new(reg), true);
        // a supplied secret never replaces the stored one
        assert_eq!(
            r.resolve("D1", None, Some("attacker")).await,
            Resolution::Resolved { secret: "s3cret".into(), registered: false }
        );
    }

    #[tokio::test]
    async fn test_lookup_error_is_unavailable_not_missing() {
        let mut reg = MockDeviceRegistry::new();
        reg.expect_find_by_device_id()
            .returning(|_| Err(StoreError::Unavailable("connection refused".into())));
        reg.expect_insert_device().never();

        let r = DeviceResolver::new(Arc::new(reg), true);
        assert_eq!(r.resolve("D1", None, Some("s")).await, Resolution::Unavailable);
    }

    #[tokio::test]
    async fn test_auto_register_with_supplied_secret() {
        let mut reg = MockDeviceRegistry::new();
        reg.expect_find_by_device_id().returning(|_| Ok(None));
        reg.expect_insert_device()
            .withf(|d: &NewDevice| d.device_id == "D9" && d.secret == "boot" && d.firmware_version.as_deref() == Some("2.0"))
            .times(1)
            .returning(|d| Ok(device(&d.device_id, Some(&d.secret))));

        let r = DeviceResolver::new(Arc::new(reg), true);
        assert_eq!(
            r.resolve("D9", Some("2.0"), Some("boot")).await,
            Resolution::Resolved { secret: "boot".into(), registered: true }
        );
    }

    #[tokio::test]
    async fn test_no_auto_register_when_disabled_or_no_secret() {
        let mut reg = MockDeviceRegistry::new();
        reg.expect_find_by_device_id().returning(|_| Ok(None));
        reg.expect_insert_device().never();
        let reg: Arc<dyn DeviceRegistry> = Arc::new(reg);

        let disabled = DeviceResolver::new(reg.clone(), false);
        assert_eq!(disabled.resolve("D9", None, Some("boot")).await, Resolution::Unresolved);

        let enabled = DeviceResolver::new(reg, true);
        assert_eq!(enabled.resolve("D9", None, None).await, Resolution::Unresolved);
    }

    #[tokio::test]
    async fn test_registration_race_uses_winner_secret() {
        let mut reg = MockDeviceRegistry::new();
        let mut seq = mockall::Sequence::new();
        reg.expect_find_by_device_id().times(1).in_sequence(&mut seq).returning(|_| Ok(None));
        reg.expect_insert_device().times(1).in_sequence(&mut seq).returning(|_| Err(StoreError::Duplicate));
        reg.expect_find_by_device_id()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(device("D9", Some("winner")))));

        let r = DeviceResolver::new(Arc::new(reg), true);
        assert_eq!(
            r.resolve("D9", None, Some("loser")).await,
            Resolution::Resolved { secret: "winner".into(), registered: false }
        );
    }

    #[tokio::test]
    async fn test_device_without_secret_is_unresolved() {
        let mut reg = MockDeviceRegistry::new();
        reg.expect_find_by_device_id().returning(|_| Ok(Some(device("D1", None))));
        let r = DeviceResolver::new(Arc::new(reg), true);
        assert_eq!(r.resolve("D1", None, Some("s")).await, Resolution::Unresolved);
    }

    #[test]
    fn test_state_update_keeps_absent_fields() {
        let mut d = device("D1", Some("s"));
        d.last_fuel_pct = Some(80.0);
        d.last_known_position = Some(Position { lat: 1.0, lng: 2.0 });
        d.firmware_version = Some("1.0".into());

        let f = ExtractedFields { speed_kph: Some(9.5), lat: Some(5.0), ..Default::default() };
        d.apply(&DeviceStateUpdate::from_fields(&f, None, Utc::now()));

        assert_eq!(d.status, DeviceStatus::Online);
        assert_eq!(d.last_speed_kph, Some(9.5));
        assert_eq!(d.last_fuel_pct, Some(80.0));
        // lat without lng is not a position
        assert_eq!(d.last_known_position, Some(Position { lat: 1.0, lng: 2.0 }));
        assert_eq!(d.firmware_version.as_deref(), Some("1.0"));
        assert!(d.last_seen_at.is_some());
    }

    #[test]
    fn test_offline_status_derivation() {
        let f = ExtractedFields { status: Some("offline".into()), ..Default::default() };
        assert_eq!(DeviceStateUpdate::from_fields(&f, None, Utc::now()).status, DeviceStatus::Offline);
        assert_eq!("maintenance".parse::<DeviceStatus>(), Ok(DeviceStatus::Maintenance));
    }
}
