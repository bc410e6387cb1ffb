use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{PersistedReading, ReadingStore};
use crate::error::StoreError;
use crate::registry::{Device, DeviceRegistry, DeviceStateUpdate, DeviceStatus, NewDevice};

/// DashMap-backed registry and reading table. `set_unavailable` simulates an
/// unreachable database for every call.
#[derive(Default)]
pub struct MemoryStore {
    devices: DashMap<String, Device>,
    readings: DashMap<(String, i64), PersistedReading>,
    unavailable: AtomicBool,
    // inserts that will fail outright, for exercising the 500 path
    failing_inserts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices<I, S>(devices: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        let s = Self::new();
        for (id, secret) in devices {
            s.put_device(id.into(), secret.into());
        }
        s
    }

    pub fn put_device(&self, device_id: String, secret: String) {
        self.devices.insert(device_id.clone(), new_device(device_id, Some(secret), None));
    }

    #[cfg(test)]
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn fail_next_inserts(&self, n: usize) {
        self.failing_inserts.store(n, Ordering::SeqCst);
    }

    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.devices.get(device_id).map(|d| d.clone())
    }

    pub fn reading(&self, device_id: &str, seq: i64) -> Option<PersistedReading> {
        self.readings.get(&(device_id.to_string(), seq)).map(|r| r.clone())
    }

    pub fn reading_count(&self, device_id: &str) -> usize {
        self.readings.iter().filter(|r| r.key().0 == device_id).count()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store marked unavailable".into()))
        } else {
            Ok(())
        }
    }
}

fn new_device(device_id: String, secret: Option<String>, firmware_version: Option<String>) -> Device {
    Device {
        device_id,
        secret,
        firmware_version,
        status: DeviceStatus::Offline,
        last_known_position: None,
        last_speed_kph: None,
        last_fuel_pct: None,
        last_seen_at: None,
    }
}

#[async_trait]
impl DeviceRegistry for MemoryStore {
    async fn find_by_device_id(&self, device_id: &str) -> Result<Option<Device>, StoreError> {
        self.check()?;
        Ok(self.device(device_id))
    }

    async fn insert_device(&self, d: NewDevice) -> Result<Device, StoreError> {
        self.check()?;
        match self.devices.entry(d.device_id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate),
            Entry::Vacant(v) => Ok(v.insert(new_device(d.device_id, Some(d.secret), d.firmware_version)).clone()),
        }
    }

    async fn update_device_state(&self, device_id: &str, update: &DeviceStateUpdate) -> Result<(), StoreError> {
        self.check()?;
        if let Some(mut d) = self.devices.get_mut(device_id) {
            d.apply(update);
        }
        Ok(())
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn insert_reading(&self, r: &PersistedReading) -> Result<(), StoreError> {
        self.check()?;
        if self.failing_inserts.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
            return Err(StoreError::Unavailable("insert failed".into()));
        }
        match self.readings.entry((r.device_id.clone(), r.seq)) {
            Entry::Occupied(_) => Err(StoreError::Duplicate),
            Entry::Vacant(v) => {
                v.insert(r.clone());
                Ok(())
            }
        }
    }
}
