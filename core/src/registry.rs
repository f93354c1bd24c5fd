// ── Device registry ──
//
// Process-wide record of confirmed receivers. Devices hold it as an
// `Arc<dyn DeviceRegistry>` handed in at construction instead of reaching for a
// global. `Registry` is the stock implementation.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::cache::CacheKey;
use crate::device::Device;
use crate::error::DetectionFailure;
use crate::link::TransportKind;

pub const DEFAULT_DETECTION_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_CHANNEL_SIZE: usize = 64;

pub trait DeviceRegistry: Send + Sync {
    fn add(&self, device: &Device);

    /// Whether some consumer wants `device`'s channel kept open after detection.
    fn is_channel_still_needed(&self, device: &Device) -> bool;

    fn allow_connections_for(&self, kind: TransportKind) -> bool;

    fn on_detection_attempted(&self, device: &Device);

    fn on_detection_failed(&self, device: &Device, reason: &DetectionFailure);

    /// Default wait used by `Device::wait_for_detection(None)` and the validator deadline.
    fn detection_timeout(&self) -> Duration;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Added(CacheKey),
    DetectionAttempted(CacheKey),
    DetectionFailed { key: CacheKey, reason: DetectionFailure },
}

/// Confirmed devices are held strongly; call [`Registry::clear`] at shutdown.
pub struct Registry {
    devices: Mutex<Vec<Device>>,
    claims: Mutex<HashMap<CacheKey, usize>>,
    blocked: Mutex<HashSet<TransportKind>>,
    detection_timeout: Duration,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_DETECTION_TIMEOUT)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Registry {
    pub fn new(detection_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            devices: Mutex::new(Vec::new()),
            claims: Mutex::new(HashMap::new()),
            blocked: Mutex::new(HashSet::new()),
            detection_timeout,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn devices(&self) -> Vec<Device> {
        lock(&self.devices).clone()
    }

    pub fn get(&self, key: &CacheKey) -> Option<Device> {
        lock(&self.devices).iter().find(|d| d.key() == key).cloned()
    }

    pub fn remove(&self, key: &CacheKey) -> Option<Device> {
        let mut devices = lock(&self.devices);
        let idx = devices.iter().position(|d| d.key() == key)?;
        Some(devices.remove(idx))
    }

    pub fn clear(&self) -> Vec<Device> {
        std::mem::take(&mut *lock(&self.devices))
    }

    /// Registers interest in keeping `key`'s channel open. Claims are counted.
    pub fn claim_channel(&self, key: &CacheKey) {
        *lock(&self.claims).entry(key.clone()).or_insert(0) += 1;
    }

    pub fn release_channel(&self, key: &CacheKey) {
        let mut claims = lock(&self.claims);
        if let Some(n) = claims.get_mut(key) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                claims.remove(key);
            }
        }
    }

    pub fn set_allowed(&self, kind: TransportKind, allowed: bool) {
        let mut blocked = lock(&self.blocked);
        if allowed {
            blocked.remove(&kind);
        } else {
            blocked.insert(kind);
        }
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.events.send(event);
    }
}

impl DeviceRegistry for Registry {
    fn add(&self, device: &Device) {
        {
            let mut devices = lock(&self.devices);
            match devices.iter_mut().find(|d| d.key() == device.key()) {
                Some(existing) if existing.is_same(device) => return,
                Some(existing) => *existing = device.clone(),
                None => devices.push(device.clone()),
            }
        }
        info!(device = %device.key(), name = %device.name(), "device registered");
        self.emit(RegistryEvent::Added(device.key().clone()));
    }

    fn is_channel_still_needed(&self, device: &Device) -> bool {
        lock(&self.claims).contains_key(device.key())
    }

    fn allow_connections_for(&self, kind: TransportKind) -> bool {
        !lock(&self.blocked).contains(&kind)
    }

    fn on_detection_attempted(&self, device: &Device) {
        self.emit(RegistryEvent::DetectionAttempted(device.key().clone()));
    }

    fn on_detection_failed(&self, device: &Device, reason: &DetectionFailure) {
        debug!(device = %device.key(), %reason, "detection failure reported");
        self.emit(RegistryEvent::DetectionFailed { key: device.key().clone(), reason: reason.clone() });
    }

    fn detection_timeout(&self) -> Duration {
        self.detection_timeout
    }
}
