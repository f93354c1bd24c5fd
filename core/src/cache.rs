//! Persisted device history: the shape of the data and the store contract.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::CacheError;
use crate::stats::{Endpoint, Statistics};

/// Location of one device entry: transport root plus the stable device key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    pub root: String,
    pub device: String,
}

impl CacheKey {
    pub fn new(root: impl Into<String>, device: impl Into<String>) -> Self {
        Self { root: root.into(), device: device.into() }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.root, self.device)
    }
}

/// Transport-defined classification. Zero means unclassified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Classification {
    pub major: u32,
    pub minor: u32,
    pub service_flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub id: u32,
    pub name: Option<String>,
    pub service_id: String,
    pub success_count: u32,
    pub failure_count: u32,
}

impl From<&Endpoint> for EndpointRecord {
    fn from(e: &Endpoint) -> Self {
        Self {
            id: e.id,
            name: e.name.clone(),
            service_id: e.service_id.clone(),
            success_count: e.success_count,
            failure_count: e.failure_count,
        }
    }
}

impl From<EndpointRecord> for Endpoint {
    fn from(r: EndpointRecord) -> Self {
        Self {
            id: r.id,
            name: r.name,
            service_id: r.service_id,
            success_count: r.success_count,
            failure_count: r.failure_count,
        }
    }
}

/// Everything stored for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub name: String,
    pub success_count: u32,
    pub failure_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub last_detected: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_connected: OffsetDateTime,
    pub connection_time: Duration,
    pub class: Classification,
    pub endpoints: Vec<EndpointRecord>,
}

impl CacheEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_parts(name, &Statistics::default(), Classification::default(), &[])
    }

    pub fn from_parts(name: impl Into<String>, stats: &Statistics, class: Classification, endpoints: &[Endpoint]) -> Self {
        Self {
            name: name.into(),
            success_count: stats.success_count,
            failure_count: stats.failure_count,
            last_detected: stats.last_detected,
            last_connected: stats.last_connected,
            connection_time: stats.connection_time,
            class,
            endpoints: endpoints.iter().map(EndpointRecord::from).collect(),
        }
    }

    pub fn statistics(&self) -> Statistics {
        Statistics {
            success_count: self.success_count,
            failure_count: self.failure_count,
            last_detected: self.last_detected,
            last_connected: self.last_connected,
            connection_time: self.connection_time,
        }
    }
}

/// Hierarchical store keyed by transport root and device key.
///
/// Implementations must be cheap enough to call from async tasks; every call is a
/// short point read or write.
pub trait DeviceCache: Send + Sync {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;
    /// Replaces the entry and all of its endpoints.
    fn put(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), CacheError>;
    /// Removes the entry and its endpoint subtree. Missing entries are not an error.
    fn delete(&self, key: &CacheKey) -> Result<(), CacheError>;
    /// Device keys stored under a transport root.
    fn keys(&self, root: &str) -> Result<Vec<String>, CacheError>;
}

/// Process-local cache, used for tests and when no database is configured.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<BTreeMap<CacheKey, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.lock().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<CacheKey, CacheEntry>> {
        // A poisoned map still holds whole entries; every write is a single insert.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DeviceCache for MemoryCache {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.lock().get(key).cloned())
    }

    fn put(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), CacheError> {
        self.lock().insert(key.clone(), entry.clone());
        Ok(())
    }

    fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.lock().remove(key);
        Ok(())
    }

    fn keys(&self, root: &str) -> Result<Vec<String>, CacheError> {
        Ok(self.lock().keys().filter(|k| k.root == root).map(|k| k.device.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_cache_round_trip() {
        let cache = MemoryCache::new();
        let key = CacheKey::new("radio", "AA:BB:CC:DD:EE:FF");
        let mut entry = CacheEntry::new("Test");
        entry.success_count = 3;
        entry.failure_count = 1;
        entry.endpoints.push(EndpointRecord::from(&Endpoint::new(1, "serial").named("SPP")));
        cache.put(&key, &entry).unwrap();
        assert_eq!(cache.get(&key).unwrap(), Some(entry));
        assert_eq!(cache.keys("radio").unwrap(), vec!["AA:BB:CC:DD:EE:FF".to_string()]);
        assert!(cache.keys("net").unwrap().is_empty());
        cache.delete(&key).unwrap();
        assert_eq!(cache.get(&key).unwrap(), None);
        cache.delete(&key).unwrap();
    }

    #[test]
    fn entry_timestamps_serialize_as_rfc3339() {
        let entry = CacheEntry::new("Test");
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("1970-01-01T00:00:00Z"), "{json}");
        let back: CacheEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
