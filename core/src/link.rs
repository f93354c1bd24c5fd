//! Per-transport capabilities a [`Device`](crate::Device) delegates to.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{CacheEntry, CacheKey, Classification, DeviceCache};
use crate::channel::{Channel, OpenOptions};
use crate::config::Settings;
use crate::error::{CacheError, ConnectionError};
use crate::stats::{Endpoint, Statistics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    RadioSocket,
    Network,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::RadioSocket => "radio",
            TransportKind::Network => "net",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a transport declined to run detection at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("device class {0} never carries a receiver")]
    ExcludedClass(String),

    #[error("{failures} failures without a success exceeds the limit of {limit}")]
    TooManyFailures { failures: u32, limit: u32 },
}

/// Transport capability interface, selected when a device is constructed.
///
/// Only `kind`, `address` and `open_channel` are transport-specific for every
/// variant; the cache mapping and detection pre-checks have defaults keyed by
/// `kind().as_str()` and `address()`.
#[async_trait]
pub trait DeviceLink: Send + Sync + fmt::Debug {
    fn kind(&self) -> TransportKind;

    /// Stable identifier, independent of any endpoint. Also the de-duplication key.
    fn address(&self) -> String;

    async fn open_channel(&self, endpoint: Option<&Endpoint>, options: &OpenOptions) -> Result<Channel, ConnectionError>;

    fn classification(&self) -> Classification {
        Classification::default()
    }

    /// Best-effort local port name the platform mapped to this device.
    fn virtual_port(&self) -> Option<String> {
        None
    }

    fn cache_key(&self) -> CacheKey {
        CacheKey::new(self.kind().as_str(), self.address())
    }

    fn read_cache(&self, cache: &dyn DeviceCache) -> Result<Option<CacheEntry>, CacheError> {
        cache.get(&self.cache_key())
    }

    fn write_cache(&self, cache: &dyn DeviceCache, entry: &CacheEntry) -> Result<(), CacheError> {
        cache.put(&self.cache_key(), entry)
    }

    fn remove_cache(&self, cache: &dyn DeviceCache) -> Result<(), CacheError> {
        cache.delete(&self.cache_key())
    }

    /// Early exits evaluated before a channel is opened for detection.
    /// Overrides should keep the failure limit via [`Statistics::check_failure_limit`].
    fn precheck(&self, stats: &Statistics, settings: &Settings) -> Result<(), SkipReason> {
        stats.check_failure_limit(settings.max_allowed_failures())
    }

    /// Folds one detection outcome into the current endpoint's own counters.
    fn record_endpoint_outcome(&self, endpoint: &mut Endpoint, confirmed: bool) {
        if confirmed {
            endpoint.success_count = endpoint.success_count.saturating_add(1);
        } else {
            endpoint.failure_count = endpoint.failure_count.saturating_add(1);
        }
    }

    /// Index of the endpoint a detection connects to: most reliable, then fewest
    /// failures, then first listed. Untried endpoints win over failing ones.
    fn preferred_endpoint(&self, endpoints: &[Endpoint]) -> Option<usize> {
        endpoints
            .iter()
            .enumerate()
            .min_by(|(ia, a), (ib, b)| {
                b.reliability()
                    .total_cmp(&a.reliability())
                    .then(a.failure_count.cmp(&b.failure_count))
                    .then(ia.cmp(ib))
            })
            .map(|(i, _)| i)
    }
}
