//! Receiver lifecycle and protocol-detection engine shared by every transport.

pub mod cache;
pub mod channel;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod link;
pub mod ratelimiter;
pub mod registry;
pub mod stats;
pub mod validator;

pub use cache::{CacheEntry, CacheKey, Classification, DeviceCache, EndpointRecord, MemoryCache};
pub use channel::{Channel, ChannelAccess, ChannelIo, ChannelSharing, OpenOptions};
pub use config::Settings;
pub use device::{rank_devices, DetectionState, Device, DeviceContext, DeviceEvent, DeviceSnapshot, DEFAULT_TEST_UNITS};
pub use discovery::{Candidate, DiscoverOptions, DiscoveryCoordinator, DiscoveryEvent, DiscoverySource};
pub use error::{CacheError, ConfigError, ConnectionError, DetectionFailure, DeviceError};
pub use link::{DeviceLink, SkipReason, TransportKind};
pub use ratelimiter::RateLimiter;
pub use registry::{DeviceRegistry, Registry, RegistryEvent};
pub use stats::{Endpoint, Statistics};
pub use validator::{Capabilities, ProtocolValidator, TestReport};

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!version().is_empty());
    }
}
