//! Radio stream-socket transport: peers addressed by a 48-bit radio address,
//! channels opened to a numbered service channel on the peer.

mod address;
mod class;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gpslink_core::{
    CacheEntry, Candidate, Channel, ChannelIo, Classification, ConnectionError, DeviceLink, DiscoverySource, Endpoint,
    OpenOptions, Settings, SkipReason, Statistics, TransportKind,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use address::{AddressError, RadioAddress};
pub use class::{ClassOfDevice, MajorClass, ServiceClasses};

/// Serial-port profile service identifier.
pub const SERIAL_PORT_SERVICE: &str = "00001101-0000-1000-8000-00805f9b34fb";
pub const DEFAULT_CHANNEL: u8 = 1;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioService {
    pub channel: u8,
    pub name: Option<String>,
    pub service_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioPeer {
    pub address: RadioAddress,
    pub name: String,
    pub class: ClassOfDevice,
    pub services: Vec<RadioService>,
}

/// The operating system's radio stack, as far as this transport needs it.
#[async_trait]
pub trait RadioPlatform: Send + Sync + std::fmt::Debug {
    /// Paired or remembered peers.
    async fn known_peers(&self) -> Vec<RadioPeer>;

    /// Inquiry scan. Sends peers as they answer; returns when done or cancelled.
    async fn inquiry(&self, found: mpsc::Sender<RadioPeer>, cancel: CancellationToken);

    async fn connect(&self, address: RadioAddress, channel: u8) -> io::Result<Box<dyn ChannelIo>>;

    /// Local port name the platform mapped to the peer, if any.
    fn virtual_port(&self, _address: RadioAddress) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct RadioSocketLink {
    platform: Arc<dyn RadioPlatform>,
    address: RadioAddress,
    class: ClassOfDevice,
}

impl RadioSocketLink {
    pub fn new(platform: Arc<dyn RadioPlatform>, address: RadioAddress, class: ClassOfDevice) -> Self {
        Self { platform, address, class }
    }

    pub fn radio_address(&self) -> RadioAddress { self.address }
    pub fn class(&self) -> ClassOfDevice { self.class }
}

fn connect_error(e: io::Error) -> ConnectionError {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => ConnectionError::Refused(e.to_string()),
        io::ErrorKind::TimedOut => ConnectionError::Timeout(CONNECT_TIMEOUT),
        io::ErrorKind::NotFound | io::ErrorKind::Unsupported => ConnectionError::Unavailable(e.to_string()),
        _ => ConnectionError::Io(e),
    }
}

#[async_trait]
impl DeviceLink for RadioSocketLink {
    fn kind(&self) -> TransportKind {
        TransportKind::RadioSocket
    }

    fn address(&self) -> String {
        self.address.to_string()
    }

    async fn open_channel(&self, endpoint: Option<&Endpoint>, options: &OpenOptions) -> Result<Channel, ConnectionError> {
        let channel = match endpoint {
            Some(e) => u8::try_from(e.id)
                .ok()
                .filter(|c| (1..=30).contains(c))
                .ok_or_else(|| ConnectionError::Unavailable(format!("no such radio channel {}", e.id)))?,
            None => DEFAULT_CHANNEL,
        };
        debug!(address = %self.address, channel, "radio connect");
        let io = match timeout(CONNECT_TIMEOUT, self.platform.connect(self.address, channel)).await {
            Ok(Ok(io)) => io,
            Ok(Err(e)) => return Err(connect_error(e)),
            Err(_) => return Err(ConnectionError::Timeout(CONNECT_TIMEOUT)),
        };
        Ok(Channel::from_boxed(io, options.read_timeout, options.write_timeout))
    }

    fn classification(&self) -> Classification {
        self.class.classification()
    }

    fn virtual_port(&self) -> Option<String> {
        self.platform.virtual_port(self.address)
    }

    fn precheck(&self, stats: &Statistics, settings: &Settings) -> Result<(), SkipReason> {
        if let major @ (MajorClass::Computer | MajorClass::Phone) = self.class.major() {
            return Err(SkipReason::ExcludedClass(major.to_string()));
        }
        stats.check_failure_limit(settings.max_allowed_failures())
    }

    /// A confirmed channel wipes that channel's failure streak.
    fn record_endpoint_outcome(&self, endpoint: &mut Endpoint, confirmed: bool) {
        if confirmed {
            endpoint.success_count = endpoint.success_count.saturating_add(1);
            endpoint.failure_count = 0;
        } else {
            endpoint.failure_count = endpoint.failure_count.saturating_add(1);
        }
    }
}

/// Discovery half of the radio transport.
#[derive(Debug, Clone)]
pub struct RadioDiscovery {
    platform: Arc<dyn RadioPlatform>,
}

impl RadioDiscovery {
    pub fn new(platform: Arc<dyn RadioPlatform>) -> Self {
        Self { platform }
    }

    fn candidate(&self, peer: RadioPeer) -> Candidate {
        let endpoints = peer
            .services
            .into_iter()
            .map(|s| {
                let e = Endpoint::new(u32::from(s.channel), s.service_id);
                match s.name {
                    Some(name) => e.named(name),
                    None => e,
                }
            })
            .collect();
        Candidate {
            link: Arc::new(RadioSocketLink::new(self.platform.clone(), peer.address, peer.class)),
            name: peer.name,
            endpoints,
        }
    }
}

#[async_trait]
impl DiscoverySource for RadioDiscovery {
    fn kind(&self) -> TransportKind {
        TransportKind::RadioSocket
    }

    fn link_from_cache(&self, address: &str, entry: &CacheEntry) -> Option<Arc<dyn DeviceLink>> {
        let address = RadioAddress::parse(address).ok()?;
        let class = ClassOfDevice::from_classification(entry.class);
        Some(Arc::new(RadioSocketLink::new(self.platform.clone(), address, class)))
    }

    async fn known_peers(&self) -> Vec<Candidate> {
        self.platform.known_peers().await.into_iter().map(|p| self.candidate(p)).collect()
    }

    async fn scan(&self, found: mpsc::Sender<Candidate>, cancel: CancellationToken) {
        let (tx, mut rx) = mpsc::channel(16);
        let inquiry = self.platform.inquiry(tx, cancel.clone());
        let forward = async {
            while let Some(peer) = rx.recv().await {
                if found.send(self.candidate(peer)).await.is_err() {
                    break;
                }
            }
        };
        tokio::join!(inquiry, forward);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use gpslink_core::{
        CacheKey, Device, DeviceCache, DeviceContext, DetectionState, EndpointRecord, MemoryCache, ProtocolValidator,
        Registry, TestReport,
    };
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
    use tokio::time::Instant;

    use super::*;

    #[derive(Debug, Default)]
    struct MockPlatform {
        peers: Vec<RadioPeer>,
        connects: Mutex<Vec<(RadioAddress, u8)>>,
        remotes: Mutex<Vec<DuplexStream>>,
    }

    #[async_trait]
    impl RadioPlatform for MockPlatform {
        async fn known_peers(&self) -> Vec<RadioPeer> {
            self.peers.clone()
        }

        async fn inquiry(&self, found: mpsc::Sender<RadioPeer>, _: CancellationToken) {
            for p in &self.peers {
                let _ = found.send(p.clone()).await;
            }
        }

        async fn connect(&self, address: RadioAddress, channel: u8) -> io::Result<Box<dyn ChannelIo>> {
            self.connects.lock().unwrap().push((address, channel));
            if channel == 9 {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "no listener"));
            }
            let (local, remote) = duplex(64);
            self.remotes.lock().unwrap().push(remote);
            Ok(Box::new(local))
        }

        fn virtual_port(&self, _: RadioAddress) -> Option<String> {
            Some("/dev/rfcomm0".into())
        }
    }

    const ADDR: RadioAddress = RadioAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

    fn link(platform: &Arc<MockPlatform>, major: MajorClass) -> RadioSocketLink {
        RadioSocketLink::new(platform.clone(), ADDR, ClassOfDevice::from_parts(major, 0, ServiceClasses::default()))
    }

    fn options() -> OpenOptions {
        OpenOptions {
            access: Default::default(),
            sharing: Default::default(),
            read_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn cache_round_trip_keeps_class() {
        let platform = Arc::new(MockPlatform::default());
        let cache = MemoryCache::new();
        let l = link(&platform, MajorClass::Computer);
        let mut entry = CacheEntry::new("Test");
        entry.success_count = 3;
        entry.failure_count = 1;
        entry.class = l.classification();
        l.write_cache(&cache, &entry).unwrap();
        assert_eq!(cache.keys("radio").unwrap(), vec!["AA:BB:CC:DD:EE:FF".to_string()]);

        let discovery = RadioDiscovery::new(platform);
        let stored = cache.get(&CacheKey::new("radio", "AA:BB:CC:DD:EE:FF")).unwrap().unwrap();
        let rebuilt = discovery.link_from_cache("AA:BB:CC:DD:EE:FF", &stored).unwrap();
        let read = rebuilt.read_cache(&cache).unwrap().unwrap();
        assert_eq!(read.name, "Test");
        assert_eq!((read.success_count, read.failure_count), (3, 1));
        assert_eq!(MajorClass::from_bits(read.class.major as u8), MajorClass::Computer);
        assert_eq!(rebuilt.classification(), l.classification());
    }

    #[test]
    fn precheck_excludes_computers_and_phones() {
        let platform = Arc::new(MockPlatform::default());
        let settings = Settings::default();
        let stats = Statistics::default();
        assert!(matches!(link(&platform, MajorClass::Computer).precheck(&stats, &settings), Err(SkipReason::ExcludedClass(_))));
        assert!(matches!(link(&platform, MajorClass::Phone).precheck(&stats, &settings), Err(SkipReason::ExcludedClass(_))));
        assert!(link(&platform, MajorClass::Peripheral).precheck(&stats, &settings).is_ok());
    }

    #[test]
    fn precheck_failure_threshold() {
        let platform = Arc::new(MockPlatform::default());
        let l = link(&platform, MajorClass::Uncategorized);
        let settings = Settings::default();
        let mut stats = Statistics { failure_count: 21, ..Statistics::default() };
        assert_eq!(l.precheck(&stats, &settings), Err(SkipReason::TooManyFailures { failures: 21, limit: 20 }));
        stats.failure_count = 20;
        assert!(l.precheck(&stats, &settings).is_ok());
        stats.failure_count = 50;
        stats.success_count = 1;
        assert!(l.precheck(&stats, &settings).is_ok());
    }

    #[test]
    fn success_resets_endpoint_failures() {
        let platform = Arc::new(MockPlatform::default());
        let l = link(&platform, MajorClass::Peripheral);
        let mut e = Endpoint::new(1, SERIAL_PORT_SERVICE);
        l.record_endpoint_outcome(&mut e, false);
        l.record_endpoint_outcome(&mut e, false);
        l.record_endpoint_outcome(&mut e, true);
        assert_eq!((e.success_count, e.failure_count), (1, 0));
    }

    #[tokio::test]
    async fn open_uses_endpoint_channel_or_default() {
        let platform = Arc::new(MockPlatform::default());
        let l = link(&platform, MajorClass::Peripheral);
        let mut ch = l.open_channel(None, &options()).await.unwrap();
        l.open_channel(Some(&Endpoint::new(4, SERIAL_PORT_SERVICE)), &options()).await.unwrap();
        assert_eq!(*platform.connects.lock().unwrap(), vec![(ADDR, 1), (ADDR, 4)]);

        let mut remote = platform.remotes.lock().unwrap().remove(0);
        remote.write_all(b"$GP").await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(ch.read(&mut buf).await.unwrap(), 3);
        assert_eq!(l.virtual_port().as_deref(), Some("/dev/rfcomm0"));
    }

    #[tokio::test]
    async fn open_maps_platform_errors() {
        let platform = Arc::new(MockPlatform::default());
        let l = link(&platform, MajorClass::Peripheral);
        let refused = l.open_channel(Some(&Endpoint::new(9, SERIAL_PORT_SERVICE)), &options()).await;
        assert!(matches!(refused, Err(ConnectionError::Refused(_))));
        let invalid = l.open_channel(Some(&Endpoint::new(300, SERIAL_PORT_SERVICE)), &options()).await;
        assert!(matches!(invalid, Err(ConnectionError::Unavailable(_))));
    }

    #[tokio::test]
    async fn known_peers_become_candidates_with_endpoints() {
        let peer = RadioPeer {
            address: ADDR,
            name: "Puck".into(),
            class: ClassOfDevice::from_parts(MajorClass::Uncategorized, 0, ServiceClasses(ServiceClasses::POSITIONING)),
            services: vec![
                RadioService { channel: 1, name: Some("SPP".into()), service_id: SERIAL_PORT_SERVICE.into() },
                RadioService { channel: 3, name: None, service_id: SERIAL_PORT_SERVICE.into() },
            ],
        };
        let discovery = RadioDiscovery::new(Arc::new(MockPlatform { peers: vec![peer], ..Default::default() }));
        let found = discovery.known_peers().await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Puck");
        assert_eq!(found[0].link.address(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(found[0].endpoints.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(found[0].endpoints[0].name.as_deref(), Some("SPP"));

        let (tx, mut rx) = mpsc::channel(4);
        discovery.scan(tx, CancellationToken::new()).await;
        assert_eq!(rx.recv().await.unwrap().name, "Puck");
    }

    /// Accepts every channel it is shown.
    #[derive(Default)]
    struct Accepting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProtocolValidator for Accepting {
        async fn is_valid(&self, _: &mut Channel, _: Instant) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            true
        }

        async fn inspect(&self, _: &mut Channel, _: usize, _: Instant) -> TestReport {
            TestReport::default()
        }
    }

    struct Rig {
        platform: Arc<MockPlatform>,
        cache: Arc<MemoryCache>,
        validator: Arc<Accepting>,
        ctx: DeviceContext,
    }

    fn rig() -> Rig {
        let platform = Arc::new(MockPlatform::default());
        let cache = Arc::new(MemoryCache::new());
        let validator = Arc::new(Accepting::default());
        let ctx = DeviceContext {
            cache: cache.clone(),
            registry: Arc::new(Registry::default()),
            validator: validator.clone(),
            settings: Settings::default(),
        };
        Rig { platform, cache, validator, ctx }
    }

    fn radio_key() -> CacheKey {
        CacheKey::new("radio", "AA:BB:CC:DD:EE:FF")
    }

    fn services(channels: &[u32]) -> Vec<Endpoint> {
        channels.iter().map(|c| Endpoint::new(*c, SERIAL_PORT_SERVICE)).collect()
    }

    async fn detect(device: &Device) -> bool {
        device.begin_detection().await.unwrap();
        device.wait_for_detection(Some(Duration::from_secs(5))).await
    }

    #[tokio::test]
    async fn phones_are_skipped_without_connecting() {
        let r = rig();
        let device = Device::new(Arc::new(link(&r.platform, MajorClass::Phone)), "Handset", services(&[1]), r.ctx.clone());

        assert!(!detect(&device).await);

        assert!(r.platform.connects.lock().unwrap().is_empty());
        assert_eq!(r.validator.calls.load(Ordering::SeqCst), 0);
        assert_eq!(device.statistics(), Statistics::default());
        assert_eq!(device.detection_state(), DetectionState::Unknown);
    }

    #[tokio::test]
    async fn cached_failure_streak_skips_detection() {
        let r = rig();
        let mut entry = CacheEntry::new("Flaky");
        entry.failure_count = 21;
        r.cache.put(&radio_key(), &entry).unwrap();
        let device = Device::new(Arc::new(link(&r.platform, MajorClass::Uncategorized)), "", services(&[1]), r.ctx.clone());

        assert!(!detect(&device).await);

        assert!(r.platform.connects.lock().unwrap().is_empty());
        assert_eq!(r.validator.calls.load(Ordering::SeqCst), 0);
        assert_eq!(device.statistics().failure_count, 21);
    }

    #[tokio::test]
    async fn dead_service_gives_way_to_a_working_one() {
        let r = rig();
        let device =
            Device::new(Arc::new(link(&r.platform, MajorClass::Uncategorized)), "Puck", services(&[9, 1]), r.ctx.clone());

        assert!(!detect(&device).await);
        assert!(detect(&device).await);

        assert_eq!(*r.platform.connects.lock().unwrap(), vec![(ADDR, 9), (ADDR, 1)]);
        let endpoints = device.endpoints();
        assert_eq!((endpoints[0].success_count, endpoints[0].failure_count), (0, 1));
        assert_eq!((endpoints[1].success_count, endpoints[1].failure_count), (1, 0));
        let stats = device.statistics();
        assert_eq!((stats.success_count, stats.failure_count), (1, 0));
        assert_eq!(device.current_endpoint().map(|e| e.id), Some(1));
    }

    #[tokio::test]
    async fn confirmation_clears_the_service_failure_streak() {
        let r = rig();
        let mut entry = CacheEntry::new("Puck");
        entry.failure_count = 2;
        entry.endpoints = vec![EndpointRecord {
            id: 1,
            name: None,
            service_id: SERIAL_PORT_SERVICE.into(),
            success_count: 0,
            failure_count: 2,
        }];
        r.cache.put(&radio_key(), &entry).unwrap();
        let device = Device::new(Arc::new(link(&r.platform, MajorClass::Uncategorized)), "", services(&[1]), r.ctx.clone());
        assert_eq!(device.endpoints()[0].failure_count, 2);

        assert!(detect(&device).await);

        assert_eq!((device.endpoints()[0].success_count, device.endpoints()[0].failure_count), (1, 0));
        let stored = r.cache.get(&radio_key()).unwrap().unwrap();
        assert_eq!((stored.success_count, stored.failure_count), (1, 0));
        assert_eq!((stored.endpoints[0].success_count, stored.endpoints[0].failure_count), (1, 0));
    }

    #[tokio::test]
    async fn cached_entry_rehydrates_a_device() {
        let r = rig();
        let l = link(&r.platform, MajorClass::Computer);
        let mut entry = CacheEntry::new("Test");
        entry.success_count = 3;
        entry.failure_count = 1;
        entry.class = l.classification();
        l.write_cache(r.cache.as_ref(), &entry).unwrap();

        let discovery = RadioDiscovery::new(r.platform.clone());
        let stored = r.cache.get(&radio_key()).unwrap().unwrap();
        let rebuilt = discovery.link_from_cache("AA:BB:CC:DD:EE:FF", &stored).unwrap();
        let device = Device::from_cache(rebuilt, stored, r.ctx.clone());

        assert_eq!(device.name(), "Test");
        assert_eq!(device.address(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(device.key(), &radio_key());
        let stats = device.statistics();
        assert_eq!((stats.success_count, stats.failure_count), (3, 1));
        assert_eq!(stats, entry.statistics());
        let class = device.link().classification();
        assert_eq!(class, l.classification());
        assert_eq!(MajorClass::from_bits(class.major as u8), MajorClass::Computer);
    }
}
