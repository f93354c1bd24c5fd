// ── Discovery coordination ──
//
// One coordinator per transport kind. A discovery request merges cache-known
// devices with the platform's own list (cache identity wins on address
// collisions) and ranks the result. An optional live scan runs as a background
// task, bounded by the discovery timeout, announcing each new peer as it appears.
// Both the merge and the live scan are single-flight.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheKey};
use crate::device::{rank_devices, Device, DeviceContext};
use crate::error::CacheError;
use crate::link::{DeviceLink, TransportKind};
use crate::stats::Endpoint;

const SCAN_STOP_GRACE: Duration = Duration::from_secs(1);
const SCAN_CHANNEL_SIZE: usize = 16;
const EVENT_CHANNEL_SIZE: usize = 64;

/// A peer reported by the platform, not yet wrapped in a [`Device`].
#[derive(Debug, Clone)]
pub struct Candidate {
    pub link: Arc<dyn DeviceLink>,
    pub name: String,
    pub endpoints: Vec<Endpoint>,
}

/// Transport-specific half of discovery.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Rebuilds the link for a device found in the cache.
    fn link_from_cache(&self, address: &str, entry: &CacheEntry) -> Option<Arc<dyn DeviceLink>>;

    /// Peers the platform already knows (paired, configured, remembered).
    async fn known_peers(&self) -> Vec<Candidate>;

    /// Live scan. Sends peers as they are observed; returns when done or cancelled.
    async fn scan(&self, found: mpsc::Sender<Candidate>, cancel: CancellationToken);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoverOptions {
    /// Ignore the persisted cache for this pass.
    pub flush: bool,
    /// Also start a background live scan.
    pub live_scan: bool,
}

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    DeviceDiscovered(Device),
    ScanFinished { discovered: usize },
}

#[derive(Clone)]
pub struct DiscoveryCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    source: Arc<dyn DiscoverySource>,
    ctx: DeviceContext,
    state: Mutex<CoordinatorState>,
    events: broadcast::Sender<DiscoveryEvent>,
}

#[derive(Default)]
struct CoordinatorState {
    merging: bool,
    known: Vec<Device>,
    live: Option<LiveScan>,
}

struct LiveScan {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
    handle: JoinHandle<()>,
}

struct MergeGuard<'a>(&'a CoordinatorInner);

impl Drop for MergeGuard<'_> {
    fn drop(&mut self) {
        lock(&self.0.state).merging = false;
    }
}

struct ScanFinished(watch::Sender<bool>);

impl Drop for ScanFinished {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl DiscoveryCoordinator {
    pub fn new(source: Arc<dyn DiscoverySource>, ctx: DeviceContext) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            inner: Arc::new(CoordinatorInner {
                source,
                ctx,
                state: Mutex::new(CoordinatorState::default()),
                events,
            }),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.inner.source.kind()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.inner.events.subscribe()
    }

    /// Every device this coordinator has produced so far, best first.
    pub fn known_devices(&self) -> Vec<Device> {
        let mut devices = lock(&self.inner.state).known.clone();
        rank_devices(&mut devices);
        devices
    }

    pub fn find(&self, address: &str) -> Option<Device> {
        lock(&self.inner.state).known.iter().find(|d| d.address() == address).cloned()
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.inner.state).live.as_ref().is_some_and(|l| !*l.done.borrow())
    }

    /// Produces the ranked candidate list. Returns `None` when another merge for
    /// this transport is already running.
    pub async fn discover_devices(&self, options: DiscoverOptions) -> Option<Vec<Device>> {
        {
            let mut st = lock(&self.inner.state);
            if st.merging {
                debug!(transport = %self.kind(), "discovery already running");
                return None;
            }
            st.merging = true;
        }
        let _merging = MergeGuard(&self.inner);

        let mut devices = if options.flush { Vec::new() } else { self.load_cached() };
        let cached = devices.len();

        for candidate in self.inner.source.known_peers().await {
            let address = candidate.link.address();
            if devices.iter().any(|d| d.address() == address) {
                debug!(transport = %self.kind(), %address, "platform peer already known from cache");
                continue;
            }
            let device = match self.find(&address) {
                Some(existing) => existing,
                None if options.flush => {
                    Device::uncached(candidate.link, candidate.name, candidate.endpoints, self.inner.ctx.clone())
                }
                None => Device::new(candidate.link, candidate.name, candidate.endpoints, self.inner.ctx.clone()),
            };
            devices.push(device);
        }

        {
            let mut st = lock(&self.inner.state);
            // Keep instances the live scan may have added meanwhile.
            for device in &mut devices {
                if let Some(existing) = st.known.iter().find(|k| k.address() == device.address()) {
                    *device = existing.clone();
                }
            }
            for device in &devices {
                if !st.known.iter().any(|k| k.is_same(device)) {
                    st.known.push(device.clone());
                }
            }
        }
        rank_devices(&mut devices);
        info!(transport = %self.kind(), cached, total = devices.len(), "discovery merged");

        if options.live_scan {
            self.start_live_scan().await;
        }
        Some(devices)
    }

    fn load_cached(&self) -> Vec<Device> {
        let root = self.kind().as_str();
        let cache = self.inner.ctx.cache.as_ref();
        let keys = match cache.keys(root) {
            Ok(keys) => keys,
            Err(e) => {
                log_cache_error(root, &e);
                return Vec::new();
            }
        };
        let mut devices = Vec::with_capacity(keys.len());
        for address in keys {
            if let Some(existing) = self.find(&address) {
                devices.push(existing);
                continue;
            }
            let entry = match cache.get(&CacheKey::new(root, address.as_str())) {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    log_cache_error(root, &e);
                    continue;
                }
            };
            match self.inner.source.link_from_cache(&address, &entry) {
                Some(link) => devices.push(Device::from_cache(link, entry, self.inner.ctx.clone())),
                None => warn!(transport = %self.kind(), %address, "cached device could not be rebuilt"),
            }
        }
        devices
    }

    /// Wraps a freshly observed peer unless its address is already known.
    fn admit(&self, candidate: Candidate) -> Option<Device> {
        let address = candidate.link.address();
        let device = {
            let mut st = lock(&self.inner.state);
            if st.known.iter().any(|d| d.address() == address) {
                return None;
            }
            let device = Device::new(candidate.link, candidate.name, candidate.endpoints, self.inner.ctx.clone());
            st.known.push(device.clone());
            device
        };
        info!(transport = %self.kind(), %address, name = %device.name(), "device discovered");
        let _ = self.inner.events.send(DiscoveryEvent::DeviceDiscovered(device.clone()));
        Some(device)
    }

    /// Starts the live scan unless one is running. Returns once it has started.
    pub async fn start_live_scan(&self) -> bool {
        let started = {
            let mut st = lock(&self.inner.state);
            if st.live.as_ref().is_some_and(|l| !*l.done.borrow()) {
                return false;
            }
            let cancel = CancellationToken::new();
            let (done_tx, done_rx) = watch::channel(false);
            let (started_tx, started_rx) = oneshot::channel();
            let handle = tokio::spawn(live_scan_task(self.clone(), cancel.clone(), started_tx, done_tx));
            st.live = Some(LiveScan { cancel, done: done_rx, handle });
            started_rx
        };
        let _ = started.await;
        true
    }

    /// True once no live scan is in flight; false if `limit` elapsed first.
    pub async fn wait_for_discovery(&self, limit: Option<Duration>) -> bool {
        let done = lock(&self.inner.state).live.as_ref().map(|l| l.done.clone());
        let Some(mut done) = done else {
            return true;
        };
        let limit = limit.unwrap_or_else(|| self.inner.ctx.settings.discovery_timeout() + SCAN_STOP_GRACE);
        let waited = timeout(limit, done.wait_for(|d| *d)).await;
        waited.is_ok()
    }

    pub async fn cancel_discovery(&self) {
        let live = lock(&self.inner.state).live.take();
        let Some(live) = live else { return };
        live.cancel.cancel();
        let mut handle = live.handle;
        if timeout(SCAN_STOP_GRACE * 2, &mut handle).await.is_err() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

async fn live_scan_task(
    coordinator: DiscoveryCoordinator,
    cancel: CancellationToken,
    started: oneshot::Sender<()>,
    done: watch::Sender<bool>,
) {
    let _finished = ScanFinished(done);
    let _ = started.send(());
    let limit = coordinator.inner.ctx.settings.discovery_timeout();
    let transport = coordinator.kind();
    debug!(%transport, ?limit, "live scan started");

    let (tx, mut rx) = mpsc::channel(SCAN_CHANNEL_SIZE);
    let scan_cancel = cancel.child_token();
    let mut scanner = tokio::spawn({
        let source = Arc::clone(&coordinator.inner.source);
        let scan_cancel = scan_cancel.clone();
        async move { source.scan(tx, scan_cancel).await }
    });

    let deadline = sleep(limit);
    tokio::pin!(deadline);
    let mut discovered = 0usize;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = &mut deadline => break,
            found = rx.recv() => match found {
                Some(candidate) => {
                    if coordinator.admit(candidate).is_some() {
                        discovered += 1;
                    }
                }
                None => break,
            },
        }
    }

    scan_cancel.cancel();
    if timeout(SCAN_STOP_GRACE, &mut scanner).await.is_err() {
        scanner.abort();
    }
    info!(%transport, discovered, "live scan finished");
    let _ = coordinator.inner.events.send(DiscoveryEvent::ScanFinished { discovered });
}

fn log_cache_error(root: &str, err: &CacheError) {
    match err {
        CacheError::AccessDenied(_) => debug!(root, error = %err, "cache not accessible; treating as empty"),
        _ => warn!(root, error = %err, "cache read failed"),
    }
}
