// ── Device lifecycle ──
//
// A `Device` is a cheap handle (`Arc<DeviceInner>`) over one candidate receiver.
// Two axes of state live behind it:
//
//   connection:  Closed -> Connecting -> Open -> Closed
//   detection:   Unknown -> Detecting -> Confirmed | Rejected
//
// The channel slot is an async mutex so open/close/validate never interleave for
// one device. Flags and statistics sit behind a plain mutex that is never held
// across an await. Only the device's own detection task mutates statistics, and at
// most one such task exists at a time.

use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheKey, DeviceCache};
use crate::channel::{Channel, ChannelAccess, ChannelSharing, OpenOptions};
use crate::config::Settings;
use crate::error::{CacheError, ConnectionError, DetectionFailure, DeviceError};
use crate::link::{DeviceLink, SkipReason, TransportKind};
use crate::registry::DeviceRegistry;
use crate::stats::{Endpoint, Statistics};
use crate::validator::{ProtocolValidator, TestReport};

/// How long a cancelled detection may take to unwind before it is aborted.
const CANCEL_GRACE: Duration = Duration::from_secs(2);
const EVENT_CHANNEL_SIZE: usize = 32;

/// Units read by [`Device::test`] when the caller has no preference.
pub const DEFAULT_TEST_UNITS: usize = 20;

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Connecting(CacheKey),
    Connected(CacheKey),
    Disconnecting(CacheKey),
    Disconnected(CacheKey),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionState {
    Unknown,
    Detecting,
    Confirmed,
    Rejected,
}

/// Collaborators handed to every device at construction.
#[derive(Clone)]
pub struct DeviceContext {
    pub cache: Arc<dyn DeviceCache>,
    pub registry: Arc<dyn DeviceRegistry>,
    pub validator: Arc<dyn ProtocolValidator>,
    pub settings: Settings,
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext").field("settings", &self.settings).finish_non_exhaustive()
    }
}

/// Serializable view of a device at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub kind: TransportKind,
    pub address: String,
    pub name: String,
    pub open: bool,
    pub state: DetectionState,
    pub reliability: f64,
    pub statistics: Statistics,
    pub endpoints: Vec<Endpoint>,
    pub current_endpoint: Option<u32>,
    pub virtual_port: Option<String>,
}

#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    link: Arc<dyn DeviceLink>,
    ctx: DeviceContext,
    key: CacheKey,
    state: Mutex<DeviceState>,
    channel: tokio::sync::Mutex<Option<Channel>>,
    detection: Mutex<Option<DetectionTask>>,
    events: broadcast::Sender<DeviceEvent>,
}

struct DeviceState {
    name: String,
    allow_connections: bool,
    open: bool,
    detecting: bool,
    detection_completed: bool,
    confirmed: bool,
    stats: Statistics,
    endpoints: Vec<Endpoint>,
    current_endpoint: Option<usize>,
    /// Set while the channel is open because a detection task opened it.
    opened_by_detection: bool,
    /// When and how long the running detection's open took; folded in with its outcome.
    pending_connect: Option<(OffsetDateTime, Duration)>,
    disposed: bool,
}

struct DetectionTask {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
    handle: JoinHandle<()>,
}

enum Outcome {
    AlreadyConfirmed,
    Confirmed,
    Failed(DetectionFailure),
    Skipped(SkipReason),
    Cancelled,
}

/// Marks the detection finished even when the task is aborted mid-flight.
struct FinishedGuard {
    device: Device,
    done: watch::Sender<bool>,
}

impl Drop for FinishedGuard {
    fn drop(&mut self) {
        self.device.state().detecting = false;
        self.done.send_replace(true);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // State mutations are single assignments; a poisoned guard still holds a coherent value.
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device").field("key", &self.inner.key).field("name", &self.name()).finish_non_exhaustive()
    }
}

impl Device {
    /// Builds a device and rehydrates its history from the cache, if any.
    pub fn new(link: Arc<dyn DeviceLink>, name: impl Into<String>, endpoints: Vec<Endpoint>, ctx: DeviceContext) -> Self {
        let cached = match link.read_cache(ctx.cache.as_ref()) {
            Ok(entry) => entry,
            Err(e) => {
                log_cache_error(&link.cache_key(), "read", &e);
                None
            }
        };
        let device = Self::uncached(link, name, endpoints, ctx);
        if let Some(entry) = cached {
            device.apply_entry(entry);
        }
        device
    }

    /// Builds a device from an entry the caller already read.
    pub fn from_cache(link: Arc<dyn DeviceLink>, entry: CacheEntry, ctx: DeviceContext) -> Self {
        let device = Self::uncached(link, String::new(), Vec::new(), ctx);
        device.apply_entry(entry);
        device
    }

    /// Builds a device with empty history, ignoring anything cached.
    pub fn uncached(link: Arc<dyn DeviceLink>, name: impl Into<String>, endpoints: Vec<Endpoint>, ctx: DeviceContext) -> Self {
        let key = link.cache_key();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let state = DeviceState {
            name: name.into(),
            allow_connections: true,
            open: false,
            detecting: false,
            detection_completed: false,
            confirmed: false,
            stats: Statistics::default(),
            endpoints,
            current_endpoint: None,
            opened_by_detection: false,
            pending_connect: None,
            disposed: false,
        };
        Self {
            inner: Arc::new(DeviceInner {
                link,
                ctx,
                key,
                state: Mutex::new(state),
                channel: tokio::sync::Mutex::new(None),
                detection: Mutex::new(None),
                events,
            }),
        }
    }

    fn apply_entry(&self, entry: CacheEntry) {
        let stats = entry.statistics();
        let mut st = self.state();
        if st.name.is_empty() {
            st.name = entry.name;
        }
        st.stats = stats;
        for record in entry.endpoints {
            match st.endpoints.iter_mut().find(|e| e.id == record.id) {
                Some(existing) => {
                    existing.success_count = record.success_count;
                    existing.failure_count = record.failure_count;
                    if existing.name.is_none() {
                        existing.name = record.name;
                    }
                }
                None => st.endpoints.push(record.into()),
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        lock(&self.inner.state)
    }

    fn emit(&self, event: DeviceEvent) {
        let _ = self.inner.events.send(event);
    }

    fn ensure_live(&self) -> Result<(), DeviceError> {
        if self.state().disposed {
            return Err(DeviceError::Disposed(self.inner.key.to_string()));
        }
        Ok(())
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn key(&self) -> &CacheKey { &self.inner.key }
    pub fn kind(&self) -> TransportKind { self.inner.link.kind() }
    pub fn address(&self) -> String { self.inner.link.address() }
    pub fn link(&self) -> &Arc<dyn DeviceLink> { &self.inner.link }
    pub fn settings(&self) -> &Settings { &self.inner.ctx.settings }
    pub fn name(&self) -> String { self.state().name.clone() }
    pub fn is_open(&self) -> bool { self.state().open }
    pub fn is_confirmed(&self) -> bool { self.state().confirmed }
    pub fn is_detection_completed(&self) -> bool { self.state().detection_completed }
    pub fn is_disposed(&self) -> bool { self.state().disposed }
    pub fn allows_connections(&self) -> bool { self.state().allow_connections }
    pub fn statistics(&self) -> Statistics { self.state().stats.clone() }
    pub fn reliability(&self) -> f64 { self.state().stats.reliability() }
    pub fn endpoints(&self) -> Vec<Endpoint> { self.state().endpoints.clone() }
    pub fn virtual_port(&self) -> Option<String> { self.inner.link.virtual_port() }

    pub fn set_name(&self, name: impl Into<String>) {
        self.state().name = name.into();
    }

    pub fn set_allow_connections(&self, allow: bool) {
        self.state().allow_connections = allow;
    }

    pub fn current_endpoint(&self) -> Option<Endpoint> {
        let st = self.state();
        st.current_endpoint.and_then(|i| st.endpoints.get(i).cloned())
    }

    /// Chooses the endpoint manual opens connect to; detections re-pick by endpoint history.
    /// Returns false for an unknown id.
    pub fn select_endpoint(&self, id: u32) -> bool {
        let mut st = self.state();
        match st.endpoints.iter().position(|e| e.id == id) {
            Some(i) => {
                st.current_endpoint = Some(i);
                true
            }
            None => false,
        }
    }

    /// Adds endpoints not already known by id.
    pub fn merge_endpoints(&self, endpoints: impl IntoIterator<Item = Endpoint>) {
        let mut st = self.state();
        for endpoint in endpoints {
            if !st.endpoints.iter().any(|e| e.id == endpoint.id) {
                st.endpoints.push(endpoint);
            }
        }
    }

    pub fn detection_state(&self) -> DetectionState {
        let st = self.state();
        if st.detecting {
            DetectionState::Detecting
        } else if st.confirmed {
            DetectionState::Confirmed
        } else if st.detection_completed {
            DetectionState::Rejected
        } else {
            DetectionState::Unknown
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_same(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Ranking order: most reliable first, then fastest average connect.
    pub fn best_first(&self, other: &Device) -> Ordering {
        if self.is_same(other) {
            return Ordering::Equal;
        }
        self.statistics().best_first(&other.statistics())
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let state = self.detection_state();
        let st = self.state();
        DeviceSnapshot {
            kind: self.inner.link.kind(),
            address: self.inner.link.address(),
            name: st.name.clone(),
            open: st.open,
            state,
            reliability: st.stats.reliability(),
            statistics: st.stats.clone(),
            endpoints: st.endpoints.clone(),
            current_endpoint: st.current_endpoint.and_then(|i| st.endpoints.get(i)).map(|e| e.id),
            virtual_port: self.inner.link.virtual_port(),
        }
    }

    /// Lock on the channel slot; `None` inside means closed.
    pub async fn channel(&self) -> tokio::sync::MutexGuard<'_, Option<Channel>> {
        self.inner.channel.lock().await
    }

    // ── Connection axis ──────────────────────────────────────────────

    pub async fn open(&self, access: ChannelAccess, sharing: ChannelSharing) -> Result<(), DeviceError> {
        self.ensure_live()?;
        let mut slot = self.inner.channel.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        self.open_locked(&mut slot, access, sharing, false).await
    }

    async fn open_locked(
        &self,
        slot: &mut Option<Channel>,
        access: ChannelAccess,
        sharing: ChannelSharing,
        by_detection: bool,
    ) -> Result<(), DeviceError> {
        let (allowed, endpoint) = {
            let mut st = self.state();
            if by_detection || st.current_endpoint.is_none() {
                st.current_endpoint = self.inner.link.preferred_endpoint(&st.endpoints);
            }
            let endpoint = st.current_endpoint.and_then(|i| st.endpoints.get(i).cloned());
            (st.allow_connections, endpoint)
        };
        if !allowed || !self.inner.ctx.registry.allow_connections_for(self.kind()) {
            return Err(ConnectionError::NotAllowed.into());
        }

        self.emit(DeviceEvent::Connecting(self.inner.key.clone()));
        let settings = &self.inner.ctx.settings;
        let options = OpenOptions {
            access,
            sharing,
            read_timeout: settings.read_timeout(),
            write_timeout: settings.write_timeout(),
        };
        let started = Instant::now();
        match self.inner.link.open_channel(endpoint.as_ref(), &options).await {
            Ok(channel) => {
                *slot = Some(channel);
                {
                    let mut st = self.state();
                    st.open = true;
                    st.opened_by_detection = by_detection;
                    let connected = (OffsetDateTime::now_utc(), started.elapsed());
                    if by_detection {
                        st.pending_connect = Some(connected);
                    } else {
                        st.stats.record_connected(connected.0);
                    }
                }
                debug!(device = %self.inner.key, endpoint = ?endpoint.map(|e| e.id), "channel open");
                self.emit(DeviceEvent::Connected(self.inner.key.clone()));
                Ok(())
            }
            Err(e) => {
                debug!(device = %self.inner.key, error = %e, "channel open failed");
                self.emit(DeviceEvent::Disconnected(self.inner.key.clone()));
                Err(e.into())
            }
        }
    }

    pub async fn close(&self) {
        let mut slot = self.inner.channel.lock().await;
        self.close_locked(&mut slot).await;
    }

    async fn close_locked(&self, slot: &mut Option<Channel>) {
        let Some(channel) = slot.take() else {
            self.state().open = false;
            return;
        };
        self.emit(DeviceEvent::Disconnecting(self.inner.key.clone()));
        if let Err(e) = channel.shutdown().await {
            debug!(device = %self.inner.key, error = %e, "channel was already unusable at close");
        }
        {
            let mut st = self.state();
            st.open = false;
            st.opened_by_detection = false;
        }
        self.emit(DeviceEvent::Disconnected(self.inner.key.clone()));
    }

    /// Forgets the channel without a protocol-level close. Never waits.
    ///
    /// For channels the platform already tore down (sleep/resume); a normal close
    /// could hang on them.
    pub fn reset(&self) {
        {
            let mut st = self.state();
            st.open = false;
            st.opened_by_detection = false;
        }
        match self.inner.channel.try_lock() {
            Ok(mut slot) => drop(slot.take()),
            Err(_) => {
                // Someone is mid-operation on the channel; drop it once they let go.
                if let Ok(rt) = tokio::runtime::Handle::try_current() {
                    let device = self.clone();
                    rt.spawn(async move {
                        let mut slot = device.inner.channel.lock().await;
                        if !device.is_open() {
                            drop(slot.take());
                        }
                    });
                }
            }
        }
        info!(device = %self.inner.key, "channel reset");
        self.emit(DeviceEvent::Disconnected(self.inner.key.clone()));
    }

    // ── Detection axis ───────────────────────────────────────────────

    /// Starts detection in the background and returns once the task is running.
    /// A second call while one is in flight returns immediately.
    pub async fn begin_detection(&self) -> Result<(), DeviceError> {
        self.ensure_live()?;
        let started = {
            let mut slot = lock(&self.inner.detection);
            if slot.as_ref().is_some_and(|t| !*t.done.borrow()) {
                return Ok(());
            }
            let cancel = CancellationToken::new();
            let (done_tx, done_rx) = watch::channel(false);
            let (started_tx, started_rx) = oneshot::channel();
            self.state().detecting = true;
            let handle = tokio::spawn(detection_task(self.clone(), cancel.clone(), started_tx, done_tx));
            *slot = Some(DetectionTask { cancel, done: done_rx, handle });
            started_rx
        };
        let _ = started.await;
        Ok(())
    }

    /// True once the running detection has confirmed the device.
    ///
    /// `None` waits for the registry's detection timeout. Returns false on timeout
    /// and when no detection was ever started.
    pub async fn wait_for_detection(&self, limit: Option<Duration>) -> bool {
        let done = lock(&self.inner.detection).as_ref().map(|t| t.done.clone());
        let Some(mut done) = done else {
            return false;
        };
        let limit = limit.unwrap_or_else(|| self.inner.ctx.registry.detection_timeout());
        let finished = matches!(timeout(limit, done.wait_for(|d| *d)).await, Ok(_));
        finished && self.is_confirmed()
    }

    /// Stops an in-flight detection and closes any channel it opened.
    pub async fn cancel_detection(&self) {
        let task = {
            let mut slot = lock(&self.inner.detection);
            match slot.as_ref() {
                Some(t) if !*t.done.borrow() => slot.take(),
                _ => None,
            }
        };
        if let Some(task) = task {
            task.cancel.cancel();
            let mut handle = task.handle;
            if timeout(CANCEL_GRACE, &mut handle).await.is_err() {
                warn!(device = %self.inner.key, "detection ignored cancellation; aborting");
                handle.abort();
                let _ = handle.await;
            }
        }
        let opened_here = {
            let mut st = self.state();
            st.pending_connect = None;
            std::mem::take(&mut st.opened_by_detection)
        };
        if opened_here {
            self.close().await;
        }
    }

    /// Forgets everything learned about this device, including its cache entry.
    pub async fn undetect(&self) -> Result<(), DeviceError> {
        self.ensure_live()?;
        self.cancel_detection().await;
        if let Err(e) = self.inner.link.remove_cache(self.inner.ctx.cache.as_ref()) {
            log_cache_error(&self.inner.key, "delete", &e);
        }
        {
            let mut st = self.state();
            st.stats = Statistics::default();
            st.pending_connect = None;
            st.confirmed = false;
            st.detection_completed = false;
            for endpoint in &mut st.endpoints {
                endpoint.success_count = 0;
                endpoint.failure_count = 0;
            }
        }
        lock(&self.inner.detection).take();
        info!(device = %self.inner.key, "device history cleared");
        Ok(())
    }

    /// Diagnostic read: which kinds of data does this receiver produce?
    /// The channel is closed afterwards whether or not it was open before.
    pub async fn test(&self, max_units: usize) -> Result<TestReport, DeviceError> {
        self.ensure_live()?;
        let mut slot = self.inner.channel.lock().await;
        if slot.is_none() {
            self.open_locked(&mut slot, ChannelAccess::ReadWrite, ChannelSharing::Exclusive, false).await?;
        }
        let deadline = Instant::now() + self.inner.ctx.registry.detection_timeout();
        let report = match slot.as_mut() {
            Some(channel) => self.inner.ctx.validator.inspect(channel, max_units, deadline).await,
            None => return Err(DeviceError::NotOpen),
        };
        self.close_locked(&mut slot).await;
        Ok(report)
    }

    /// Releases everything the device holds. Later operations fail with `Disposed`.
    pub async fn dispose(&self) {
        if std::mem::replace(&mut self.state().disposed, true) {
            return;
        }
        self.cancel_detection().await;
        self.close().await;
        lock(&self.inner.detection).take();
        debug!(device = %self.inner.key, "disposed");
    }

    async fn run_detection(&self) -> Outcome {
        if self.is_confirmed() {
            return Outcome::AlreadyConfirmed;
        }
        let stats = self.statistics();
        if let Err(reason) = self.inner.link.precheck(&stats, &self.inner.ctx.settings) {
            return Outcome::Skipped(reason);
        }
        self.inner.ctx.registry.on_detection_attempted(self);

        let mut slot = self.inner.channel.lock().await;
        self.state().pending_connect = None;
        if slot.is_none() {
            if let Err(e) = self.open_locked(&mut slot, ChannelAccess::ReadWrite, ChannelSharing::Shared, true).await {
                return Outcome::Failed(DetectionFailure::Connection(e.to_string()));
            }
        }
        let Some(channel) = slot.as_mut() else {
            return Outcome::Failed(DetectionFailure::Connection("channel closed during detection".into()));
        };
        let deadline = Instant::now() + self.inner.ctx.registry.detection_timeout();
        if self.inner.ctx.validator.is_valid(channel, deadline).await {
            Outcome::Confirmed
        } else {
            Outcome::Failed(DetectionFailure::ProtocolMismatch)
        }
    }

    async fn finish_detection(&self, outcome: Outcome) {
        let registry = &self.inner.ctx.registry;
        match &outcome {
            Outcome::AlreadyConfirmed => registry.add(self),
            Outcome::Confirmed => {
                self.apply_outcome(true);
                self.persist();
                info!(device = %self.inner.key, "receiver confirmed");
                registry.add(self);
            }
            Outcome::Failed(reason) => {
                self.apply_outcome(false);
                self.persist();
                debug!(device = %self.inner.key, %reason, "detection failed");
                registry.on_detection_failed(self, reason);
            }
            Outcome::Skipped(reason) => debug!(device = %self.inner.key, %reason, "detection skipped"),
            Outcome::Cancelled => {
                self.state().pending_connect = None;
                debug!(device = %self.inner.key, "detection cancelled");
            }
        }

        let opened_here = std::mem::take(&mut self.state().opened_by_detection);
        if opened_here && (matches!(outcome, Outcome::Cancelled) || !registry.is_channel_still_needed(self)) {
            self.close().await;
        }
    }

    /// Applies one outcome to the counters under a single lock.
    fn apply_outcome(&self, confirmed: bool) {
        let mut guard = self.state();
        let st = &mut *guard;
        let connect = st.pending_connect.take();
        if let Some((at, _)) = connect {
            st.stats.record_connected(at);
        }
        let now = OffsetDateTime::now_utc();
        match (confirmed, connect) {
            (true, Some((_, took))) => st.stats.record_success_after_connect(now, took),
            (true, None) => st.stats.record_success(now),
            (false, _) => st.stats.record_failure(),
        }
        st.confirmed = confirmed;
        st.detection_completed = true;
        if let Some(endpoint) = st.current_endpoint.and_then(|i| st.endpoints.get_mut(i)) {
            self.inner.link.record_endpoint_outcome(endpoint, confirmed);
        }
    }

    fn persist(&self) {
        let entry = {
            let st = self.state();
            CacheEntry::from_parts(st.name.clone(), &st.stats, self.inner.link.classification(), &st.endpoints)
        };
        if let Err(e) = self.inner.link.write_cache(self.inner.ctx.cache.as_ref(), &entry) {
            log_cache_error(&self.inner.key, "write", &e);
        }
    }
}

async fn detection_task(
    device: Device,
    cancel: CancellationToken,
    started: oneshot::Sender<()>,
    done: watch::Sender<bool>,
) {
    let _finished = FinishedGuard { device: device.clone(), done };
    let _ = started.send(());
    let outcome = tokio::select! {
        biased;
        () = cancel.cancelled() => Outcome::Cancelled,
        outcome = device.run_detection() => outcome,
    };
    device.finish_detection(outcome).await;
}

/// Sorts best candidates first.
pub fn rank_devices(devices: &mut [Device]) {
    devices.sort_by(Device::best_first);
}

fn log_cache_error(key: &CacheKey, op: &'static str, err: &CacheError) {
    match err {
        CacheError::AccessDenied(_) => debug!(device = %key, op, error = %err, "cache not accessible; continuing without it"),
        _ => warn!(device = %key, op, error = %err, "cache operation failed"),
    }
}
