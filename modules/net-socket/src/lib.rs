//! TCP transport for receivers that stream sentences over IP, with a paced
//! connect sweep for finding them.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use gpslink_core::{
    CacheEntry, Candidate, Channel, ConnectionError, DeviceLink, DiscoverySource, Endpoint, OpenOptions, RateLimiter,
    TransportKind,
};
use ipnet::IpNet;
use rand::{thread_rng, Rng};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Registered port for sentence streams over TCP.
pub const DEFAULT_PORT: u16 = 10110;
pub const SERVICE_ID: &str = "tcp";

/// Parse a comma-separated list of ports/ranges (e.g., "10110,2947", "5000-5005").
pub fn parse_ports(spec: &str) -> Result<Vec<u16>> {
    let mut ports = Vec::new();
    for part in spec.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if let Some((start, end)) = part.split_once('-') {
            let s: u16 = start.trim().parse()?;
            let e: u16 = end.trim().parse()?;
            if s == 0 || e == 0 || s > e {
                return Err(anyhow!("invalid port range: {}", part));
            }
            ports.extend(s..=e);
        } else {
            let p: u16 = part.parse()?;
            if p == 0 {
                return Err(anyhow!("invalid port: {}", part));
            }
            ports.push(p);
        }
    }
    ports.sort_unstable();
    ports.dedup();
    Ok(ports)
}

/// Expand a CIDR into host addresses.
pub fn expand_cidr(cidr: &str) -> Result<Vec<IpAddr>> {
    let net: IpNet = cidr.parse()?;
    Ok(net.hosts().collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    pub connect_timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self { connect_timeout: Duration::from_secs(3), retries: 1, retry_delay: Duration::from_millis(200) }
    }
}

/// Connect with exponential backoff plus jitter between attempts.
pub async fn connect_with_retry(host: &str, port: u16, policy: ConnectPolicy) -> Result<TcpStream, ConnectionError> {
    let mut attempts = 0;
    loop {
        let err = match timeout(policy.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => ConnectionError::Refused(format!("{host}:{port}")),
            Ok(Err(e)) => ConnectionError::Io(e),
            Err(_) => ConnectionError::Timeout(policy.connect_timeout),
        };
        attempts += 1;
        if attempts > policy.retries {
            return Err(err);
        }
        let base = policy.retry_delay.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempts.min(6));
        let jitter = thread_rng().gen_range(0..(exp / 4 + 1));
        debug!(host, port, attempts, error = %err, "connect failed; retrying");
        tokio::time::sleep(Duration::from_millis(exp + jitter)).await;
    }
}

#[derive(Debug, Clone)]
pub struct NetLink {
    host: String,
    policy: ConnectPolicy,
}

impl NetLink {
    pub fn new(host: impl Into<String>, policy: ConnectPolicy) -> Self {
        Self { host: host.into(), policy }
    }
}

#[async_trait]
impl DeviceLink for NetLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Network
    }

    fn address(&self) -> String {
        self.host.clone()
    }

    async fn open_channel(&self, endpoint: Option<&Endpoint>, options: &OpenOptions) -> Result<Channel, ConnectionError> {
        let port = match endpoint {
            Some(e) => u16::try_from(e.id)
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| ConnectionError::Unavailable(format!("invalid port {}", e.id)))?,
            None => DEFAULT_PORT,
        };
        let stream = connect_with_retry(&self.host, port, self.policy).await?;
        let _ = stream.set_nodelay(true);
        Ok(Channel::new(stream, options.read_timeout, options.write_timeout))
    }
}

/// A receiver listed in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NetPeer {
    pub host: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepConfig {
    pub cidr: String,
    pub ports: Vec<u16>,
    pub qps: u32,
    pub concurrency: usize,
    pub per_attempt: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct NetDiscovery {
    peers: Vec<NetPeer>,
    sweep: Option<SweepConfig>,
    policy: ConnectPolicy,
}

impl NetDiscovery {
    pub fn new(peers: Vec<NetPeer>, sweep: Option<SweepConfig>, policy: ConnectPolicy) -> Self {
        Self { peers, sweep, policy }
    }
}

fn candidate(host: String, name: Option<String>, ports: &[u16], policy: ConnectPolicy) -> Candidate {
    let ports = if ports.is_empty() { &[DEFAULT_PORT][..] } else { ports };
    Candidate {
        name: name.unwrap_or_else(|| host.clone()),
        link: Arc::new(NetLink::new(host, policy)),
        endpoints: ports.iter().map(|p| Endpoint::new(u32::from(*p), SERVICE_ID)).collect(),
    }
}

/// First port on `ip` that accepts a connection within `per_attempt`.
pub async fn first_open_port(ip: IpAddr, ports: &[u16], per_attempt: Duration) -> Option<u16> {
    for &p in ports {
        if let Ok(Ok(_)) = timeout(per_attempt, TcpStream::connect(SocketAddr::new(ip, p))).await {
            return Some(p);
        }
    }
    None
}

#[async_trait]
impl DiscoverySource for NetDiscovery {
    fn kind(&self) -> TransportKind {
        TransportKind::Network
    }

    fn link_from_cache(&self, address: &str, _: &CacheEntry) -> Option<Arc<dyn DeviceLink>> {
        Some(Arc::new(NetLink::new(address, self.policy)))
    }

    async fn known_peers(&self) -> Vec<Candidate> {
        self.peers
            .iter()
            .map(|p| candidate(p.host.clone(), p.name.clone(), &p.ports, self.policy))
            .collect()
    }

    async fn scan(&self, found: mpsc::Sender<Candidate>, cancel: CancellationToken) {
        let Some(sweep) = &self.sweep else { return };
        let ips = match expand_cidr(&sweep.cidr) {
            Ok(ips) => ips,
            Err(e) => {
                debug!(cidr = %sweep.cidr, error = %e, "sweep skipped");
                return;
            }
        };
        info!(cidr = %sweep.cidr, hosts = ips.len(), ports = ?sweep.ports, "sweep started");
        let limiter = RateLimiter::new(sweep.qps.max(1), sweep.concurrency.max(1));
        let sem = Arc::new(Semaphore::new(sweep.concurrency.max(1)));
        let mut probes = JoinSet::new();

        for ip in ips {
            let permit = tokio::select! {
                () = cancel.cancelled() => break,
                permit = sem.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            tokio::select! {
                () = cancel.cancelled() => break,
                () = limiter.acquire() => {}
            }
            let ports = sweep.ports.clone();
            let per_attempt = sweep.per_attempt;
            let found = found.clone();
            let policy = self.policy;
            probes.spawn(async move {
                if let Some(port) = first_open_port(ip, &ports, per_attempt).await {
                    let _ = found.send(candidate(ip.to_string(), None, &[port], policy)).await;
                }
                drop(permit);
            });
        }

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    probes.abort_all();
                    break;
                }
                next = probes.join_next() => if next.is_none() { break },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn options() -> OpenOptions {
        OpenOptions {
            access: Default::default(),
            sharing: Default::default(),
            read_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(2),
        }
    }

    fn no_retry() -> ConnectPolicy {
        ConnectPolicy { retries: 0, ..Default::default() }
    }

    #[test]
    fn parse_ranges_and_list() {
        assert_eq!(parse_ports("10110, 2947-2948,10110").unwrap(), vec![2947, 2948, 10110]);
        assert!(parse_ports("0").is_err());
        assert!(parse_ports("10-5").is_err());
    }

    #[test]
    fn cidr_hosts() {
        assert_eq!(expand_cidr("192.168.7.0/30").unwrap().len(), 2);
        assert!(expand_cidr("not-a-net").is_err());
    }

    #[tokio::test]
    async fn open_reads_from_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"$GPRMC").await.unwrap();
        });
        let link = NetLink::new("127.0.0.1", no_retry());
        let mut ch = link.open_channel(Some(&Endpoint::new(u32::from(port), SERVICE_ID)), &options()).await.unwrap();
        let mut buf = [0u8; 16];
        let n = ch.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"$GPRMC");
    }

    #[tokio::test]
    async fn closed_port_is_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let link = NetLink::new("127.0.0.1", no_retry());
        let err = link.open_channel(Some(&Endpoint::new(u32::from(port), SERVICE_ID)), &options()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Refused(_)), "{err:?}");
        let bad = link.open_channel(Some(&Endpoint::new(70_000, SERVICE_ID)), &options()).await;
        assert!(matches!(bad, Err(ConnectionError::Unavailable(_))));
    }

    #[tokio::test]
    async fn configured_peers_default_to_the_standard_port() {
        let discovery = NetDiscovery::new(
            vec![
                NetPeer { host: "192.0.2.10".into(), name: Some("Mast".into()), ports: vec![] },
                NetPeer { host: "192.0.2.11".into(), name: None, ports: vec![5000, 5001] },
            ],
            None,
            ConnectPolicy::default(),
        );
        let peers = discovery.known_peers().await;
        assert_eq!(peers[0].name, "Mast");
        assert_eq!(peers[0].endpoints[0].id, u32::from(DEFAULT_PORT));
        assert_eq!(peers[1].name, "192.0.2.11");
        assert_eq!(peers[1].endpoints.len(), 2);
    }

    #[tokio::test]
    async fn sweep_reports_listening_hosts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((_sock, _)) = listener.accept().await {}
        });
        let sweep = SweepConfig {
            cidr: "127.0.0.1/32".into(),
            ports: vec![port],
            qps: 100,
            concurrency: 4,
            per_attempt: Duration::from_millis(500),
        };
        let discovery = NetDiscovery::new(vec![], Some(sweep), no_retry());
        let (tx, mut rx) = mpsc::channel(4);
        discovery.scan(tx, CancellationToken::new()).await;
        let hit = rx.recv().await.unwrap();
        assert_eq!(hit.link.address(), "127.0.0.1");
        assert_eq!(hit.endpoints[0].id, u32::from(port));
        assert!(rx.try_recv().is_err());
    }
}
