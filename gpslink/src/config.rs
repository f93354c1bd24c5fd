use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use gpslink_core::registry::DEFAULT_DETECTION_TIMEOUT;
use gpslink_core::{ConfigError, Settings};
use net_socket::{ConnectPolicy, NetDiscovery, NetPeer, SweepConfig};
use serde::Deserialize;

pub const DEFAULT_CONFIG: &str = "gpslink.yaml";
pub const DEFAULT_CACHE: &str = "gpslink.db";

/// Timeouts and limits. The same shape carries command-line overrides.
#[derive(Debug, Default, Deserialize, Clone, PartialEq, Eq)]
pub struct SettingsConfig {
    pub read_timeout_ms: Option<u64>,
    pub write_timeout_ms: Option<u64>,
    pub discovery_timeout_secs: Option<u64>,
    pub max_allowed_failures: Option<u32>,
    pub detection_timeout_secs: Option<u64>,
}

impl SettingsConfig {
    /// Values from `over` win where present.
    pub fn overlay(&self, over: &SettingsConfig) -> SettingsConfig {
        SettingsConfig {
            read_timeout_ms: over.read_timeout_ms.or(self.read_timeout_ms),
            write_timeout_ms: over.write_timeout_ms.or(self.write_timeout_ms),
            discovery_timeout_secs: over.discovery_timeout_secs.or(self.discovery_timeout_secs),
            max_allowed_failures: over.max_allowed_failures.or(self.max_allowed_failures),
            detection_timeout_secs: over.detection_timeout_secs.or(self.detection_timeout_secs),
        }
    }

    pub fn to_settings(&self) -> Result<Settings, ConfigError> {
        let mut s = Settings::default();
        if let Some(ms) = self.read_timeout_ms { s.set_read_timeout(Duration::from_millis(ms))?; }
        if let Some(ms) = self.write_timeout_ms { s.set_write_timeout(Duration::from_millis(ms))?; }
        if let Some(secs) = self.discovery_timeout_secs { s.set_discovery_timeout(Duration::from_secs(secs))?; }
        if let Some(n) = self.max_allowed_failures { s.set_max_allowed_failures(n)?; }
        Ok(s)
    }

    pub fn detection_timeout(&self) -> Duration {
        self.detection_timeout_secs.map(Duration::from_secs).unwrap_or(DEFAULT_DETECTION_TIMEOUT)
    }
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct NetworkConfig {
    #[serde(default)]
    pub hosts: Vec<NetPeer>,
    pub sweep_cidr: Option<String>,
    pub sweep_ports: Option<String>,
    pub qps: Option<u32>,
    pub concurrency: Option<usize>,
    pub probe_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
}

impl NetworkConfig {
    pub fn policy(&self) -> ConnectPolicy {
        let d = ConnectPolicy::default();
        ConnectPolicy {
            connect_timeout: self.connect_timeout_ms.map(Duration::from_millis).unwrap_or(d.connect_timeout),
            retries: self.retries.unwrap_or(d.retries),
            retry_delay: self.retry_delay_ms.map(Duration::from_millis).unwrap_or(d.retry_delay),
        }
    }

    pub fn sweep(&self) -> Result<Option<SweepConfig>> {
        let Some(cidr) = &self.sweep_cidr else { return Ok(None) };
        let ports = match &self.sweep_ports {
            Some(spec) => net_socket::parse_ports(spec)?,
            None => vec![net_socket::DEFAULT_PORT],
        };
        if ports.is_empty() {
            return Err(anyhow!("sweep_ports selects no ports"));
        }
        Ok(Some(SweepConfig {
            cidr: cidr.clone(),
            ports,
            qps: self.qps.unwrap_or(50),
            concurrency: self.concurrency.unwrap_or(64),
            per_attempt: Duration::from_millis(self.probe_timeout_ms.unwrap_or(300)),
        }))
    }

    pub fn discovery(&self) -> Result<NetDiscovery> {
        Ok(NetDiscovery::new(self.hosts.clone(), self.sweep()?, self.policy()))
    }
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct CacheConfig {
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    /// Default output format: text, json or jsonl.
    pub format: Option<String>,
    #[serde(default)]
    pub settings: SettingsConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

/// An explicit path must exist and parse; `./gpslink.yaml` is read only if present.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_CONFIG);
            if p.exists() { p.to_path_buf() } else { return Ok(Config::default()); }
        }
    };
    let s = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}
