use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use gpslink_core::{
    DeviceCache, DeviceContext, DeviceSnapshot, DiscoverOptions, DiscoveryCoordinator, DiscoveryEvent, Device,
    Endpoint, MemoryCache, Registry, DEFAULT_TEST_UNITS,
};
use net_socket::{NetDiscovery, NetLink, SERVICE_ID};
use sentence_probe::SentenceValidator;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod output;

use config::{Config, SettingsConfig};
use output::OutputFormat;

#[derive(Debug, Parser)]
#[command(name = "gpslink", version, about = "Find, verify and rank positioning receivers")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./gpslink.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Device cache database (default: ./gpslink.db)
    #[arg(long, global = true, conflicts_with = "no_cache")]
    cache: Option<PathBuf>,
    /// Keep history in memory only
    #[arg(long, global = true)]
    no_cache: bool,
    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(flatten)]
    tuning: Tuning,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct Tuning {
    /// Per-read timeout in milliseconds
    #[arg(long, global = true)]
    read_timeout_ms: Option<u64>,
    /// Per-write timeout in milliseconds
    #[arg(long, global = true)]
    write_timeout_ms: Option<u64>,
    /// Total time limit for a live scan, in whole seconds (0-255)
    #[arg(long, global = true)]
    discovery_timeout_secs: Option<u64>,
    /// Failures tolerated before a never-confirmed device is skipped
    #[arg(long, global = true)]
    max_failures: Option<u32>,
    /// How long one detection may take, in seconds
    #[arg(long, global = true)]
    detection_timeout_secs: Option<u64>,
}

impl Tuning {
    fn as_settings(&self) -> SettingsConfig {
        SettingsConfig {
            read_timeout_ms: self.read_timeout_ms,
            write_timeout_ms: self.write_timeout_ms,
            discovery_timeout_secs: self.discovery_timeout_secs,
            max_allowed_failures: self.max_failures,
            detection_timeout_secs: self.detection_timeout_secs,
        }
    }
}

#[derive(Debug, Args)]
struct Target {
    /// Receiver host name or IP
    host: String,
    /// TCP port (default 10110)
    #[arg(long)]
    port: Option<u16>,
    /// Display name
    #[arg(long)]
    name: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// List candidate receivers: cached, configured and optionally swept
    Discover {
        /// Ignore cached history
        #[arg(long)]
        flush: bool,
        /// Also sweep the configured network range
        #[arg(long)]
        live: bool,
        /// Sweep CIDR (overrides config)
        #[arg(long)]
        cidr: Option<String>,
        /// Sweep ports, e.g. 10110,2947 or 5000-5010 (overrides config)
        #[arg(long)]
        ports: Option<String>,
        /// Run detection on every candidate before listing
        #[arg(long)]
        detect: bool,
        /// Output format
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
        /// Also write a CSV file
        #[arg(long, value_name = "FILE")]
        csv: Option<PathBuf>,
    },
    /// Check whether a host streams positioning sentences
    Detect {
        #[command(flatten)]
        target: Target,
        /// Output format
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
    /// Read a few sentences and report what the receiver provides
    Test {
        #[command(flatten)]
        target: Target,
        /// Lines to read
        #[arg(long, default_value_t = DEFAULT_TEST_UNITS)]
        units: usize,
        /// Output format
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
    /// Forget everything learned about a host
    Forget {
        host: String,
    },
    /// List cached devices, best first
    Devices {
        /// Output format
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
        /// Also write a CSV file
        #[arg(long, value_name = "FILE")]
        csv: Option<PathBuf>,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn,gpslink=info,gpslink_core=info",
        1 => "info,gpslink=debug,gpslink_core=debug,net_socket=debug,sentence_probe=debug,cache_sqlite=debug",
        _ => "debug,gpslink=trace,gpslink_core=trace,net_socket=trace,sentence_probe=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).try_init();
}

#[cfg(feature = "sqlite")]
fn open_cache(path: &Path) -> Arc<dyn DeviceCache> {
    match cache_sqlite::SqliteCache::open_or_create(path) {
        Ok(cache) => {
            debug!(path = %path.display(), "device cache opened");
            Arc::new(cache)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "device cache unavailable; history kept in memory");
            Arc::new(MemoryCache::new())
        }
    }
}

#[cfg(not(feature = "sqlite"))]
fn open_cache(path: &Path) -> Arc<dyn DeviceCache> {
    debug!(path = %path.display(), "built without sqlite; history kept in memory");
    Arc::new(MemoryCache::new())
}

/// Everything a command needs; `shutdown` releases what was registered.
struct App {
    cfg: Config,
    registry: Arc<Registry>,
    ctx: DeviceContext,
}

impl App {
    fn new(cli: &Cli, cfg: Config) -> Result<Self> {
        let settings_cfg = cfg.settings.overlay(&cli.tuning.as_settings());
        let settings = settings_cfg.to_settings()?;
        let registry = Arc::new(Registry::new(settings_cfg.detection_timeout()));
        let cache: Arc<dyn DeviceCache> = if cli.no_cache || cfg.cache.disabled {
            Arc::new(MemoryCache::new())
        } else {
            let path = cli.cache.clone().or_else(|| cfg.cache.path.clone()).unwrap_or_else(|| PathBuf::from(config::DEFAULT_CACHE));
            open_cache(&path)
        };
        let ctx = DeviceContext {
            cache,
            registry: registry.clone(),
            validator: Arc::new(SentenceValidator::default()),
            settings,
        };
        Ok(Self { cfg, registry, ctx })
    }

    fn device(&self, target: &Target) -> Device {
        let port = target.port.unwrap_or(net_socket::DEFAULT_PORT);
        let link = Arc::new(NetLink::new(target.host.clone(), self.cfg.network.policy()));
        let name = target.name.clone().unwrap_or_else(|| target.host.clone());
        Device::new(link, name, vec![Endpoint::new(u32::from(port), SERVICE_ID)], self.ctx.clone())
    }

    async fn shutdown(&self, extra: &[Device]) {
        for d in self.registry.clear().iter().chain(extra) {
            d.dispose().await;
        }
    }
}

fn format_or(cli: Option<OutputFormat>, cfg: &Config) -> OutputFormat {
    cli.or_else(|| match cfg.format.as_deref() {
        Some("json") => Some(OutputFormat::Json),
        Some("jsonl") => Some(OutputFormat::Jsonl),
        Some("text") => Some(OutputFormat::Text),
        _ => None,
    })
    .unwrap_or(OutputFormat::Text)
}

fn print_devices(devices: &[DeviceSnapshot], format: OutputFormat, csv: Option<&Path>) -> Result<()> {
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    output::write_devices(&mut out, devices, format)?;
    out.flush()?;
    if let Some(path) = csv {
        output::write_csv(path, devices).with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}

async fn detect_all(devices: &[Device]) {
    for d in devices {
        if let Err(e) = d.begin_detection().await {
            warn!(device = %d.key(), error = %e, "detection not started");
        }
    }
    for d in devices {
        let confirmed = d.wait_for_detection(None).await;
        debug!(device = %d.key(), confirmed, "detection finished");
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_discover(
    app: &App,
    flush: bool,
    live: bool,
    cidr: Option<String>,
    ports: Option<String>,
    detect: bool,
    format: OutputFormat,
    csv: Option<PathBuf>,
) -> Result<()> {
    let mut network = app.cfg.network.clone();
    if cidr.is_some() {
        network.sweep_cidr = cidr;
    }
    if ports.is_some() {
        network.sweep_ports = ports;
    }
    if live && network.sweep_cidr.is_none() {
        return Err(anyhow!("--live needs a sweep range (--cidr or network.sweep_cidr)"));
    }
    let coordinator = DiscoveryCoordinator::new(Arc::new(network.discovery()?), app.ctx.clone());
    let mut events = coordinator.subscribe();
    let started = coordinator
        .discover_devices(DiscoverOptions { flush, live_scan: live })
        .await
        .ok_or_else(|| anyhow!("discovery already running"))?;
    info!(count = started.len(), "known candidates");
    if live {
        coordinator.wait_for_discovery(None).await;
        while let Ok(ev) = events.try_recv() {
            if let DiscoveryEvent::DeviceDiscovered(d) = ev {
                info!(device = %d.key(), "found on sweep");
            }
        }
    }
    let devices = coordinator.known_devices();
    if detect {
        detect_all(&devices).await;
    }
    let mut ranked = coordinator.known_devices();
    gpslink_core::rank_devices(&mut ranked);
    let snapshots: Vec<DeviceSnapshot> = ranked.iter().map(Device::snapshot).collect();
    print_devices(&snapshots, format, csv.as_deref())?;
    app.shutdown(&ranked).await;
    Ok(())
}

async fn run_detect(app: &App, target: &Target, format: OutputFormat) -> Result<bool> {
    let device = app.device(target);
    device.begin_detection().await?;
    let confirmed = device.wait_for_detection(None).await;
    if !confirmed {
        device.cancel_detection().await;
    }
    let snapshot = device.snapshot();
    match format {
        OutputFormat::Text => println!("{} {}", output::text_row(&snapshot), if confirmed { "ok" } else { "not a receiver" }),
        _ => print_devices(std::slice::from_ref(&snapshot), format, None)?,
    }
    app.shutdown(std::slice::from_ref(&device)).await;
    Ok(confirmed)
}

async fn run_test(app: &App, target: &Target, units: usize, format: OutputFormat) -> Result<()> {
    let device = app.device(target);
    let report = device.test(units).await;
    let outcome = match report {
        Ok(report) => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            output::write_report(&mut out, &device.snapshot(), &report, format)
        }
        Err(e) => Err(e.into()),
    };
    app.shutdown(std::slice::from_ref(&device)).await;
    outcome
}

async fn run_forget(app: &App, host: String) -> Result<()> {
    let device = app.device(&Target { host, port: None, name: None });
    device.undetect().await?;
    println!("forgot {}", device.address());
    app.shutdown(std::slice::from_ref(&device)).await;
    Ok(())
}

async fn run_devices(app: &App, format: OutputFormat, csv: Option<PathBuf>) -> Result<()> {
    let source = NetDiscovery::new(Vec::new(), None, app.cfg.network.policy());
    let coordinator = DiscoveryCoordinator::new(Arc::new(source), app.ctx.clone());
    let devices = coordinator.discover_devices(DiscoverOptions::default()).await.unwrap_or_default();
    let snapshots: Vec<DeviceSnapshot> = devices.iter().map(Device::snapshot).collect();
    print_devices(&snapshots, format, csv.as_deref())?;
    app.shutdown(&devices).await;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if let Commands::Version = cli.command {
        println!("gpslink {} (core {})", env!("CARGO_PKG_VERSION"), gpslink_core::version());
        return Ok(());
    }
    let cfg = config::load_config(cli.config.as_deref())?;
    let app = App::new(&cli, cfg)?;
    let rt = tokio::runtime::Runtime::new()?;
    let started = std::time::Instant::now();
    let result = rt.block_on(async {
        match cli.command {
            Commands::Version => Ok(()),
            Commands::Discover { flush, live, cidr, ports, detect, format, csv } => {
                let format = format_or(format, &app.cfg);
                run_discover(&app, flush, live, cidr, ports, detect, format, csv).await
            }
            Commands::Detect { target, format } => {
                let confirmed = run_detect(&app, &target, format_or(format, &app.cfg)).await?;
                if !confirmed {
                    std::process::exit(2);
                }
                Ok(())
            }
            Commands::Test { target, units, format } => run_test(&app, &target, units, format_or(format, &app.cfg)).await,
            Commands::Forget { host } => run_forget(&app, host).await,
            Commands::Devices { format, csv } => run_devices(&app, format_or(format, &app.cfg), csv).await,
        }
    });
    debug!(elapsed_ms = started.elapsed().as_millis() as u64, "done");
    // Cancelled detections may leave tasks unwinding; give them a moment.
    rt.shutdown_timeout(Duration::from_millis(500));
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_global_tuning_after_subcommand() {
        let cli = Cli::try_parse_from(["gpslink", "discover", "--live", "--cidr", "10.0.0.0/30", "--max-failures", "3", "--format", "jsonl"]).unwrap();
        assert_eq!(cli.tuning.max_failures, Some(3));
        match cli.command {
            Commands::Discover { live, cidr, format, .. } => {
                assert!(live);
                assert_eq!(cidr.as_deref(), Some("10.0.0.0/30"));
                assert_eq!(format, Some(OutputFormat::Jsonl));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn zero_live_scan_limit_is_accepted() {
        use clap::CommandFactory;

        let cli = Cli::try_parse_from(["gpslink", "discover", "--live", "--discovery-timeout-secs", "0"]).unwrap();
        let settings = cli.tuning.as_settings().to_settings().unwrap();
        assert_eq!(settings.discovery_timeout(), Duration::ZERO);

        let cmd = Cli::command();
        let help = cmd
            .get_arguments()
            .find(|a| a.get_id() == "discovery_timeout_secs")
            .and_then(|a| a.get_help())
            .map(|h| h.to_string())
            .unwrap();
        assert!(help.contains("0-255") && help.contains("Total time limit"), "{help}");
    }

    #[test]
    fn cache_flags_conflict() {
        assert!(Cli::try_parse_from(["gpslink", "--no-cache", "--cache", "x.db", "devices"]).is_err());
    }

    #[test]
    fn config_format_is_a_fallback() {
        let mut cfg = Config::default();
        cfg.format = Some("json".into());
        assert_eq!(format_or(None, &cfg), OutputFormat::Json);
        assert_eq!(format_or(Some(OutputFormat::Text), &cfg), OutputFormat::Text);
        assert_eq!(format_or(None, &Config::default()), OutputFormat::Text);
    }

    #[tokio::test]
    async fn forget_on_memory_cache_succeeds() {
        let cli = Cli::try_parse_from(["gpslink", "--no-cache", "forget", "192.0.2.1"]).unwrap();
        let app = App::new(&cli, Config::default()).unwrap();
        run_forget(&app, "192.0.2.1".into()).await.unwrap();
        assert!(app.registry.devices().is_empty());
    }
}
