//! TOML configuration for loadmeter.
//!
//! Every section falls back to defaults, so a config file only needs the
//! values it changes. The file path can be given explicitly, through
//! `LOADMETER_CONFIG`, or found at `/etc/loadmeter/loadmeter.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::load::PidGains;
use crate::resources::ResourceTargets;
use crate::throughput::ThroughputSettings;

pub const CONFIG_ENV: &str = "LOADMETER_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/loadmeter/loadmeter.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub probes: ProbesConfig,
    #[serde(default)]
    pub tests: TestsConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub throughput: ThroughputConfig,
    #[serde(default)]
    pub rate_control: PidGains,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// The layer that supplied the configuration in effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Passed on the command line.
    Explicit(PathBuf),
    /// Named by `LOADMETER_CONFIG`.
    Env(PathBuf),
    System(PathBuf),
    Defaults,
}

impl ConfigSource {
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigSource::Explicit(p) | ConfigSource::Env(p) | ConfigSource::System(p) => Some(p),
            ConfigSource::Defaults => None,
        }
    }
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Explicit(p) => write!(f, "{} (command line)", p.display()),
            ConfigSource::Env(p) => write!(f, "{} (${CONFIG_ENV})", p.display()),
            ConfigSource::System(p) => write!(f, "{} (system)", p.display()),
            ConfigSource::Defaults => write!(f, "built-in defaults"),
        }
    }
}

impl Config {
    /// Read, parse and validate one file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid settings in {}", path.display()))?;
        debug!(path = %path.display(), "config file parsed");
        Ok(config)
    }

    /// The first layer present wins: `explicit`, then `LOADMETER_CONFIG`,
    /// then the system file, then defaults. A present layer has to load;
    /// a broken file is an error, not a reason to try the next layer.
    pub fn resolve(explicit: Option<&Path>) -> Result<(Self, ConfigSource)> {
        let env = std::env::var_os(CONFIG_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        Self::resolve_layers(explicit, env, Path::new(SYSTEM_CONFIG_PATH))
    }

    fn resolve_layers(
        explicit: Option<&Path>,
        env: Option<PathBuf>,
        system: &Path,
    ) -> Result<(Self, ConfigSource)> {
        let source = match (explicit, env) {
            (Some(path), _) => ConfigSource::Explicit(path.to_path_buf()),
            (None, Some(path)) => ConfigSource::Env(path),
            (None, None) if system.exists() => ConfigSource::System(system.to_path_buf()),
            (None, None) => ConfigSource::Defaults,
        };

        let config = match source.path() {
            Some(path) => Self::load(path)
                .with_context(|| format!("failed to load configuration from {source}"))?,
            None => Self::default(),
        };
        Ok((config, source))
    }

    /// Reject settings no test could run with.
    pub fn validate(&self) -> Result<()> {
        if self.client.server_host.trim().is_empty() {
            bail!("client.server_host must not be empty");
        }
        for (name, burst) in self.tests.bursts() {
            if burst.enable && (burst.iterations == 0 || burst.step == 0) {
                bail!("tests.{name}: iterations and step must be at least 1");
            }
        }
        for (name, rate) in self.tests.rates() {
            if rate.enable && (rate.iterations == 0 || rate.step == 0 || rate.duration_secs == 0) {
                bail!("tests.{name}: iterations, step and duration_secs must be at least 1");
            }
        }
        if self.throughput.total_bytes == 0 || self.throughput.chunk_bytes == 0 {
            bail!("throughput.total_bytes and throughput.chunk_bytes must be non-zero");
        }
        Ok(())
    }

    pub fn resource_targets(&self) -> ResourceTargets {
        ResourceTargets {
            pid: self.client.pid,
            process_names: self.client.process_names.clone(),
        }
    }

    pub fn throughput_settings(&self) -> ThroughputSettings {
        ThroughputSettings {
            total_bytes: self.throughput.total_bytes,
            chunk_bytes: self.throughput.chunk_bytes,
            transfer_timeout: Duration::from_secs(self.throughput.timeout_secs),
            monitor_window: Duration::from_millis(self.sampling.throughput_window_ms),
            monitor_interval: Duration::from_millis(self.sampling.monitor_interval_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Who to test against and what to watch locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Local process whose CPU/RAM is reported next to each result.
    pub pid: Option<u32>,
    /// Processes (substring match on name) monitored during bursts and
    /// throughput runs.
    pub process_names: Vec<String>,
    pub server_host: String,
    pub server_ping_port: u16,
    pub server_http_port: u16,
    pub server_https_port: u16,
    pub server_dns_udp_port: u16,
    pub server_dns_tcp_port: u16,
    /// Extra root certificate (PEM) for HTTPS families.
    pub ca_cert_path: Option<PathBuf>,
    pub request_timeout_secs: u64,
    pub results_dir: PathBuf,
    /// Appended to every result file name, e.g. `-lab`.
    pub file_postfix: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pid: None,
            process_names: Vec::new(),
            server_host: "127.0.0.1".to_string(),
            server_ping_port: 9000,
            server_http_port: 8080,
            server_https_port: 8443,
            server_dns_udp_port: 5353,
            server_dns_tcp_port: 5353,
            ca_cert_path: None,
            request_timeout_secs: 10,
            results_dir: PathBuf::from("test-results"),
            file_postfix: String::new(),
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn base_url(&self, https: bool) -> String {
        if https {
            format!("https://{}:{}", self.server_host, self.server_https_port)
        } else {
            format!("http://{}:{}", self.server_host, self.server_http_port)
        }
    }
}

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbesConfig {
    pub http_burst_path: String,
    pub http_rate_path: String,
    pub dns_query_name: String,
    pub dns_timeout_ms: u64,
    pub echo_payload_bytes: usize,
    pub echo_timeout_ms: u64,
}

impl Default for ProbesConfig {
    fn default() -> Self {
        Self {
            http_burst_path: "/download/100000".to_string(),
            http_rate_path: "/download/1000".to_string(),
            dns_query_name: "test.service".to_string(),
            dns_timeout_ms: 2000,
            echo_payload_bytes: 64,
            echo_timeout_ms: 1000,
        }
    }
}

// ---------------------------------------------------------------------------
// Test families
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Toggle {
    pub enable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleDeviceTest {
    pub enable: bool,
    /// Quiet period the host CPU is measured over.
    pub window_ms: u64,
}

impl Default for IdleDeviceTest {
    fn default() -> Self {
        Self {
            enable: false,
            window_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleCountTest {
    pub enable: bool,
    pub count: u32,
}

impl Default for SampleCountTest {
    fn default() -> Self {
        Self {
            enable: false,
            count: 10,
        }
    }
}

/// Burst sizes are `(i + 1) * step` for `i` in `0..iterations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BurstTest {
    pub enable: bool,
    pub iterations: u32,
    pub step: u32,
}

impl Default for BurstTest {
    fn default() -> Self {
        Self {
            enable: false,
            iterations: 10,
            step: 10,
        }
    }
}

impl BurstTest {
    pub fn sizes(&self) -> impl Iterator<Item = usize> + '_ {
        let step = u64::from(self.step);
        (1..=u64::from(self.iterations))
            .map(move |i| usize::try_from(i * step).unwrap_or(usize::MAX))
    }
}

/// Rate targets are `(i + 1) * step` requests per second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateTest {
    pub enable: bool,
    pub iterations: u32,
    pub step: u32,
    pub duration_secs: u64,
    /// Pause between iterations.
    pub rest_ms: u64,
}

impl Default for RateTest {
    fn default() -> Self {
        Self {
            enable: false,
            iterations: 5,
            step: 10,
            duration_secs: 10,
            rest_ms: 1000,
        }
    }
}

impl RateTest {
    pub fn targets(&self) -> impl Iterator<Item = f64> + '_ {
        let step = u64::from(self.step);
        (1..=u64::from(self.iterations)).map(move |i| (i * step) as f64)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn rest(&self) -> Duration {
        Duration::from_millis(self.rest_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestsConfig {
    pub idle_device: IdleDeviceTest,
    pub idle_process: Toggle,
    pub http_throughput: Toggle,
    pub https_throughput: Toggle,
    pub ping: SampleCountTest,
    pub jitter: SampleCountTest,
    pub http_burst: BurstTest,
    pub https_burst: BurstTest,
    pub http_rate: RateTest,
    pub https_rate: RateTest,
    pub dns_udp_burst: BurstTest,
    pub dns_tcp_burst: BurstTest,
    pub dns_udp_rate: RateTest,
    pub dns_tcp_rate: RateTest,
}

impl TestsConfig {
    fn bursts(&self) -> [(&'static str, &BurstTest); 4] {
        [
            ("http_burst", &self.http_burst),
            ("https_burst", &self.https_burst),
            ("dns_udp_burst", &self.dns_udp_burst),
            ("dns_tcp_burst", &self.dns_tcp_burst),
        ]
    }

    fn rates(&self) -> [(&'static str, &RateTest); 4] {
        [
            ("http_rate", &self.http_rate),
            ("https_rate", &self.https_rate),
            ("dns_udp_rate", &self.dns_udp_rate),
            ("dns_tcp_rate", &self.dns_tcp_rate),
        ]
    }
}

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub monitor_interval_ms: u64,
    /// Continuous monitoring window per burst.
    pub burst_window_ms: u64,
    /// Continuous monitoring window per throughput direction.
    pub throughput_window_ms: u64,
    /// Local PID poll interval during paced runs.
    pub local_poll_interval_ms: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            monitor_interval_ms: 100,
            burst_window_ms: 5000,
            throughput_window_ms: 10_000,
            local_poll_interval_ms: 100,
        }
    }
}

impl SamplingConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn burst_window(&self) -> Duration {
        Duration::from_millis(self.burst_window_ms)
    }

    pub fn local_poll_interval(&self) -> Duration {
        Duration::from_millis(self.local_poll_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Throughput
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThroughputConfig {
    pub total_bytes: u64,
    pub chunk_bytes: usize,
    /// Per-direction bound; also the HTTP client timeout for transfers.
    pub timeout_secs: u64,
}

impl Default for ThroughputConfig {
    fn default() -> Self {
        Self {
            total_bytes: crate::throughput::DEFAULT_TOTAL_BYTES,
            chunk_bytes: crate::throughput::DEFAULT_CHUNK_BYTES,
            timeout_secs: 120,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is not set.
    pub level: String,
    /// JSON log lines instead of the human-readable format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
