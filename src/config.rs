use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::graphite::{
    parse_host, validate_namespace, FlushPolicy, TransportConfig, DEFAULT_PICKLE_PORT,
};
use crate::pf::PfctlSource;
use crate::ping::ExitAfterPolicy;

/// Top-level configuration for the pfstatsd agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Collector connection and flush policy.
    pub graphite: GraphiteConfig,

    /// pf queue statistics source.
    #[serde(default)]
    pub pf: PfConfig,

    /// ICMP probe source.
    #[serde(default)]
    pub ping: PingConfig,

    /// Interface byte-counter source.
    #[serde(default)]
    pub ifstats: IfstatsConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Stop the agent after this long. Default: run until signalled.
    #[serde(default, with = "humantime_serde")]
    pub time_limit: Option<Duration>,
}

/// Collector connection and flush policy.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphiteConfig {
    /// Pickle listener as `host[:port]`; IPv6 as `[addr]:port`. Default port: 2004.
    pub address: String,

    /// Namespace prefixed to every metric. Default: none.
    #[serde(default)]
    pub namespace: String,

    /// Flush once this many metrics are buffered; 0 disables. Default: 100.
    #[serde(default = "default_queue_max")]
    pub queue_max: usize,

    /// Flush once this long has passed since the last flush; null disables. Default: 10s.
    #[serde(default = "default_delay_max", with = "humantime_serde")]
    pub delay_max: Option<Duration>,

    /// First reconnect delay, doubled per attempt and cycling every four. Default: 1s.
    #[serde(default = "default_backoff_base", with = "humantime_serde")]
    pub backoff_base: Duration,
}

/// pf queue statistics source.
#[derive(Debug, Clone, Deserialize)]
pub struct PfConfig {
    /// Poll pf queues. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Command printing queue status. Default: "pfctl -s queue -v".
    #[serde(default = "default_pf_command")]
    pub command: String,

    /// Poll interval. Default: 1s.
    #[serde(default = "default_pf_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Namespace joined under the graphite namespace. Default: "pf".
    #[serde(default = "default_pf_namespace")]
    pub namespace: String,

    /// Post only leaf queues. Default: false.
    #[serde(default)]
    pub leaves_only: bool,
}

/// ICMP probe source.
#[derive(Debug, Clone, Deserialize)]
pub struct PingConfig {
    /// Run ping probes. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Ping binary; "ping" switches to "ping6" for IPv6 literals. Default: "ping".
    #[serde(default = "default_ping_program")]
    pub program: String,

    /// Extra arguments placed before the target.
    #[serde(default)]
    pub args: Vec<String>,

    /// Hosts or addresses to probe.
    #[serde(default)]
    pub targets: Vec<String>,

    /// Namespace joined under the graphite namespace. Default: "ping".
    #[serde(default = "default_ping_namespace")]
    pub namespace: String,

    /// End each probe run after this many responses.
    #[serde(default)]
    pub exit_after_packets: Option<u64>,

    /// End each probe run after this long.
    #[serde(default, with = "humantime_serde")]
    pub exit_after: Option<Duration>,

    /// Wait between probe runs. Default: 5s.
    #[serde(default = "default_restart_delay", with = "humantime_serde")]
    pub restart_delay: Duration,
}

/// Interface byte-counter source.
#[derive(Debug, Clone, Deserialize)]
pub struct IfstatsConfig {
    /// Sample interfaces. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Sample interval. Default: 10s.
    #[serde(default = "default_ifstats_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Namespace joined under the graphite namespace. Default: "ifstats".
    #[serde(default = "default_ifstats_namespace")]
    pub namespace: String,

    /// Interfaces to sample. Default: all.
    #[serde(default)]
    pub interfaces: Vec<String>,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve `/metrics` and `/healthz`. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address (e.g., ":9090"). Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_queue_max() -> usize {
    100
}

fn default_delay_max() -> Option<Duration> {
    Some(Duration::from_secs(10))
}

fn default_backoff_base() -> Duration {
    Duration::from_secs(1)
}

fn default_pf_command() -> String {
    PfctlSource::DEFAULT_COMMAND.to_string()
}

fn default_pf_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_pf_namespace() -> String {
    "pf".to_string()
}

fn default_ping_program() -> String {
    "ping".to_string()
}

fn default_ping_namespace() -> String {
    "ping".to_string()
}

fn default_restart_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_ifstats_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_ifstats_namespace() -> String {
    "ifstats".to_string()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for GraphiteConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            namespace: String::new(),
            queue_max: default_queue_max(),
            delay_max: default_delay_max(),
            backoff_base: default_backoff_base(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            graphite: GraphiteConfig::default(),
            pf: PfConfig::default(),
            ping: PingConfig::default(),
            ifstats: IfstatsConfig::default(),
            health: HealthConfig::default(),
            time_limit: None,
        }
    }
}

impl Default for PfConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            command: default_pf_command(),
            poll_interval: default_pf_poll_interval(),
            namespace: default_pf_namespace(),
            leaves_only: false,
        }
    }
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            program: default_ping_program(),
            args: Vec::new(),
            targets: Vec::new(),
            namespace: default_ping_namespace(),
            exit_after_packets: None,
            exit_after: None,
            restart_delay: default_restart_delay(),
        }
    }
}

impl Default for IfstatsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: default_ifstats_poll_interval(),
            namespace: default_ifstats_namespace(),
            interfaces: Vec::new(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

// --- Derived settings ---

impl GraphiteConfig {
    pub fn flush_policy(&self) -> FlushPolicy {
        FlushPolicy {
            queue_max: NonZeroUsize::new(self.queue_max),
            delay_max: self.delay_max,
        }
    }

    pub fn transport_config(&self) -> Result<TransportConfig> {
        TransportConfig::from_address(&self.address, self.backoff_base)
            .with_context(|| format!("parsing graphite.address {:?}", self.address))
    }
}

impl PingConfig {
    /// Exit policy for one probe run; `None` runs until ping exits.
    pub fn exit_policy(&self) -> Option<ExitAfterPolicy> {
        ExitAfterPolicy::from_limits(self.exit_after_packets, self.exit_after)
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.graphite.address.is_empty() {
            bail!("graphite.address is required");
        }
        parse_host(&self.graphite.address, DEFAULT_PICKLE_PORT)
            .context("graphite.address is invalid")?;

        for (field, namespace) in [
            ("graphite.namespace", &self.graphite.namespace),
            ("pf.namespace", &self.pf.namespace),
            ("ping.namespace", &self.ping.namespace),
            ("ifstats.namespace", &self.ifstats.namespace),
        ] {
            validate_namespace(namespace).with_context(|| format!("{field} is invalid"))?;
        }

        if self.graphite.backoff_base.is_zero() {
            bail!("graphite.backoff_base must be positive");
        }

        if self.graphite.delay_max.is_some_and(|d| d.is_zero()) {
            bail!("graphite.delay_max must be positive or null");
        }

        if !self.pf.enabled && !self.ping.enabled && !self.ifstats.enabled {
            bail!("at least one of pf, ping or ifstats must be enabled");
        }

        if self.pf.enabled {
            if self.pf.command.trim().is_empty() {
                bail!("pf.command must not be empty");
            }
            if self.pf.poll_interval.is_zero() {
                bail!("pf.poll_interval must be positive");
            }
        }

        if self.ping.enabled {
            if self.ping.targets.is_empty() {
                bail!("ping.targets must not be empty when ping is enabled");
            }
            if self.ping.program.trim().is_empty() {
                bail!("ping.program must not be empty");
            }
            if self.ping.restart_delay.is_zero() {
                bail!("ping.restart_delay must be positive");
            }
            if self.ping.exit_after_packets == Some(0) {
                bail!("ping.exit_after_packets must be positive");
            }
        }

        if self.ifstats.enabled && self.ifstats.poll_interval.is_zero() {
            bail!("ifstats.poll_interval must be positive");
        }

        #[cfg(not(target_os = "linux"))]
        if self.ifstats.enabled {
            bail!("ifstats is only supported on Linux");
        }

        if self.time_limit.is_some_and(|d| d.is_zero()) {
            bail!("time_limit must be positive");
        }

        Ok(())
    }
}
