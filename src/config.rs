use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::aggregate::ProcessFilter;
use crate::engine::{EngineOptions, Verbosity};

/// Top-level configuration for frametrace.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Trace event source.
    #[serde(default)]
    pub source: SourceConfig,

    /// Which pipelines to track and in how much detail.
    #[serde(default)]
    pub tracking: TrackingConfig,

    /// Which processes to report on.
    #[serde(default)]
    pub processes: ProcessesConfig,

    /// Consumer loop configuration.
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Report sink configuration.
    #[serde(default)]
    pub sinks: SinksConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Trace event source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Newline-delimited JSON replay file.
    #[serde(default)]
    pub path: PathBuf,

    /// Ticks per second of event timestamps. Default: 10,000,000.
    #[serde(default = "default_qpc_frequency")]
    pub qpc_frequency: u64,
}

/// Tracking detail per pipeline.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TrackingConfig {
    /// Present tracking. `simple` disables everything past the runtime call.
    #[serde(default = "default_verbosity")]
    pub verbosity: Verbosity,

    /// Windows Mixed Reality. Default: off.
    #[serde(default)]
    pub mixed_reality: Verbosity,

    /// SteamVR compositor. Default: off.
    #[serde(default)]
    pub steamvr: Verbosity,

    /// Oculus compositor. Default: off.
    #[serde(default)]
    pub oculusvr: Verbosity,
}

/// Process selection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessesConfig {
    /// Only report this process id.
    #[serde(default)]
    pub target_pid: Option<u32>,

    /// Only report processes with these image names (case-insensitive).
    #[serde(default)]
    pub names: Vec<String>,

    /// Skip presents that never reached the screen.
    #[serde(default)]
    pub exclude_dropped: bool,
}

/// Consumer loop configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    /// How often completed records are drained. Default: 100ms.
    #[serde(default = "default_consumer_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Stop recording when more events than this are lost in one tick.
    /// 0 disables the check. Default: 100.
    #[serde(default = "default_max_lost_events")]
    pub max_lost_events: u64,

    /// Stop recording after this long.
    #[serde(default, with = "humantime_serde")]
    pub timer: Option<Duration>,
}

/// Report sink configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SinksConfig {
    #[serde(default)]
    pub jsonl: JsonlSinkConfig,

    #[serde(default)]
    pub summary: SummarySinkConfig,
}

/// JSON lines report file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonlSinkConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Output file, required when enabled.
    #[serde(default)]
    pub path: PathBuf,
}

/// Periodic statistics in the log.
#[derive(Debug, Clone, Deserialize)]
pub struct SummarySinkConfig {
    /// Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Default: 1s.
    #[serde(default = "default_summary_interval", with = "humantime_serde")]
    pub interval: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: "0.0.0.0:9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_qpc_frequency() -> u64 {
    10_000_000
}

fn default_verbosity() -> Verbosity {
    Verbosity::Normal
}

fn default_consumer_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_max_lost_events() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_summary_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_health_addr() -> String {
    "0.0.0.0:9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            source: SourceConfig::default(),
            tracking: TrackingConfig::default(),
            processes: ProcessesConfig::default(),
            consumer: ConsumerConfig::default(),
            sinks: SinksConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            qpc_frequency: default_qpc_frequency(),
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            verbosity: default_verbosity(),
            mixed_reality: Verbosity::Off,
            steamvr: Verbosity::Off,
            oculusvr: Verbosity::Off,
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            interval: default_consumer_interval(),
            max_lost_events: default_max_lost_events(),
            timer: None,
        }
    }
}

impl Default for SummarySinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_summary_interval(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_health_addr(),
        }
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
        if self.source.path.as_os_str().is_empty() {
            bail!("source.path is required");
        }

        if self.source.qpc_frequency == 0 {
            bail!("source.qpc_frequency must be positive");
        }

        if self.tracking.verbosity == Verbosity::Off {
            bail!("tracking.verbosity must be simple, normal or verbose");
        }

        if self.consumer.interval.is_zero() {
            bail!("consumer.interval must be positive");
        }

        if self.consumer.timer.is_some_and(|t| t.is_zero()) {
            bail!("consumer.timer must be positive when set");
        }

        if self.sinks.jsonl.enabled && self.sinks.jsonl.path.as_os_str().is_empty() {
            bail!("sinks.jsonl.path is required when enabled");
        }

        if self.sinks.summary.enabled && self.sinks.summary.interval.is_zero() {
            bail!("sinks.summary.interval must be positive");
        }

        if self.health.enabled {
            self.health
                .addr
                .parse::<SocketAddr>()
                .with_context(|| format!("invalid health.addr: {}", self.health.addr))?;
        }

        Ok(())
    }

    /// Tracking options for the engine.
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            presents: self.tracking.verbosity,
            mixed_reality: self.tracking.mixed_reality,
            steamvr: self.tracking.steamvr,
            oculusvr: self.tracking.oculusvr,
        }
    }

    pub fn process_filter(&self) -> ProcessFilter {
        ProcessFilter::new(self.processes.target_pid, &self.processes.names)
    }
}
