//! Configuration loading and typed config structures for a training session.
//!
//! A session is described by a single [`SessionConfig`], read from a YAML
//! file (or built directly by a caller that parsed its own arguments). The
//! struct is immutable once the session starts; every component reads its
//! verbosity, timeouts, and optional features from it rather than from any
//! process-wide state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Errors that can occur when loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value is out of range or a required value is missing.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Explanation of what is wrong with the configuration.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Logging and profiling switches, passed explicitly to every component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Verbosity {
    /// Emit per-tick detail.
    pub debug: bool,
    /// Only report warnings and the final result.
    pub quiet: bool,
    /// Accumulate per-phase tick timings into the session report.
    pub profile: bool,
}

impl Verbosity {
    /// Default `tracing` filter directive for these switches.
    ///
    /// `debug` wins over `quiet` when both are set.
    pub const fn filter_directive(self) -> &'static str {
        if self.debug {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }
}

/// Timeouts bounding every wait in a session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TimeoutConfig {
    /// Connect plus handshake, per agent.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_ms: u64,

    /// Per-agent, per-tick input wait. Defaults to half the tick interval.
    #[serde(default)]
    pub input_ms: Option<u64>,

    /// How long a tick may block on a full recorder queue.
    #[serde(default = "default_recorder_timeout_ms")]
    pub recorder_ms: u64,

    /// Budget for a single frame delivery to the viewer.
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_ms: u64,

    /// Grace period for in-flight dispatches while draining.
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_timeout_ms(),
            input_ms: None,
            recorder_ms: default_recorder_timeout_ms(),
            publish_ms: default_publish_timeout_ms(),
            drain_grace_ms: default_drain_grace_ms(),
        }
    }
}

/// Complete description of one training session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionConfig {
    /// Ticks per second. Must be greater than zero.
    #[serde(default = "default_tick_rate")]
    pub tick_rate: u32,

    /// Host the visualization endpoint listens on. Required.
    #[serde(default)]
    pub host: String,

    /// Port the visualization endpoint listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Agent targets (`host:port` for TCP agents).
    #[serde(default)]
    pub agents: Vec<String>,

    /// Host advertised to the viewer.
    #[serde(default = "default_viz_host")]
    pub viz_host: String,

    /// Destination file for the recording, if any.
    #[serde(default)]
    pub record_file: Option<PathBuf>,

    /// Map identifier.
    #[serde(default = "default_map")]
    pub map: String,

    /// Do not open the viewer automatically.
    #[serde(default)]
    pub no_browser: bool,

    /// Enable debug logging.
    #[serde(default)]
    pub debug: bool,

    /// Decrease verbosity.
    #[serde(default)]
    pub quiet: bool,

    /// Enable execution profiling.
    #[serde(default)]
    pub profile: bool,

    /// Capture every byte exchanged with agents.
    #[serde(default)]
    pub dump_raw_comm: bool,

    /// Capture file; standard error when unset.
    #[serde(default)]
    pub dump_file: Option<PathBuf>,

    /// Stop after this many seconds (0 = unbounded).
    #[serde(default)]
    pub duration_secs: u64,

    /// Consecutive missed ticks before an agent is dropped.
    #[serde(default = "default_miss_limit")]
    pub miss_limit: u32,

    /// Timeout settings.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_rate: default_tick_rate(),
            host: String::new(),
            port: default_port(),
            agents: Vec::new(),
            viz_host: default_viz_host(),
            record_file: None,
            map: default_map(),
            no_browser: false,
            debug: false,
            quiet: false,
            profile: false,
            dump_raw_comm: false,
            dump_file: None,
            duration_secs: 0,
            miss_limit: default_miss_limit(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// Environment variables override file values:
    /// - `ARENA_HOST` overrides `host`
    /// - `ARENA_PORT` overrides `port`
    /// - `ARENA_AGENTS` (comma-separated) overrides `agents`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Yaml`] if the content is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = serde_yml::from_str(&contents)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yml::from_str(yaml)?;
        Ok(config)
    }

    /// Override fields from `ARENA_*` environment variables when set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `ARENA_PORT` is not a port number.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("ARENA_HOST") {
            self.host = val;
        }
        if let Ok(val) = std::env::var("ARENA_PORT") {
            self.port = val.parse().map_err(|e| ConfigError::Invalid {
                reason: format!("invalid ARENA_PORT {val:?}: {e}"),
            })?;
        }
        if let Ok(val) = std::env::var("ARENA_AGENTS") {
            self.agents = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect();
        }
        Ok(())
    }

    /// Check every value a session depends on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate == 0 {
            return Err(invalid("tick rate must be greater than zero"));
        }
        if self.host.trim().is_empty() {
            return Err(invalid("host is required"));
        }
        if self.map.trim().is_empty() {
            return Err(invalid("map identifier must not be empty"));
        }
        if self.miss_limit == 0 {
            return Err(invalid("miss_limit must be at least 1"));
        }
        if self.timeouts.connect_ms == 0
            || self.timeouts.recorder_ms == 0
            || self.timeouts.publish_ms == 0
            || self.timeouts.drain_grace_ms == 0
            || self.timeouts.input_ms == Some(0)
        {
            return Err(invalid("timeouts must be greater than zero"));
        }
        if let Some(target) = self.agents.iter().find(|t| t.trim().is_empty()) {
            return Err(invalid(&format!("empty agent target {target:?}")));
        }
        Ok(())
    }

    /// Verbosity switches for this session.
    pub const fn verbosity(&self) -> Verbosity {
        Verbosity {
            debug: self.debug,
            quiet: self.quiet,
            profile: self.profile,
        }
    }

    /// Interval between tick boundaries (zero when the rate is invalid).
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(1)
            .checked_div(self.tick_rate)
            .unwrap_or(Duration::ZERO)
    }

    /// Maximum session duration, or `None` when unbounded.
    pub const fn max_duration(&self) -> Option<Duration> {
        if self.duration_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.duration_secs))
        }
    }

    /// Per-agent, per-tick input wait.
    pub fn input_timeout(&self) -> Duration {
        self.timeouts.input_ms.map_or_else(
            || {
                self.tick_interval()
                    .checked_div(2)
                    .unwrap_or(Duration::ZERO)
                    .max(Duration::from_millis(1))
            },
            Duration::from_millis,
        )
    }

    /// Per-agent connect and handshake timeout.
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.connect_ms)
    }

    /// Bound on blocking a tick for the recorder.
    pub const fn recorder_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.recorder_ms)
    }

    /// Bound on a single viewer delivery.
    pub const fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.publish_ms)
    }

    /// Grace period while draining.
    pub const fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.timeouts.drain_grace_ms)
    }

    /// Address the visualization endpoint binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// URL a viewer should open.
    pub fn viewer_url(&self) -> String {
        format!("http://{}:{}/", self.viz_host, self.port)
    }
}

fn invalid(reason: &str) -> ConfigError {
    ConfigError::Invalid {
        reason: reason.to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Default value functions (serde default requires named functions)
// ---------------------------------------------------------------------------

const fn default_tick_rate() -> u32 {
    20
}

const fn default_port() -> u16 {
    8080
}

fn default_viz_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_map() -> String {
    "hexagon".to_owned()
}

const fn default_miss_limit() -> u32 {
    3
}

const fn default_connect_timeout_ms() -> u64 {
    2_000
}

const fn default_recorder_timeout_ms() -> u64 {
    250
}

const fn default_publish_timeout_ms() -> u64 {
    250
}

const fn default_drain_grace_ms() -> u64 {
    1_000
}
