//! Mount-time configuration: the JSON layer-enablement file plus the
//! `clap`-derived CLI surface for mount options.
//!
//! The JSON file (path from `--config` or the `CONFIG` environment
//! variable) names which interception layers are present and tunes
//! fault/throttle parameters. CLI flags own the mount-option surface
//! (source, caching, writeback, ...) and always win over anything a
//! config file could say about them — the two surfaces are disjoint by
//! design, not merged key-by-key.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::layers::fault::{FaultConfig, SeedPolicy};
use crate::layers::throttle::ThrottleConfig;
use crate::passthrough::CacheMode;

/// Command-line surface: `<mountpoint>` plus the mount-option flags.
#[derive(Debug, Parser)]
#[command(name = "interposer-mount", about = "Composable FUSE passthrough filesystem", version)]
pub struct Cli {
    /// Directory to mount the filesystem at.
    pub mountpoint: PathBuf,

    /// Directory the passthrough layer serves requests against.
    #[arg(long)]
    pub source: PathBuf,

    /// Path to the JSON layer-configuration file (overrides `CONFIG`).
    #[arg(long, env = "CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable the `FUSE_WRITEBACK_CACHE` kernel capability.
    #[arg(long, conflicts_with = "no_writeback")]
    pub writeback: bool,
    #[arg(long, hide = true)]
    pub no_writeback: bool,

    /// Enable kernel-side BSD `flock` emulation.
    #[arg(long, conflicts_with = "no_flock")]
    pub flock: bool,
    #[arg(long, hide = true)]
    pub no_flock: bool,

    /// Serve extended attributes.
    #[arg(long, conflicts_with = "no_xattr")]
    pub xattr: bool,
    #[arg(long, hide = true)]
    pub no_xattr: bool,

    /// Attribute/entry cache timeout, in seconds.
    #[arg(long, default_value_t = 1)]
    pub timeout: u64,

    /// Kernel caching aggressiveness for this mount.
    #[arg(long, value_enum, default_value_t = CacheArg::Auto)]
    pub cache: CacheArg,

    /// Run in the foreground instead of daemonizing.
    #[arg(long)]
    pub foreground: bool,

    /// Raise this crate's own tracing spans to debug level.
    #[arg(long)]
    pub debug: bool,

    /// Service requests from a single thread instead of `fuser`'s pool.
    #[arg(long)]
    pub single_threaded: bool,

    /// Use `/dev/fuse` clone-fd support for the session channel.
    #[arg(long)]
    pub clone_fd: bool,

    /// Maximum worker threads when not single-threaded.
    #[arg(long)]
    pub max_threads: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CacheArg {
    Never,
    Auto,
    Always,
}

impl From<CacheArg> for CacheMode {
    fn from(arg: CacheArg) -> Self {
        match arg {
            CacheArg::Never => CacheMode::Never,
            CacheArg::Auto => CacheMode::Auto,
            CacheArg::Always => CacheMode::Always,
        }
    }
}

impl Cli {
    /// Resolves the `*`/`no_*` flag pairs: an explicit `--no-*` always
    /// wins, otherwise `--*` opts in, otherwise the option's own default
    /// applies (off for writeback/flock, on for xattr, matching
    /// [`crate::passthrough::PassthroughOptions::default`]).
    #[must_use]
    pub fn writeback_enabled(&self) -> bool {
        self.writeback && !self.no_writeback
    }

    #[must_use]
    pub fn flock_enabled(&self) -> bool {
        self.flock && !self.no_flock
    }

    #[must_use]
    pub fn xattr_enabled(&self) -> bool {
        !self.no_xattr
    }
}

/// The JSON layer-configuration schema, one struct per top-level key.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub traces: TracesConfig,
    pub metrics: MetricsConfig,
    #[serde(rename = "faultyIO")]
    pub faulty_io: FaultyIoConfig,
    #[serde(rename = "throttleIO")]
    pub throttle_io: ThrottleIoConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TracesConfig {
    pub enabled: bool,
}

impl Default for TracesConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FaultyIoConfig {
    pub enabled: bool,
    pub file_fail_rate: u32,
    pub directory_fail_rate: u32,
    pub delay_time: u64,
    pub use_seednum: bool,
    pub seed: u64,
    pub local_log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThrottleIoConfig {
    pub enabled: bool,
    pub read_capacity: Option<u64>,
    pub read_rate: Option<u64>,
    pub write_capacity: Option<u64>,
    pub write_rate: Option<u64>,
    pub replenish_interval_ms: Option<u64>,
}

impl Default for ThrottleIoConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            read_capacity: None,
            read_rate: None,
            write_capacity: None,
            write_rate: None,
            replenish_interval_ms: None,
        }
    }
}

/// Error surfaced by [`Config::load`]; maps onto §7's "configuration
/// errors" taxonomy entry (logged, process exits with code 1).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("mountpoint {0} does not exist")]
    MissingMountpoint(PathBuf),
    #[error("source directory {0} does not exist")]
    MissingSource(PathBuf),
}

impl Config {
    /// Loads the JSON config from `path`, or returns the all-defaults
    /// configuration when `path` is `None` (layers not enabled are simply
    /// omitted from the stack — there is no requirement that a config
    /// file exist).
    pub fn load(path: Option<&PathBuf>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })
    }

    /// Builds the fault-injection layer config, applying §6's defaults for
    /// keys the JSON schema leaves unstated.
    #[must_use]
    pub fn fault_config(&self, log_path_default: &Path) -> FaultConfig {
        let seed = if self.faulty_io.use_seednum {
            SeedPolicy::Fixed(self.faulty_io.seed)
        } else {
            SeedPolicy::TimeDerived
        };
        FaultConfig {
            file_fail_rate: self.faulty_io.file_fail_rate,
            directory_fail_rate: self.faulty_io.directory_fail_rate,
            delay: Duration::from_secs(self.faulty_io.delay_time),
            seed,
            log_path: self
                .faulty_io
                .local_log_path
                .clone()
                .unwrap_or_else(|| log_path_default.to_path_buf()),
        }
    }

    /// Builds the throttling layer config, defaulting absent capacity/rate
    /// keys to `4096` and the replenishment interval to 100ms, per §6's
    /// resolution of the distilled schema's silence on those knobs.
    #[must_use]
    pub fn throttle_config(&self) -> ThrottleConfig {
        let t = &self.throttle_io;
        ThrottleConfig {
            read_capacity: t.read_capacity.unwrap_or(4096),
            read_rate: t.read_rate.unwrap_or(4096),
            write_capacity: t.write_capacity.unwrap_or(4096),
            write_rate: t.write_rate.unwrap_or(4096),
            replenish_interval: Duration::from_millis(t.replenish_interval_ms.unwrap_or(100)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_traces_and_metrics_only() {
        let config = Config::default();
        assert!(config.traces.enabled);
        assert!(config.metrics.enabled);
        assert!(!config.faulty_io.enabled);
        assert!(!config.throttle_io.enabled);
    }

    #[test]
    fn missing_config_path_yields_defaults() {
        let config = Config::load(None).unwrap();
        assert!(!config.faulty_io.enabled);
    }

    #[test]
    fn parses_full_schema() {
        let json = r#"{
            "traces": {"enabled": false},
            "metrics": {"enabled": true},
            "faultyIO": {
                "enabled": true,
                "file_fail_rate": 2,
                "directory_fail_rate": 10,
                "delay_time": 1,
                "use_seednum": true,
                "seed": 42,
                "local_log_path": "/tmp/faults.log"
            },
            "throttleIO": {
                "enabled": true,
                "read_capacity": 8192,
                "read_rate": 4096,
                "replenish_interval_ms": 50
            }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(!config.traces.enabled);
        assert!(config.faulty_io.enabled);
        assert_eq!(config.faulty_io.file_fail_rate, 2);
        assert_eq!(config.faulty_io.seed, 42);
        assert!(config.throttle_io.enabled);
        assert_eq!(config.throttle_io.read_capacity, Some(8192));
        assert_eq!(config.throttle_io.replenish_interval_ms, Some(50));
    }

    #[test]
    fn throttle_config_defaults_absent_keys_to_4096() {
        let config = Config::default();
        let tc = config.throttle_config();
        assert_eq!(tc.read_capacity, 4096);
        assert_eq!(tc.write_rate, 4096);
        assert_eq!(tc.replenish_interval, Duration::from_millis(100));
    }

    #[test]
    fn fault_config_derives_fixed_seed_when_use_seednum() {
        let mut config = Config::default();
        config.faulty_io.use_seednum = true;
        config.faulty_io.seed = 7;
        let fc = config.fault_config(Path::new("/tmp/default.log"));
        matches!(fc.seed, SeedPolicy::Fixed(7));
    }

    #[test]
    fn cache_arg_maps_to_cache_mode() {
        assert_eq!(CacheMode::from(CacheArg::Never), CacheMode::Never);
        assert_eq!(CacheMode::from(CacheArg::Always), CacheMode::Always);
    }
}
