use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Lower bound for both adaptive timeouts.
pub const MIN_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound for every configured duration.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid environment override on line {line} of {path:?}: {content:?}")]
    EnvLine {
        path: PathBuf,
        line: usize,
        content: String,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Failure categories a session may choose to treat as uninteresting.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum IgnoreCategory {
    Timeout,
    Memory,
    LogLimit,
}

impl IgnoreCategory {
    /// Name of the artifact a target leaves behind when it is stopped for
    /// exceeding the matching resource limit.
    pub fn worker_artifact(&self) -> Option<&'static str> {
        match self {
            IgnoreCategory::Timeout => None,
            IgnoreCategory::Memory => Some("worker_memory_usage"),
            IgnoreCategory::LogLimit => Some("worker_log_size"),
        }
    }
}

pub type IgnoreSet = BTreeSet<IgnoreCategory>;

/// Environment overrides applied on launch. `None` removes the variable.
pub type EnvOverrides = BTreeMap<String, Option<String>>;

/// Parses `KEY=VALUE` lines. An empty value maps to an explicit unset.
pub fn parse_env_overrides(content: &str, origin: &Path) -> Result<EnvOverrides, ConfigError> {
    let mut overrides = EnvOverrides::new();
    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim_end();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(ConfigError::EnvLine {
                path: origin.to_path_buf(),
                line: idx + 1,
                content: line.to_string(),
            });
        };
        if key.is_empty() {
            return Err(ConfigError::EnvLine {
                path: origin.to_path_buf(),
                line: idx + 1,
                content: line.to_string(),
            });
        }
        let value = if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        };
        overrides.insert(key.to_string(), value);
    }
    Ok(overrides)
}

pub fn load_env_overrides(path: &Path) -> Result<EnvOverrides, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_env_overrides(&content, path)
}

/// Settings for one reduction session. Only `iter_timeout` and
/// `idle_timeout` change after construction, and they only ever shrink.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub ignore: IgnoreSet,
    pub iter_timeout: Duration,
    pub idle_threshold: f32,
    pub idle_poll: Duration,
    pub idle_timeout: Duration,
    pub no_harness: bool,
    pub any_crash: bool,
    pub skip: u32,
    pub min_crashes: u32,
    pub repeat: u32,
    pub result_cache: bool,
    pub launch_retry_delay: Duration,
    pub coverage: bool,
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.iter_timeout < MIN_TIMEOUT {
            return Err(ConfigError::Invalid(format!(
                "iter-timeout must be at least {}s",
                MIN_TIMEOUT.as_secs()
            )));
        }
        if self.idle_timeout < MIN_TIMEOUT {
            return Err(ConfigError::Invalid(format!(
                "idle-timeout must be at least {}s",
                MIN_TIMEOUT.as_secs()
            )));
        }
        let bounded = [
            ("iter-timeout", self.iter_timeout),
            ("idle-timeout", self.idle_timeout),
            ("idle-poll", self.idle_poll),
            ("launch-retry-delay", self.launch_retry_delay),
        ];
        for (name, value) in bounded {
            if value > MAX_TIMEOUT {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be at most {}s",
                    MAX_TIMEOUT.as_secs()
                )));
            }
        }
        if self.min_crashes == 0 || self.repeat == 0 {
            return Err(ConfigError::Invalid(
                "min-crashes and repeat must be at least 1".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.idle_threshold) {
            return Err(ConfigError::Invalid(format!(
                "idle-threshold {} is not a CPU percentage",
                self.idle_threshold
            )));
        }
        Ok(())
    }

    /// Number of trials a single evaluation may run.
    pub fn max_trials(&self) -> u32 {
        self.repeat.max(self.min_crashes)
    }

    /// Shrinks the adaptive timeouts toward the observed run time.
    /// Returns `true` when `iter_timeout` changed.
    pub fn shrink_timeouts(&mut self, elapsed: Duration) -> bool {
        log::debug!("Run took {:?}", elapsed);
        let new_idle = elapsed.mul_f64(1.5).min(self.idle_timeout).max(MIN_TIMEOUT);
        if new_idle < self.idle_timeout {
            log::info!("Updating poll timeout to: {:?}", new_idle);
            self.idle_timeout = new_idle;
        }
        let new_iter = elapsed.mul_f64(2.0).min(self.iter_timeout).max(MIN_TIMEOUT);
        if new_iter < self.iter_timeout {
            log::info!("Updating max timeout to: {:?}", new_iter);
            self.iter_timeout = new_iter;
            return true;
        }
        false
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    pub binary: PathBuf,
    #[serde(default = "default_target_args")]
    pub args: Vec<String>,
    #[serde(default = "default_launch_timeout_secs")]
    pub launch_timeout_secs: u64,
    /// Output line that marks the target as ready; launch waits for it.
    pub ready_pattern: Option<String>,
    #[serde(default)]
    pub log_limit_bytes: u64,
    #[serde(default)]
    pub memory_limit_bytes: u64,
    #[serde(default = "default_relaunch")]
    pub relaunch: u32,
    pub env_file: Option<PathBuf>,
    #[serde(default)]
    pub coverage: bool,
}

fn default_target_args() -> Vec<String> {
    vec!["{url}".to_string()]
}

fn default_launch_timeout_secs() -> u64 {
    300
}

pub fn default_relaunch() -> u32 {
    1000
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ReduceSettings {
    #[serde(default)]
    pub ignore: Vec<IgnoreCategory>,
    #[serde(default = "default_iter_timeout_secs")]
    pub iter_timeout_secs: u64,
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold: f32,
    #[serde(default = "default_idle_poll_secs")]
    pub idle_poll_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default)]
    pub no_harness: bool,
    #[serde(default)]
    pub any_crash: bool,
    #[serde(default)]
    pub skip: u32,
    #[serde(default = "default_one")]
    pub min_crashes: u32,
    #[serde(default = "default_one")]
    pub repeat: u32,
    #[serde(default = "default_true")]
    pub result_cache: bool,
    #[serde(default = "default_launch_retry_delay_secs")]
    pub launch_retry_delay_secs: u64,
    pub harness: Option<PathBuf>,
    pub signature: Option<PathBuf>,
}

fn default_iter_timeout_secs() -> u64 {
    60
}
fn default_idle_threshold() -> f32 {
    25.0
}
fn default_idle_poll_secs() -> u64 {
    3
}
fn default_idle_timeout_secs() -> u64 {
    60
}
fn default_one() -> u32 {
    1
}
fn default_true() -> bool {
    true
}
fn default_launch_retry_delay_secs() -> u64 {
    15
}

impl Default for ReduceSettings {
    fn default() -> Self {
        Self {
            ignore: Vec::new(),
            iter_timeout_secs: default_iter_timeout_secs(),
            idle_threshold: default_idle_threshold(),
            idle_poll_secs: default_idle_poll_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            no_harness: false,
            any_crash: false,
            skip: 0,
            min_crashes: default_one(),
            repeat: default_one(),
            result_cache: true,
            launch_retry_delay_secs: default_launch_retry_delay_secs(),
            harness: None,
            signature: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SifterConfig {
    pub target: TargetSettings,
    #[serde(default)]
    pub reduce: ReduceSettings,
}

impl SifterConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Builds the validated session settings.
    pub fn run_config(&self) -> Result<RunConfig, ConfigError> {
        let reduce = &self.reduce;
        let run = RunConfig {
            ignore: reduce.ignore.iter().copied().collect(),
            iter_timeout: Duration::from_secs(reduce.iter_timeout_secs),
            idle_threshold: reduce.idle_threshold,
            idle_poll: Duration::from_secs(reduce.idle_poll_secs),
            idle_timeout: Duration::from_secs(reduce.idle_timeout_secs),
            no_harness: reduce.no_harness,
            any_crash: reduce.any_crash,
            skip: reduce.skip,
            min_crashes: reduce.min_crashes,
            repeat: reduce.repeat,
            result_cache: reduce.result_cache,
            launch_retry_delay: Duration::from_secs(reduce.launch_retry_delay_secs),
            coverage: self.target.coverage,
        };
        run.validate()?;
        Ok(run)
    }
}
