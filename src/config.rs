//! Configuration: transport limits, pool defaults, and the option set
//! forwarded to daemons.
//!
//! Layering: built-in defaults, then `config.toml` from the config
//! directory (override with `TM_CONFIG`), then environment overrides.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid dispatcher mode {0:?} (expected none, process, or thread)")]
    InvalidDispatcher(String),
    #[error("unknown daemon option {key:?}")]
    InvalidOption { key: String },
    #[error("daemon option {key:?} rejects value {value:?} (must be boolean or numeric)")]
    InvalidOptionValue { key: String, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub defaults: DefaultsConfig,
    pub limits: Limits,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub dispatcher: DispatcherMode,
    pub retry: bool,
    pub preload: Vec<String>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherMode::Process,
            retry: false,
            preload: Vec::new(),
        }
    }
}

/// Bounds shared by every socket and loop in the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_frame_bytes: usize,
    pub send_queue_depth: usize,
    pub event_ring_capacity: usize,
    pub long_timeout_ms: u64,
    pub accept_poll_ms: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_bytes: 8 * 1024 * 1024,
            send_queue_depth: 128,
            event_ring_capacity: 256,
            long_timeout_ms: 10_000,
            accept_poll_ms: 25,
        }
    }
}

impl Limits {
    /// The "long" timeout: daemon dial-in waits and the dispatcher
    /// handshake.
    pub fn long_timeout(&self) -> Duration {
        Duration::from_millis(self.long_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stderr: bool,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stderr: true,
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherMode {
    None,
    Process,
    Thread,
}

impl DispatcherMode {
    /// Accepts the boolean spellings alongside the explicit modes:
    /// `false`/`none`, `true`/`process`, `thread`.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        match input.trim().to_ascii_lowercase().as_str() {
            "none" | "false" => Ok(DispatcherMode::None),
            "process" | "true" => Ok(DispatcherMode::Process),
            "thread" => Ok(DispatcherMode::Thread),
            _ => Err(ConfigError::InvalidDispatcher(input.to_string())),
        }
    }

    pub fn uses_dispatcher(self) -> bool {
        self != DispatcherMode::None
    }
}

/// A daemon option value. Anything that is neither boolean nor numeric
/// is rejected, never silently dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionValue {
    Bool(bool),
    Number(u64),
}

impl OptionValue {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "true" | "TRUE" | "True" => Some(OptionValue::Bool(true)),
            "false" | "FALSE" | "False" => Some(OptionValue::Bool(false)),
            other => other.parse::<u64>().ok().map(OptionValue::Number),
        }
    }
}

/// Options forwarded to launched daemons.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonOptions {
    /// Dial without blocking on connection success.
    pub asyncdial: bool,
    /// Exit on pipe drop; `false` survives host shutdown.
    pub autoexit: bool,
    /// Free per-task state between tasks.
    pub cleanup: bool,
    /// Inherit the host's stdout/stderr instead of discarding.
    pub output: bool,
    /// Exit after handling this many tasks.
    pub maxtasks: Option<u64>,
    /// Exit after this idle duration (milliseconds).
    pub idletime: Option<u64>,
    /// Exit after this wall-clock duration (milliseconds).
    pub walltime: Option<u64>,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            asyncdial: false,
            autoexit: true,
            cleanup: true,
            output: false,
            maxtasks: None,
            idletime: None,
            walltime: None,
        }
    }
}

impl DaemonOptions {
    /// Build from loosely-typed `key = value` pairs (the embedder-facing
    /// option map). Unknown keys and mistyped values are errors.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a str, OptionValue)>,
    {
        let mut options = DaemonOptions::default();
        for (key, value) in pairs {
            match (key, value) {
                ("asyncdial", OptionValue::Bool(v)) => options.asyncdial = v,
                ("autoexit", OptionValue::Bool(v)) => options.autoexit = v,
                ("cleanup", OptionValue::Bool(v)) => options.cleanup = v,
                ("output", OptionValue::Bool(v)) => options.output = v,
                ("maxtasks", OptionValue::Number(v)) => options.maxtasks = Some(v),
                ("idletime", OptionValue::Number(v)) => options.idletime = Some(v),
                ("walltime", OptionValue::Number(v)) => options.walltime = Some(v),
                ("asyncdial" | "autoexit" | "cleanup" | "output", OptionValue::Number(v)) => {
                    return Err(ConfigError::InvalidOptionValue {
                        key: key.to_string(),
                        value: v.to_string(),
                    });
                }
                ("maxtasks" | "idletime" | "walltime", OptionValue::Bool(v)) => {
                    return Err(ConfigError::InvalidOptionValue {
                        key: key.to_string(),
                        value: v.to_string(),
                    });
                }
                (other, _) => {
                    return Err(ConfigError::InvalidOption {
                        key: other.to_string(),
                    });
                }
            }
        }
        Ok(options)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idletime.map(Duration::from_millis)
    }

    pub fn wall_timeout(&self) -> Option<Duration> {
        self.walltime.map(Duration::from_millis)
    }
}

/// Parse a loosely-typed option map (string values) into [`DaemonOptions`].
pub fn parse_option_map(map: &BTreeMap<String, String>) -> Result<DaemonOptions, ConfigError> {
    let mut pairs = Vec::with_capacity(map.len());
    for (key, value) in map {
        let parsed = OptionValue::parse(value).ok_or_else(|| ConfigError::InvalidOptionValue {
            key: key.clone(),
            value: value.clone(),
        })?;
        pairs.push((key.as_str(), parsed));
    }
    DaemonOptions::from_pairs(pairs)
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("TM_CONFIG") {
        return PathBuf::from(path);
    }
    crate::paths::config_dir().join("config.toml")
}

pub fn load() -> Result<Config, ConfigError> {
    let path = config_path();
    if !path.exists() {
        let mut config = Config::default();
        apply_env_overrides(&mut config);
        return Ok(config);
    }
    let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    let mut config: Config =
        toml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })?;
    apply_env_overrides(&mut config);
    Ok(config)
}

pub fn load_or_default() -> Config {
    match load() {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("config load failed, using defaults: {err}");
            Config::default()
        }
    }
}

pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(mode) = std::env::var("TM_DISPATCHER")
        && let Ok(mode) = DispatcherMode::parse(&mode)
    {
        config.defaults.dispatcher = mode;
    }
    if let Ok(retry) = std::env::var("TM_RETRY")
        && let Some(OptionValue::Bool(retry)) = OptionValue::parse(&retry)
    {
        config.defaults.retry = retry;
    }
}
