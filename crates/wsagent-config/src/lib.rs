//! Configuration for the workspace agent's file watcher.
//!
//! The configuration is a small TOML document with two tables:
//!
//! ```toml
//! [watcher]
//! excludes = ["**/.git", "**/.git/**"]
//! events_queue_capacity = 1024
//! stop_poll_attempts = 20
//! stop_poll_interval_ms = 25
//!
//! [logging]
//! level = "info"
//! json = false
//! stderr = true
//! ```
//!
//! Every key has a default, so an empty document (or no document at all) is valid.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use parking_lot::ReentrantMutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod logging;
mod validation;

pub use logging::init_tracing;
pub use validation::ConfigWarning;

/// Environment variable that overrides config discovery.
pub const WSAGENT_CONFIG_ENV_VAR: &str = "WSAGENT_CONFIG_PATH";

/// Workspace-relative location of the watcher config file.
pub const WORKSPACE_CONFIG_FILE: &str = ".wsagent/watcher.toml";

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` includes a snippet of the input; keep only the message.
        ConfigError::Toml(err.message().to_owned())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatcherConfig {
    #[serde(default)]
    pub watcher: WatchSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchSettings {
    /// Glob patterns (matched against absolute paths) whose events are never delivered.
    ///
    /// Matching directories are also skipped when the tree is walked for pattern subscriptions.
    #[serde(default = "WatchSettings::default_excludes")]
    pub excludes: Vec<String>,

    /// Capacity of the bounded queue between the OS watcher and the consumption loop.
    ///
    /// `0` keeps the backend default.
    #[serde(default = "WatchSettings::default_events_queue_capacity")]
    pub events_queue_capacity: usize,

    /// How many times `wait_until_stopped` checks the loop state before giving up.
    #[serde(default = "WatchSettings::default_stop_poll_attempts")]
    pub stop_poll_attempts: u32,

    /// Base delay between stop checks; the n-th check waits `n * interval`.
    #[serde(default = "WatchSettings::default_stop_poll_interval_ms")]
    pub stop_poll_interval_ms: u64,
}

impl WatchSettings {
    fn default_excludes() -> Vec<String> {
        vec!["**/.git".to_owned(), "**/.git/**".to_owned()]
    }

    fn default_events_queue_capacity() -> usize {
        1024
    }

    fn default_stop_poll_attempts() -> u32 {
        20
    }

    fn default_stop_poll_interval_ms() -> u64 {
        25
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            excludes: Self::default_excludes(),
            events_queue_capacity: Self::default_events_queue_capacity(),
            stop_poll_attempts: Self::default_stop_poll_attempts(),
            stop_poll_interval_ms: Self::default_stop_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// A simple level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs in JSON format.
    #[serde(default)]
    pub json: bool,

    /// Write logs to stderr.
    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Append logs to the given file path.
    ///
    /// If the file cannot be opened, file logging is disabled while other sinks remain active.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    pub(crate) fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// Builds the effective filter; `RUST_LOG` directives are appended when set.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
        }
    }
}

impl WatcherConfig {
    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

static CONFIG_ENV_LOCK: OnceLock<ReentrantMutex<()>> = OnceLock::new();

fn config_env_lock() -> &'static ReentrantMutex<()> {
    CONFIG_ENV_LOCK.get_or_init(|| ReentrantMutex::new(()))
}

/// Run `f` while holding the config environment lock.
///
/// Tests that temporarily set [`WSAGENT_CONFIG_ENV_VAR`] wrap the mutation and the discovery
/// call in this helper so concurrent discovery in other threads never observes the override.
pub fn with_config_env_lock<R>(f: impl FnOnce() -> R) -> R {
    let _guard = config_env_lock().lock();
    f()
}

/// Discover the watcher configuration file for a workspace root.
///
/// Search order:
/// 1) `WSAGENT_CONFIG_PATH` (absolute or relative to `workspace_root`)
/// 2) `.wsagent/watcher.toml` in `workspace_root`
pub fn discover_config_path(workspace_root: &Path) -> Option<PathBuf> {
    let _guard = config_env_lock().lock();
    if let Some(value) = std::env::var_os(WSAGENT_CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(value);
        let path = if candidate.is_absolute() {
            candidate
        } else {
            workspace_root.join(candidate)
        };
        return Some(path.canonicalize().unwrap_or(path));
    }

    let path = workspace_root.join(WORKSPACE_CONFIG_FILE);
    path.is_file().then(|| path.canonicalize().unwrap_or(path))
}

/// Load the watcher configuration for a workspace root.
///
/// If no config is present, returns [`WatcherConfig::default`] and `None`.
pub fn load_for_workspace(workspace_root: &Path) -> Result<(WatcherConfig, Option<PathBuf>)> {
    let Some(path) = discover_config_path(workspace_root) else {
        return Ok((WatcherConfig::default(), None));
    };

    let config = WatcherConfig::load_from_path(&path)?;
    tracing::debug!(target: "wsagent.config", path = %path.display(), "loaded watcher config");
    Ok((config, Some(path)))
}
