use std::fmt;

use crate::{LoggingConfig, WatcherConfig};

/// Non-fatal problems found in an otherwise loadable configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    EmptyExcludePattern { index: usize },
    InvalidExcludePattern { pattern: String, message: String },
    StopPollAttemptsZero,
    LoggingLevelInvalid { level: String, message: String },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::EmptyExcludePattern { index } => {
                write!(f, "watcher.excludes[{index}] is empty and matches nothing")
            }
            ConfigWarning::InvalidExcludePattern { pattern, message } => {
                write!(f, "watcher.excludes entry {pattern:?} is not a valid glob: {message}")
            }
            ConfigWarning::StopPollAttemptsZero => f.write_str(
                "watcher.stop_poll_attempts is 0; stopping will never be observed as complete",
            ),
            ConfigWarning::LoggingLevelInvalid { level, message } => {
                write!(f, "logging.level {level:?} is invalid ({message}); falling back to info")
            }
        }
    }
}

impl WatcherConfig {
    /// Validate semantic invariants for a configuration.
    ///
    /// Validation is best-effort: it reports as many problems as possible in one pass.
    #[must_use]
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut out = Vec::new();
        validate_excludes(self, &mut out);
        validate_stop_policy(self, &mut out);
        validate_logging(self, &mut out);
        out
    }
}

fn validate_excludes(config: &WatcherConfig, out: &mut Vec<ConfigWarning>) {
    for (index, pattern) in config.watcher.excludes.iter().enumerate() {
        if pattern.trim().is_empty() {
            out.push(ConfigWarning::EmptyExcludePattern { index });
            continue;
        }
        if let Err(err) = globset::Glob::new(pattern) {
            out.push(ConfigWarning::InvalidExcludePattern {
                pattern: pattern.clone(),
                message: err.kind().to_string(),
            });
        }
    }
}

fn validate_stop_policy(config: &WatcherConfig, out: &mut Vec<ConfigWarning>) {
    if config.watcher.stop_poll_attempts == 0 {
        out.push(ConfigWarning::StopPollAttemptsZero);
    }
}

fn validate_logging(config: &WatcherConfig, out: &mut Vec<ConfigWarning>) {
    let normalized = LoggingConfig::normalize_level_directives(&config.logging.level);
    if let Err(err) = tracing_subscriber::EnvFilter::try_new(normalized) {
        out.push(ConfigWarning::LoggingLevelInvalid {
            level: config.logging.level.clone(),
            message: err.to_string(),
        });
    }
}
