use std::ffi::OsString;

use wsagent_config::{
    discover_config_path, load_for_workspace, with_config_env_lock, ConfigError, WatcherConfig,
    WORKSPACE_CONFIG_FILE, WSAGENT_CONFIG_ENV_VAR,
};
use tempfile::tempdir;

struct EnvVarGuard {
    key: &'static str,
    prev: Option<OsString>,
}

impl EnvVarGuard {
    fn set(key: &'static str, value: impl Into<OsString>) -> Self {
        let prev = std::env::var_os(key);
        std::env::set_var(key, value.into());
        Self { key, prev }
    }

    fn unset(key: &'static str) -> Self {
        let prev = std::env::var_os(key);
        std::env::remove_var(key);
        Self { key, prev }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(v) => std::env::set_var(self.key, v),
            None => std::env::remove_var(self.key),
        }
    }
}

fn write_workspace_config(root: &std::path::Path, text: &str) -> std::path::PathBuf {
    let path = root.join(WORKSPACE_CONFIG_FILE);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, text).unwrap();
    path
}

#[test]
fn discovers_workspace_config() {
    with_config_env_lock(|| {
        let _env = EnvVarGuard::unset(WSAGENT_CONFIG_ENV_VAR);
        let dir = tempdir().unwrap();
        let path = write_workspace_config(dir.path(), "[watcher]\nstop_poll_attempts = 5\n");

        let discovered = discover_config_path(dir.path()).expect("config should be discovered");
        assert_eq!(discovered, path.canonicalize().unwrap_or(path));

        let (config, found) = load_for_workspace(dir.path()).unwrap();
        assert_eq!(found, Some(discovered));
        assert_eq!(config.watcher.stop_poll_attempts, 5);
    });
}

#[test]
fn missing_config_yields_defaults() {
    with_config_env_lock(|| {
        let _env = EnvVarGuard::unset(WSAGENT_CONFIG_ENV_VAR);
        let dir = tempdir().unwrap();

        assert_eq!(discover_config_path(dir.path()), None);
        let (config, found) = load_for_workspace(dir.path()).unwrap();
        assert_eq!(found, None);
        assert_eq!(config, WatcherConfig::default());
    });
}

#[test]
fn env_var_overrides_workspace_config() {
    with_config_env_lock(|| {
        let dir = tempdir().unwrap();
        write_workspace_config(dir.path(), "[watcher]\nstop_poll_attempts = 5\n");
        let custom = dir.path().join("custom.toml");
        std::fs::write(&custom, "[logging]\nlevel = \"debug\"\n").unwrap();

        // Relative values resolve against the workspace root.
        let _env = EnvVarGuard::set(WSAGENT_CONFIG_ENV_VAR, "custom.toml");

        let discovered = discover_config_path(dir.path()).expect("override should win");
        assert_eq!(discovered, custom.canonicalize().unwrap_or(custom));

        let (config, _) = load_for_workspace(dir.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.watcher.stop_poll_attempts, 20);
    });
}

#[test]
fn env_var_pointing_at_missing_file_is_an_io_error() {
    with_config_env_lock(|| {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let _env = EnvVarGuard::set(WSAGENT_CONFIG_ENV_VAR, missing.as_os_str());

        let err = load_for_workspace(dir.path()).expect_err("missing override should fail");
        assert!(matches!(err, ConfigError::Io { .. }), "{err:?}");
    });
}
