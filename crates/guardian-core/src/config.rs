//! Configuration management (guardian.toml).
//!
//! Every section is optional; a missing file yields [`Config::default`].
//! Paths are resolved against the XDG directories reported by `dirs`, with
//! environment overrides for the config file and the state directory.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::crash::ThresholdConfig;
use crate::{Error, Result};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "GUARDIAN_CONFIG";

/// Environment variable overriding the state directory.
pub const STATE_DIR_ENV: &str = "GUARDIAN_STATE_DIR";

/// Directory name used under the XDG config/state roots.
const APP_DIR: &str = "guardian";

/// Default PATH inside the failsafe environment.
pub const DEFAULT_FAILSAFE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub threshold: ThresholdConfig,
    pub paths: PathsConfig,
    pub log: LogStoreConfig,
    pub failsafe: FailsafeConfig,
    pub keeper: KeeperConfig,
}

/// Well-known file locations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding the crash log, keeper state, and service lock.
    pub state_dir: Option<PathBuf>,
    /// Replica manifest location.
    pub manifest: Option<PathBuf>,
}

/// Crash log bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogStoreConfig {
    /// Rotate the crash log once it grows past this many bytes.
    pub max_bytes: u64,
    /// Number of trailing events handed to the detector. Never less than
    /// `threshold.max_events`.
    pub history: usize,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024,
            history: 100,
        }
    }
}

/// Failsafe environment settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailsafeConfig {
    /// Preferred recovery shell; `$SHELL` and `/bin/bash` are tried otherwise.
    pub shell: Option<PathBuf>,
    /// PATH exported inside the failsafe session.
    pub path: String,
}

impl Default for FailsafeConfig {
    fn default() -> Self {
        Self {
            shell: None,
            path: DEFAULT_FAILSAFE_PATH.to_string(),
        }
    }
}

/// Integrity monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeeperConfig {
    /// Seconds between reconcile passes in service mode.
    pub interval_secs: u64,
    /// Deadline for checking a single replica.
    pub check_timeout_ms: u64,
    /// Delay before the single rename retry.
    pub rename_retry_backoff_ms: u64,
    /// Replica paths used by `install` when none are given explicitly.
    pub replicas: Vec<PathBuf>,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            check_timeout_ms: 5_000,
            rename_retry_backoff_ms: 250,
            replicas: default_replica_paths(),
        }
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"))
}

/// Default replica locations: three independent directories under $HOME.
#[must_use]
pub fn default_replica_paths() -> Vec<PathBuf> {
    let home = home_dir();
    vec![
        home.join(".local").join("bin").join("supervisor"),
        home.join(".local").join("share").join(APP_DIR).join("supervisor"),
        home.join(".config").join(APP_DIR).join("bin").join("supervisor"),
    ]
}

/// Default config directory (`$XDG_CONFIG_HOME/guardian`).
#[must_use]
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| home_dir().join(".config"))
        .join(APP_DIR)
}

/// Resolve the config file path: explicit argument, then `GUARDIAN_CONFIG`,
/// then the default location.
#[must_use]
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(path);
    }
    default_config_dir().join("guardian.toml")
}

impl Config {
    /// Parse a config from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let mut config: Self =
            toml::from_str(text).map_err(|e| Error::Config(format!("invalid TOML: {e}")))?;
        config.threshold = config.threshold.normalized();
        // A shorter history could never reach the threshold
        config.log.history = config
            .log
            .history
            .max(config.threshold.max_events as usize);
        Ok(config)
    }

    /// Load the config from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text)
                .map_err(|e| Error::Config(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::Config(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    /// Load the config, falling back to defaults on any error.
    ///
    /// Used on the launch path, which must never be blocked by a bad file.
    #[must_use]
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unreadable config; using defaults");
                Self::default()
            }
        }
    }

    /// Directory for crash log, keeper state, and lock files.
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        if let Some(dir) = std::env::var_os(STATE_DIR_ENV).filter(|v| !v.is_empty()) {
            return PathBuf::from(dir);
        }
        if let Some(dir) = &self.paths.state_dir {
            return dir.clone();
        }
        dirs::state_dir()
            .unwrap_or_else(|| home_dir().join(".local").join("state"))
            .join(APP_DIR)
    }

    /// Crash log file.
    #[must_use]
    pub fn crash_log_path(&self) -> PathBuf {
        self.state_dir().join("crash.log")
    }

    /// Persisted keeper state.
    #[must_use]
    pub fn keeper_state_path(&self) -> PathBuf {
        self.state_dir().join("keeper-state.json")
    }

    /// Keeper service single-instance lock.
    #[must_use]
    pub fn keeper_lock_path(&self) -> PathBuf {
        self.state_dir().join("keeper.lock")
    }

    /// Replica manifest.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.paths
            .manifest
            .clone()
            .unwrap_or_else(|| default_config_dir().join("replicas.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.threshold, ThresholdConfig::default());
        assert_eq!(config.log.max_bytes, 10 * 1024);
        assert_eq!(config.log.history, 100);
        assert_eq!(config.failsafe.path, DEFAULT_FAILSAFE_PATH);
        assert_eq!(config.keeper.interval_secs, 60);
        assert_eq!(config.keeper.replicas.len(), 3);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = Config::from_toml(
            r#"
[threshold]
window_seconds = 30

[failsafe]
shell = "/bin/sh"

[paths]
state_dir = "/var/tmp/guardian-test"
"#,
        )
        .unwrap();
        assert_eq!(config.threshold.max_events, 3);
        assert_eq!(config.threshold.window_seconds, 30);
        assert_eq!(config.failsafe.shell, Some(PathBuf::from("/bin/sh")));
        assert_eq!(config.failsafe.path, DEFAULT_FAILSAFE_PATH);
        assert_eq!(config.keeper.check_timeout_ms, 5_000);
    }

    #[test]
    fn threshold_is_normalized_on_load() {
        let config = Config::from_toml("[threshold]\nmax_events = 1\n").unwrap();
        assert_eq!(config.threshold.max_events, 2);
    }

    #[test]
    fn history_is_raised_to_max_events() {
        let config =
            Config::from_toml("[threshold]\nmax_events = 5\n\n[log]\nhistory = 3\n").unwrap();
        assert_eq!(config.log.history, 5);

        let config = Config::from_toml("[log]\nhistory = 0\n").unwrap();
        assert_eq!(config.log.history, 3);

        let config = Config::from_toml("[log]\nhistory = 500\n").unwrap();
        assert_eq!(config.log.history, 500);
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = Config::from_toml("threshold = [").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.keeper.rename_retry_backoff_ms, 250);
    }

    #[test]
    fn load_or_default_swallows_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guardian.toml");
        fs::write(&path, "[threshold\n").unwrap();
        assert!(Config::load(&path).is_err());
        let config = Config::load_or_default(&path);
        assert_eq!(config.threshold, ThresholdConfig::default());
    }

    #[test]
    fn derived_paths_live_in_state_dir() {
        let mut config = Config::default();
        config.paths.manifest = Some(PathBuf::from("/etc/guardian/replicas.toml"));
        let state = config.state_dir();
        assert_eq!(config.crash_log_path(), state.join("crash.log"));
        assert_eq!(config.keeper_state_path(), state.join("keeper-state.json"));
        assert_eq!(config.keeper_lock_path(), state.join("keeper.lock"));
        assert_eq!(
            config.manifest_path(),
            PathBuf::from("/etc/guardian/replicas.toml")
        );
    }

    #[test]
    fn explicit_config_path_wins() {
        let path = resolve_config_path(Some(Path::new("/tmp/x.toml")));
        assert_eq!(path, PathBuf::from("/tmp/x.toml"));
    }
}
