//! Configuration file for the `corral` binary.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use corral_core::KernelConfig;

/// Settings read from `config.toml` in the corral home directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub home_dir: PathBuf,
    /// State database and other persistent files.
    pub var_dir: PathBuf,
    /// Runtime files of running workers.
    pub run_dir: PathBuf,
    pub worker: WorkerConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub acquire_timeout_ms: u64,
    /// Workers started by `corral worker`.
    pub concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub syslog_port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 5000,
            concurrency: 4,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { syslog_port: 4500 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::with_home(default_home_dir())
    }
}

/// `$CORRAL_HOME`, else `~/.corral`.
pub fn default_home_dir() -> PathBuf {
    if let Ok(home) = std::env::var("CORRAL_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .map(|home| home.join(".corral"))
        .unwrap_or_else(|| PathBuf::from(".corral"))
}

impl Config {
    pub fn with_home<P: Into<PathBuf>>(home: P) -> Self {
        let home_dir = home.into();
        Self {
            var_dir: home_dir.join("var"),
            run_dir: home_dir.join("run"),
            home_dir,
            worker: WorkerConfig::default(),
            log: LogConfig::default(),
        }
    }

    /// `$CORRAL_CONFIG`, else `config.toml` in the home directory.
    pub fn default_path() -> PathBuf {
        match std::env::var("CORRAL_CONFIG") {
            Ok(path) => PathBuf::from(path),
            Err(_) => default_home_dir().join("config.toml"),
        }
    }

    /// Load the config file at `path`, writing the defaults there if it does
    /// not exist yet.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if !path.exists() {
            let home = path.parent().map(Path::to_path_buf).unwrap_or_else(default_home_dir);
            let config = Self::with_home(home);
            config.save(path)?;
            return Ok(config);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        tracing::info!(path = %path.display(), "wrote default config");
        Ok(())
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.var_dir.join("state.db")
    }

    pub fn kernel_config(&self, detached: bool) -> KernelConfig {
        KernelConfig {
            syslog_port: self.log.syslog_port,
            acquire_timeout: Duration::from_millis(self.worker.acquire_timeout_ms),
            detached,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = Config::parse(
            r#"
            home_dir = "/srv/corral"
            var_dir = "/srv/corral/var"

            [worker]
            concurrency = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.acquire_timeout_ms, 5000);
        assert_eq!(config.log.syslog_port, 4500);
        assert_eq!(config.state_db_path(), PathBuf::from("/srv/corral/var/state.db"));
    }

    #[test]
    fn test_missing_file_writes_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let config = Config::load_or_init(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.home_dir, dir.path());
        assert_eq!(config.var_dir, dir.path().join("var"));
        assert_eq!(Config::load_or_init(&path).unwrap(), config);
    }

    #[test]
    fn test_kernel_config() {
        let config = Config::with_home("/h");
        let kernel = config.kernel_config(true);
        assert!(kernel.detached);
        assert_eq!(kernel.acquire_timeout, Duration::from_millis(5000));
        assert_eq!(kernel.syslog_port, 4500);
    }
}
