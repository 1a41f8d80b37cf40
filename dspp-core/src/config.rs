//! Configuration management.

use crate::error::{DsppError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the per-project configuration file.
pub const CONFIG_FILE: &str = ".dspp.json";

/// Persistent configuration for a dspp project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cache directory, relative to the project root.
    pub cache_dir: String,
    /// Maximum number of descriptors or remote reads in flight.
    pub concurrency: usize,
    /// Control-plane endpoint.
    pub docker_host: String,
    /// Binary used for the blocking deploy step.
    pub docker_bin: String,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: paths::CACHE_STACK_PATH.to_string(),
            concurrency: 5,
            docker_host: "unix:///var/run/docker.sock".to_string(),
            docker_bin: "docker".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Get the path to the configuration file of a project.
    pub fn config_path(project_root: &Path) -> PathBuf {
        project_root.join(CONFIG_FILE)
    }

    /// Load configuration from disk, then apply environment overrides.
    pub fn load(project_root: &Path) -> Result<Self> {
        let path = Self::config_path(project_root);
        let config = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| DsppError::InvalidConfig {
                reason: format!("Failed to read config: {}", e),
            })?;
            serde_json::from_str(&content).map_err(|e| DsppError::InvalidConfig {
                reason: format!("Failed to parse config: {}", e),
            })?
        } else {
            Self::default()
        };
        config.with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `DSPP_*` / `DOCKER_HOST` overrides from the given lookup.
    pub fn with_env_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(dir) = var("DSPP_CACHE_DIR") {
            self.cache_dir = dir;
        }
        if let Some(raw) = var("DSPP_CONCURRENCY") {
            self.concurrency = raw.parse().map_err(|_| DsppError::InvalidConfig {
                reason: format!("DSPP_CONCURRENCY must be a positive integer, got '{}'", raw),
            })?;
        }
        if let Some(host) = var("DOCKER_HOST") {
            self.docker_host = host;
        }
        if let Some(level) = var("DSPP_LOG") {
            self.log_level = level;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(DsppError::InvalidConfig { reason: "concurrency must be >= 1".into() });
        }
        if self.cache_dir.is_empty() {
            return Err(DsppError::InvalidConfig { reason: "cache_dir must not be empty".into() });
        }
        Ok(())
    }

    /// Save configuration to disk.
    pub fn save(&self, project_root: &Path) -> Result<()> {
        let path = Self::config_path(project_root);
        let content = serde_json::to_string_pretty(self).map_err(|e| DsppError::InvalidConfig {
            reason: format!("Failed to serialize config: {}", e),
        })?;
        std::fs::write(&path, content).map_err(|e| DsppError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.cache_dir, ".docker-stack");
        assert_eq!(config.concurrency, 5);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> =
            [("DSPP_CONCURRENCY", "2"), ("DOCKER_HOST", "http://swarm:2375")].into();
        let config =
            Config::default().with_env_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.docker_host, "http://swarm:2375");
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let result = Config::default()
            .with_env_overrides(|k| (k == "DSPP_CONCURRENCY").then(|| "0".to_string()));
        assert!(matches!(result, Err(DsppError::InvalidConfig { .. })));
    }

    #[test]
    fn test_load_and_save() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.cache_dir = ".cache".into();
        config.save(temp.path()).unwrap();

        let content = std::fs::read_to_string(Config::config_path(temp.path())).unwrap();
        let loaded: Config = serde_json::from_str(&content).unwrap();
        assert_eq!(loaded, config);
    }
}
