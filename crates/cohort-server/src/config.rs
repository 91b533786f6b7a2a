//! Server configuration, loaded from a TOML file with full defaults.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

/// Top-level configuration for both cluster roles.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Cluster networking
    pub cluster: ClusterConfig,
    /// Persisted storage locations
    pub storage: StorageConfig,
    /// Query execution tuning
    pub execution: ExecutionConfig,
}

/// Cluster networking configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Address the manager listens on
    pub bind_addr: SocketAddr,
    /// Address shards connect to
    pub manager_addr: SocketAddr,
    /// Shard name; must be unique within the cluster
    pub shard_name: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8170".parse().expect("static address"),
            manager_addr: "127.0.0.1:8170".parse().expect("static address"),
            shard_name: "shard-node".to_string(),
        }
    }
}

/// Storage locations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one subdirectory per worker storage
    pub directory: String,
    /// Directory the manager reads dataset descriptors (JSON) from
    pub datasets_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: "./data/workers".to_string(),
            datasets_dir: "./data/datasets".to_string(),
        }
    }
}

/// Query execution tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Threads per worker execution pool; 0 uses the core count
    pub threads: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self { threads: 0 }
    }
}

impl Config {
    /// Load from a TOML file, or fall back to defaults when `path` is
    /// `None`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)?;
        let config = toml::from_str(&raw)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.cluster.shard_name, "shard-node");
        assert_eq!(config.execution.threads, 0);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cohort.toml");
        std::fs::write(
            &path,
            "[cluster]\nshard_name = \"shard-7\"\n\n[execution]\nthreads = 4\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.cluster.shard_name, "shard-7");
        assert_eq!(config.execution.threads, 4);
        assert_eq!(config.storage.directory, "./data/workers");
    }
}
