//! Service configuration.
//!
//! Loaded from a JSON file, then overridden by `GRAVITY_SNAPSHOT_*`
//! environment variables.

use crate::error::{Result, SnapshotError};
use crate::transport::subject;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Prefix of the environment overrides.
pub const ENV_PREFIX: &str = "GRAVITY_SNAPSHOT";

/// Snapshot store settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Store directory. `None` keeps snapshots in memory.
    pub path: Option<PathBuf>,

    /// Worker threads applying events; 0 applies them on the consumer thread.
    pub worker_count: usize,

    /// Queued events per worker.
    pub worker_buffer_size: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: None,
            worker_count: 8,
            worker_buffer_size: 102400,
        }
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Namespace of every stream and subject.
    pub domain: String,

    /// Collections to snapshot.
    pub collections: Vec<String>,

    /// Partitions per collection, numbered from 0.
    pub partition_count: u64,

    pub store: StoreSettings,

    /// Records published per view pull.
    pub pull_batch_size: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            domain: "gravity".to_string(),
            collections: Vec::new(),
            partition_count: 8,
            store: StoreSettings::default(),
            pull_batch_size: 1000,
        }
    }
}

impl SnapshotConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let config: SnapshotConfig = serde_json::from_slice(&data)
            .map_err(|e| SnapshotError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        Ok(config)
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Override fields from `lookup`, which maps variable names to values.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}_{}", ENV_PREFIX, name)).filter(|v| !v.is_empty());

        if let Some(domain) = var("DOMAIN") {
            self.domain = domain;
        }

        if let Some(list) = var("COLLECTIONS") {
            let names: Vec<String> = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            self.add_collections(names);
        }

        if let Some(path) = var("DATASTORE_PATH") {
            self.store.path = Some(PathBuf::from(path));
        }

        if let Some(count) = var("SNAPSHOT_WORKER_COUNT") {
            self.store.worker_count = parse_number("SNAPSHOT_WORKER_COUNT", &count)?;
        }

        if let Some(size) = var("SNAPSHOT_WORKER_BUFFER_SIZE") {
            self.store.worker_buffer_size = parse_number("SNAPSHOT_WORKER_BUFFER_SIZE", &size)?;
        }

        Ok(())
    }

    /// Append collections not already listed.
    pub fn add_collections<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            let name = name.into();
            if !self.collections.contains(&name) {
                self.collections.push(name);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !subject::is_valid_token(&self.domain) {
            return Err(SnapshotError::Config(format!("invalid domain: {:?}", self.domain)));
        }

        for name in &self.collections {
            validate_collection_name(name)?;
        }

        if self.partition_count == 0 {
            return Err(SnapshotError::Config("partition_count must be at least 1".into()));
        }

        Ok(())
    }
}

/// A collection name becomes one subject token, so it must not carry a
/// separator or wildcard.
pub fn validate_collection_name(name: &str) -> Result<()> {
    if subject::is_valid_token(name) {
        Ok(())
    } else {
        Err(SnapshotError::Config(format!("invalid collection name: {:?}", name)))
    }
}

fn parse_number(name: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| SnapshotError::Config(format!("{}_{} is not a number: {:?}", ENV_PREFIX, name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SnapshotConfig::default();
        assert_eq!(config.domain, "gravity");
        assert_eq!(config.partition_count, 8);
        assert_eq!(config.store.worker_count, 8);
        assert_eq!(config.store.worker_buffer_size, 102400);
        assert_eq!(config.pull_batch_size, 1000);
        assert!(config.store.path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_file_with_partial_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snapshot.json");
        std::fs::write(
            &path,
            r#"{"collections": ["users"], "store": {"path": "/data/snapshot"}}"#,
        )
        .unwrap();

        let config = SnapshotConfig::from_json_file(&path).unwrap();
        assert_eq!(config.collections, vec!["users"]);
        assert_eq!(config.store.path, Some(PathBuf::from("/data/snapshot")));
        assert_eq!(config.store.worker_count, 8);
        assert_eq!(config.domain, "gravity");
    }

    #[test]
    fn test_bad_json_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snapshot.json");
        std::fs::write(&path, "{").unwrap();

        assert!(matches!(
            SnapshotConfig::from_json_file(&path),
            Err(SnapshotError::Config(_))
        ));
        assert!(matches!(
            SnapshotConfig::from_json_file(dir.path().join("missing.json")),
            Err(SnapshotError::Io(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = SnapshotConfig::default();
        config.add_collections(["users"]);

        config
            .apply_env_from(env(&[
                ("GRAVITY_SNAPSHOT_DOMAIN", "prod"),
                ("GRAVITY_SNAPSHOT_COLLECTIONS", "orders, users,,accounts"),
                ("GRAVITY_SNAPSHOT_DATASTORE_PATH", "/tmp/snap"),
                ("GRAVITY_SNAPSHOT_SNAPSHOT_WORKER_COUNT", "0"),
                ("GRAVITY_SNAPSHOT_SNAPSHOT_WORKER_BUFFER_SIZE", "16"),
            ]))
            .unwrap();

        assert_eq!(config.domain, "prod");
        assert_eq!(config.collections, vec!["users", "orders", "accounts"]);
        assert_eq!(config.store.path, Some(PathBuf::from("/tmp/snap")));
        assert_eq!(config.store.worker_count, 0);
        assert_eq!(config.store.worker_buffer_size, 16);
    }

    #[test]
    fn test_env_bad_number() {
        let mut config = SnapshotConfig::default();
        let result = config.apply_env_from(env(&[("GRAVITY_SNAPSHOT_SNAPSHOT_WORKER_COUNT", "many")]));
        assert!(matches!(result, Err(SnapshotError::Config(_))));
    }

    #[test]
    fn test_add_collections_dedups() {
        let mut config = SnapshotConfig::default();
        config.add_collections(["a", "b", "a"]);
        config.add_collections(vec!["b".to_string(), "c".to_string()]);
        assert_eq!(config.collections, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_validate() {
        let mut config = SnapshotConfig::default();
        config.add_collections(["bad.name"]);
        assert!(config.validate().is_err());

        let mut config = SnapshotConfig::default();
        config.partition_count = 0;
        assert!(config.validate().is_err());

        let mut config = SnapshotConfig::default();
        config.domain = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_collection_name() {
        assert!(validate_collection_name("users").is_ok());
        for bad in ["", "a.b", "a*", "a>", "a b"] {
            assert!(matches!(validate_collection_name(bad), Err(SnapshotError::Config(_))));
        }
    }
}
