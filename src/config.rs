use std::{
    env, fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};

pub const DEFAULT_REQUEUE_LIMIT: u32 = 40;

/// Options handed to [`crate::EventStore::open`]. Explicit per store
/// handle; there is no ambient configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StoreOptions {
    /// Maximum number of times an event may be returned to the queue on
    /// a single channel before further requeues are rejected.
    pub requeue_limit: u32,
    /// Permit the store to discard records it cannot decode (corrupt
    /// version markers, undecodable legacy keys during migration)
    /// instead of failing.
    pub repair_corrupt: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            requeue_limit: DEFAULT_REQUEUE_LIMIT,
            repair_corrupt: false,
        }
    }
}

/// File-backed configuration for processes embedding the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    pub requeue_limit: u32,
    pub repair_corrupt: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Config {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            data_dir: default_data_dir(),
            requeue_limit: DEFAULT_REQUEUE_LIMIT,
            repair_corrupt: false,
            created_at: now,
            updated_at: now,
        }
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home.join(".duraq").join("config.toml"));
    }
    let mut path = env::current_dir().map_err(|err| QueueError::Config(err.to_string()))?;
    path.push(".duraq");
    path.push("config.toml");
    Ok(path)
}

pub fn load_or_default(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let config_path = if let Some(path) = path {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        path
    } else {
        default_config_path()?
    };

    if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        let cfg: Config = toml::from_str(&contents)?;
        cfg.ensure_data_dir()?;
        Ok((cfg, config_path))
    } else {
        let mut cfg = Config::default();
        if let Some(parent) = config_path.parent() {
            cfg.data_dir = parent.join("data");
        }
        cfg.ensure_data_dir()?;
        cfg.save(&config_path)?;
        Ok((cfg, config_path))
    }
}

impl Config {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn ensure_data_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("queue")
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            requeue_limit: self.requeue_limit,
            repair_corrupt: self.repair_corrupt,
        }
    }
}

fn default_data_dir() -> PathBuf {
    let Ok(current_dir) = env::current_dir() else {
        return PathBuf::from(".duraq");
    };
    current_dir.join(".duraq")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn config_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.data_dir = dir.path().join("data");
        config.requeue_limit = 7;
        config.repair_corrupt = true;
        config.save(&path).unwrap();

        let (loaded, loaded_path) = load_or_default(Some(path.clone())).unwrap();
        assert_eq!(loaded_path, path);
        assert_eq!(loaded.requeue_limit, 7);
        assert!(loaded.repair_corrupt);
        assert_eq!(loaded.data_dir, config.data_dir);
        assert!(loaded.data_dir.is_dir());

        let options = loaded.store_options();
        assert_eq!(options.requeue_limit, 7);
        assert!(options.repair_corrupt);
    }

    #[test]
    fn load_or_default_creates_a_fresh_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let (config, written_path) = load_or_default(Some(path.clone())).unwrap();
        assert_eq!(written_path, path);
        assert!(path.is_file());
        assert_eq!(config.requeue_limit, DEFAULT_REQUEUE_LIMIT);
        assert!(config.data_dir.starts_with(dir.path()));
        assert!(config.data_dir.is_dir());
    }
}
