//! A small filesystem-backed preference store: a `ConfigStore` (raw bytes port) plus a
//! `ConfigService` (typed wrapper) layered on top of it.
//!
//! Persisted local state beyond the two config files isn't otherwise required, but every
//! binary in this workspace wants somewhere to cache the last-used cluster-file path
//! between CLI invocations, so this is kept deliberately small: one key,
//! `last_cluster_file`.

use std::io;
use std::path::PathBuf;

use directories::ProjectDirs;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Errors from the config store/service layer.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No value is stored under the requested key.
    #[error("not found")]
    NotFound,
    /// Underlying filesystem I/O failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// The stored bytes were not valid JSON for the requested type.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    /// No writable config directory exists on this platform/user.
    #[error("no config directory available")]
    NoConfigDir,
}

/// A raw, key-addressed byte store. `meshbox-config` ships one implementation,
/// [`FsConfigStore`], backed by the platform's per-user config directory.
pub trait ConfigStore {
    /// Loads the raw bytes stored under `key`, or `ConfigError::NotFound`.
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError>;
    /// Persists `bytes` under `key`, creating or overwriting as needed.
    fn save_raw(&self, key: &str, bytes: &[u8]) -> Result<(), ConfigError>;
}

/// Filesystem-backed [`ConfigStore`]: one `{key}.json` file per key under the platform's
/// per-user config directory.
pub struct FsConfigStore {
    dir: PathBuf,
}

impl FsConfigStore {
    /// Opens the platform config directory for `meshbox`, creating it if absent.
    pub fn open() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from("dev", "meshbox", "meshbox").ok_or(ConfigError::NoConfigDir)?;
        let dir = dirs.config_dir().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Opens an arbitrary directory as the store root (used by tests).
    pub fn at(dir: PathBuf) -> Result<Self, ConfigError> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl ConfigStore for FsConfigStore {
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(ConfigError::NotFound),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn save_raw(&self, key: &str, bytes: &[u8]) -> Result<(), ConfigError> {
        std::fs::write(self.path_for(key), bytes)?;
        Ok(())
    }
}

/// A typed wrapper over any [`ConfigStore`], (de)serializing values as JSON.
pub struct ConfigService<S> {
    store: S,
}

impl<S: ConfigStore> ConfigService<S> {
    /// Wraps `store`.
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    /// Loads and deserializes the value stored under `key`.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        let bytes = self.store.load_raw(key)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Serializes `value` and persists it under `key`.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), ConfigError> {
        let bytes = serde_json::to_vec(value)?;
        self.store.save_raw(key, &bytes)
    }
}

/// The one preference this workspace persists between CLI invocations.
pub const LAST_CLUSTER_FILE_KEY: &str = "last_cluster_file";

#[cfg(test)]
mod tests {
    use super::{ConfigService, ConfigStore, FsConfigStore, LAST_CLUSTER_FILE_KEY};

    // ── 1. round-trips a typed value through the filesystem store ──
    #[test]
    fn round_trips_typed_value() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsConfigStore::at(dir.path().to_path_buf()).expect("open");
        let service = ConfigService::new(store);

        service
            .save(LAST_CLUSTER_FILE_KEY, &"/etc/meshbox/cluster.json".to_owned())
            .expect("save");
        let loaded: String = service.load(LAST_CLUSTER_FILE_KEY).expect("load");
        assert_eq!(loaded, "/etc/meshbox/cluster.json");
    }

    // ── 2. loading an absent key reports NotFound ──
    #[test]
    fn load_absent_key_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsConfigStore::at(dir.path().to_path_buf()).expect("open");
        assert!(matches!(
            store.load_raw("nope"),
            Err(super::ConfigError::NotFound)
        ));
    }
}
