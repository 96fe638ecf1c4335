//! Persistent catalog configuration model and defaults.

use std::path::PathBuf;

use log::warn;

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CatalogConfig {
    #[serde(default)]
    /// Storage location preferences.
    pub storage: StorageConfig,
    #[serde(default)]
    /// Directory import preferences.
    pub import: ImportConfig,
    #[serde(default)]
    /// Entity cache sizing.
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct StorageConfig {
    /// Database file name inside the data directory.
    #[serde(default = "default_database_file")]
    pub database_file: String,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ImportConfig {
    /// Extensions accepted in addition to the built-in audio set.
    #[serde(default)]
    pub extra_extensions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CacheConfig {
    /// Upper bound on strongly held cache entries.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

fn default_database_file() -> String {
    "catalog.db".to_string()
}

fn default_cache_capacity() -> usize {
    1024
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_file: default_database_file(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
        }
    }
}

impl CatalogConfig {
    /// Application data directory, `<platform data dir>/medley`.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("medley")
    }

    fn config_path() -> PathBuf {
        Self::data_dir().join("config.toml")
    }

    pub fn database_path(&self) -> PathBuf {
        Self::data_dir().join(&self.storage.database_file)
    }

    /// Loads the persisted configuration; a missing or malformed file falls
    /// back to defaults.
    pub fn load_or_default() -> Self {
        let path = Self::config_path();
        match std::fs::read_to_string(&path) {
            Ok(raw) => match toml::from_str(&raw) {
                Ok(config) => config,
                Err(err) => {
                    warn!("Ignoring malformed {}: {}", path.display(), err);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = toml::to_string_pretty(self)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        std::fs::write(&path, raw)
    }
}
