//! Configuration management for kiln

pub mod schema;

pub use schema::Config;

use crate::error::{KilnError, KilnResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Project-local configuration file name
pub const LOCAL_CONFIG_FILE: &str = ".kiln.toml";

/// Environment variable overriding the state directory
pub const HOME_ENV: &str = "KILN_HOME";

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kiln")
            .join("config.toml")
    }

    /// Get the state directory path (`$KILN_HOME` when set)
    pub fn state_dir() -> PathBuf {
        if let Some(home) = std::env::var_os(HOME_ENV) {
            return PathBuf::from(home);
        }
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kiln")
    }

    /// Get the build cache root
    pub fn cache_dir(config: &Config) -> PathBuf {
        config
            .cache
            .dir
            .clone()
            .unwrap_or_else(|| Self::state_dir().join("cache"))
    }

    /// Get the package store root
    pub fn packages_dir(config: &Config) -> PathBuf {
        config
            .packages
            .dir
            .clone()
            .unwrap_or_else(|| Self::state_dir().join("packages"))
    }

    /// Get the directory holding precompiler output
    pub fn precompiled_dir(config: &Config) -> PathBuf {
        Self::cache_dir(config).join("precompiled")
    }

    /// Get the running-server registry path
    pub fn registry_path() -> PathBuf {
        Self::state_dir().join("servers.json")
    }

    /// Get the event log path
    pub fn event_log_path() -> PathBuf {
        Self::state_dir().join("events.log")
    }

    /// Get the log file a detached server writes to
    pub fn server_log_path(port: u16) -> PathBuf {
        Self::state_dir().join(format!("server-{}.log", port))
    }

    /// Walk up from `start` looking for a project-local config file
    pub fn find_local_config(start: &Path) -> Option<PathBuf> {
        start
            .ancestors()
            .map(|dir| dir.join(LOCAL_CONFIG_FILE))
            .find(|candidate| candidate.is_file())
    }

    /// Load configuration, creating default if not exists
    pub async fn load(&self) -> KilnResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load the global config overlaid with a project-local file
    pub async fn load_merged(&self, local: Option<&Path>) -> KilnResult<Config> {
        let mut merged = if self.config_path.exists() {
            read_toml(&self.config_path).await?
        } else {
            toml::Value::Table(toml::map::Map::new())
        };

        if let Some(local) = local {
            let overlay = read_toml(local).await?;
            merge_toml(&mut merged, overlay);
        }

        let path = local.unwrap_or(&self.config_path).to_path_buf();
        merged
            .try_into()
            .map_err(|e: toml::de::Error| KilnError::ConfigInvalid {
                path,
                reason: e.to_string(),
            })
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> KilnResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| KilnError::io(format!("reading config from {}", path.display()), e))?;

        toml::from_str(&content).map_err(|e| KilnError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> KilnResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            KilnError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> KilnResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| KilnError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Ensure the state directory exists
    pub async fn ensure_state_dirs() -> KilnResult<()> {
        let dir = Self::state_dir();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| KilnError::io(format!("creating directory {}", dir.display()), e))
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_toml(path: &Path) -> KilnResult<toml::Value> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| KilnError::io(format!("reading config from {}", path.display()), e))?;
    content
        .parse()
        .map_err(|e: toml::de::Error| KilnError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Recursively overlay `overlay` onto `base`; tables merge, other values replace.
fn merge_toml(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_toml(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_default_when_missing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nonexistent.toml");
        let manager = ConfigManager::with_path(path);

        let config = manager.load().await.unwrap();
        assert_eq!(config.compiler.program, "cc");
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        let manager = ConfigManager::with_path(path);

        let mut config = Config::default();
        config.compiler.program = "clang".to_string();

        manager.save(&config).await.unwrap();
        let loaded = manager.load().await.unwrap();

        assert_eq!(loaded.compiler.program, "clang");
    }

    #[tokio::test]
    async fn local_config_overrides_global() {
        let temp = TempDir::new().unwrap();
        let global = temp.path().join("config.toml");
        std::fs::write(
            &global,
            "[compiler]\nprogram = \"gcc\"\ntimeout_secs = 10\n",
        )
        .unwrap();
        let local = temp.path().join(LOCAL_CONFIG_FILE);
        std::fs::write(&local, "[compiler]\nprogram = \"clang\"\n").unwrap();

        let manager = ConfigManager::with_path(global);
        let config = manager.load_merged(Some(&local)).await.unwrap();

        assert_eq!(config.compiler.program, "clang");
        assert_eq!(config.compiler.timeout_secs, 10);
        assert_eq!(config.server.port, 17001);
    }

    #[test]
    #[serial_test::serial]
    fn state_dir_honors_kiln_home() {
        let temp = TempDir::new().unwrap();
        std::env::set_var(HOME_ENV, temp.path());

        assert_eq!(ConfigManager::state_dir(), temp.path());
        assert_eq!(
            ConfigManager::server_log_path(17001),
            temp.path().join("server-17001.log")
        );
        let config = Config::default();
        assert_eq!(ConfigManager::cache_dir(&config), temp.path().join("cache"));

        std::env::remove_var(HOME_ENV);
    }

    #[test]
    fn find_local_config_walks_up() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(temp.path().join(LOCAL_CONFIG_FILE), "").unwrap();

        let found = ConfigManager::find_local_config(&nested).unwrap();
        assert_eq!(found, temp.path().join(LOCAL_CONFIG_FILE));
    }
}
