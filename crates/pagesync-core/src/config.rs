use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config json: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("no platform config directory")]
    ProjectDir,
    #[error("environment variable {0} is not set")]
    MissingToken(String),
}

fn default_api_base_url() -> String {
    "https://api.notion.com/v1".to_string()
}

fn default_api_version() -> String {
    "2022-06-28".to_string()
}

fn default_token_env() -> String {
    "NOTION_API_TOKEN".to_string()
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_page_size() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Name of the environment variable holding the API token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            api_version: default_api_version(),
            token_env: default_token_env(),
            cache_ttl_secs: default_cache_ttl_secs(),
            page_size: default_page_size(),
            cache_path: None,
        }
    }
}

impl SyncConfig {
    pub fn token(&self) -> Result<String, ConfigError> {
        std::env::var(&self.token_env)
            .ok()
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingToken(self.token_env.clone()))
    }

    /// Explicit `cache_path`, else `cache.db` in the platform data directory.
    pub fn resolved_cache_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.cache_path {
            return Ok(path.clone());
        }
        let project_dirs = project_dirs()?;
        Ok(project_dirs.data_dir().join("cache.db"))
    }
}

fn project_dirs() -> Result<ProjectDirs, ConfigError> {
    ProjectDirs::from("app", "pagesync", "pagesync").ok_or(ConfigError::ProjectDir)
}

pub struct ConfigStore {
    config_path: PathBuf,
}

impl ConfigStore {
    pub fn new(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    pub fn default_store() -> Result<Self, ConfigError> {
        let project_dirs = project_dirs()?;
        Ok(Self::new(project_dirs.config_dir().join("config.json")))
    }

    pub fn load(&self) -> Result<SyncConfig, ConfigError> {
        if !self.config_path.exists() {
            return Ok(SyncConfig::default());
        }
        let raw = fs::read_to_string(&self.config_path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, config: &SyncConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(config)?;
        fs::write(&self.config_path, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempdir().expect("tempdir");
        let store = ConfigStore::new(dir.path().join("config.json"));

        let config = store.load().expect("load config");
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.cache_ttl_secs, 300);
        assert_eq!(config.api_version, "2022-06-28");
    }

    #[test]
    fn save_then_load_persists_changes() {
        let dir = tempdir().expect("tempdir");
        let store = ConfigStore::new(dir.path().join("nested").join("config.json"));

        let config = SyncConfig {
            cache_ttl_secs: 60,
            cache_path: Some(dir.path().join("cache.db")),
            ..SyncConfig::default()
        };
        store.save(&config).expect("save config");

        assert_eq!(store.load().expect("load config"), config);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "page_size": 25 }"#).expect("write");

        let config = ConfigStore::new(path).load().expect("load config");
        assert_eq!(config.page_size, 25);
        assert_eq!(config.token_env, "NOTION_API_TOKEN");
    }

    #[test]
    fn missing_token_names_the_variable() {
        let config = SyncConfig {
            token_env: "PAGESYNC_TEST_TOKEN_THAT_IS_NOT_SET".to_string(),
            ..SyncConfig::default()
        };
        let err = config.token().unwrap_err();
        assert!(err.to_string().contains("PAGESYNC_TEST_TOKEN_THAT_IS_NOT_SET"));
    }

    #[test]
    fn explicit_cache_path_wins() {
        let config = SyncConfig {
            cache_path: Some(PathBuf::from("/tmp/pagesync.db")),
            ..SyncConfig::default()
        };
        assert_eq!(
            config.resolved_cache_path().expect("path"),
            PathBuf::from("/tmp/pagesync.db")
        );
    }
}
