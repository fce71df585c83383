use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, ScanError};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub classification: ClassificationConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_newer_than_days")]
    pub newer_than_days: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_thread_cache_capacity")]
    pub thread_cache_capacity: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            newer_than_days: default_newer_than_days(),
            page_size: default_page_size(),
            max_concurrent_requests: default_max_concurrent(),
            thread_cache_capacity: default_thread_cache_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationConfig {
    /// `openai` or `disabled`
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key_env: default_api_key_env(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default = "default_archive_root")]
    pub root_dir: PathBuf,
    #[serde(default = "default_folder_name")]
    pub folder_name: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            root_dir: default_archive_root(),
            folder_name: default_folder_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_dir")]
    pub dir: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            dir: default_ledger_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_credentials")]
    pub credentials: PathBuf,
    #[serde(default = "default_token_dir")]
    pub token_dir: PathBuf,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credentials: default_credentials(),
            token_dir: default_token_dir(),
        }
    }
}

fn default_newer_than_days() -> u32 {
    30
}

fn default_page_size() -> u32 {
    10
}

fn default_max_concurrent() -> usize {
    10
}

fn default_thread_cache_capacity() -> usize {
    256
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_archive_root() -> PathBuf {
    PathBuf::from(".inbox-ledger/archive")
}

fn default_folder_name() -> String {
    "Invoices".to_string()
}

fn default_ledger_dir() -> PathBuf {
    PathBuf::from(".inbox-ledger/ledger")
}

fn default_database_path() -> PathBuf {
    PathBuf::from(".inbox-ledger/ledger.db")
}

fn default_credentials() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_token_dir() -> PathBuf {
    PathBuf::from(".inbox-ledger/tokens")
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        // If file doesn't exist, return default config with warning
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ScanError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| ScanError::ConfigError(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ScanError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| ScanError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| ScanError::ConfigError(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.scan.newer_than_days == 0 {
            return Err(ScanError::ConfigError(
                "scan.newer_than_days must be at least 1".to_string(),
            ));
        }
        if self.scan.newer_than_days > 365 {
            return Err(ScanError::ConfigError(
                "scan.newer_than_days cannot exceed 365 (1 year)".to_string(),
            ));
        }

        // Gmail caps messages.list at 500 per page
        if self.scan.page_size == 0 || self.scan.page_size > 500 {
            return Err(ScanError::ConfigError(
                "scan.page_size must be between 1 and 500".to_string(),
            ));
        }

        if self.scan.max_concurrent_requests == 0 {
            return Err(ScanError::ConfigError(
                "scan.max_concurrent_requests must be at least 1".to_string(),
            ));
        }
        if self.scan.max_concurrent_requests > 50 {
            return Err(ScanError::ConfigError(
                "scan.max_concurrent_requests cannot exceed 50 (to stay under Gmail API rate limits of 250 units/sec)".to_string(),
            ));
        }

        if self.scan.thread_cache_capacity == 0 {
            return Err(ScanError::ConfigError(
                "scan.thread_cache_capacity must be greater than 0".to_string(),
            ));
        }

        match self.classification.provider.as_str() {
            "openai" | "disabled" => {}
            other => {
                return Err(ScanError::ConfigError(format!(
                    "Invalid classification.provider: '{}'. Must be 'openai' or 'disabled'",
                    other
                )));
            }
        }

        if self.classification.model.trim().is_empty() {
            return Err(ScanError::ConfigError(
                "classification.model cannot be empty".to_string(),
            ));
        }

        if self.archive.folder_name.is_empty() {
            return Err(ScanError::ConfigError(
                "archive.folder_name cannot be empty".to_string(),
            ));
        }
        if self.archive.folder_name.contains('/') || self.archive.folder_name.contains('\\') {
            return Err(ScanError::ConfigError(
                "archive.folder_name cannot contain path separators".to_string(),
            ));
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        let config = Self::default();
        config.save(path).await
    }
}
