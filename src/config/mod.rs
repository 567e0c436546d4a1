//! Configuration management for forgeflow
//!
//! Handles loading, saving, and validating configuration from TOML files.

mod defaults;

pub use defaults::*;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Forge API access configuration
    #[serde(default)]
    pub forge: ForgeConfig,

    /// Extraction behaviour
    #[serde(default)]
    pub crawl: CrawlConfig,

    /// Retry policy applied to activities
    #[serde(default)]
    pub retry: RetryConfig,

    /// Periodic trigger configuration
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Paths configuration (internal, not user-editable)
    #[serde(skip)]
    pub paths: PathsConfig,
}

/// Forge API access configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeConfig {
    /// GitHub API base URL
    #[serde(default = "default_github_base_url")]
    pub github_base_url: String,

    /// Environment variable name holding the GitHub token
    #[serde(default = "default_github_token_env")]
    pub github_token_env: String,

    /// GitLab API base URL
    #[serde(default = "default_gitlab_base_url")]
    pub gitlab_base_url: String,

    /// Environment variable name holding the GitLab token
    #[serde(default = "default_gitlab_token_env")]
    pub gitlab_token_env: String,

    /// Request timeout in seconds
    #[serde(default = "default_forge_timeout")]
    pub timeout_secs: u64,

    /// Proactive request budget per forge client (requests per second)
    #[serde(default = "default_forge_rate_limit")]
    pub requests_per_second: u32,

    /// User agent string
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Extraction behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlConfig {
    /// Page size for paginated merge-request fetches
    #[serde(default = "default_per_page")]
    pub per_page: u32,

    /// Hard cap on pages fetched per repository per run
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    /// Concurrency limit for child-unit fan-out
    #[serde(default = "default_fanout_limit")]
    pub fanout_limit: usize,
}

/// Retry policy applied to activities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// First backoff interval in seconds
    #[serde(default = "default_retry_initial_secs")]
    pub initial_secs: u64,

    /// Backoff multiplier
    #[serde(default = "default_retry_multiplier")]
    pub multiplier: f64,

    /// Backoff cap in seconds
    #[serde(default = "default_retry_cap_secs")]
    pub cap_secs: u64,

    /// Maximum attempts per activity
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
}

/// Periodic trigger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Extraction window and interval length in minutes
    #[serde(default = "default_extract_interval_mins")]
    pub extract_interval_mins: i64,

    /// How far behind extraction the transform window trails, in minutes
    #[serde(default = "default_transform_offset_mins")]
    pub transform_offset_mins: i64,
}

/// Internal paths configuration
#[derive(Debug, Clone, Default)]
pub struct PathsConfig {
    /// Base directory for forgeflow data
    pub base_dir: PathBuf,

    /// Path to config file
    pub config_file: PathBuf,

    /// Path to the control database (tenant registry)
    pub control_db_file: PathBuf,

    /// Directory holding per-tenant databases
    pub tenant_db_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            forge: ForgeConfig::default(),
            crawl: CrawlConfig::default(),
            retry: RetryConfig::default(),
            schedule: ScheduleConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            github_base_url: default_github_base_url(),
            github_token_env: default_github_token_env(),
            gitlab_base_url: default_gitlab_base_url(),
            gitlab_token_env: default_gitlab_token_env(),
            timeout_secs: default_forge_timeout(),
            requests_per_second: default_forge_rate_limit(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            per_page: default_per_page(),
            max_pages: default_max_pages(),
            fanout_limit: default_fanout_limit(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_secs: default_retry_initial_secs(),
            multiplier: default_retry_multiplier(),
            cap_secs: default_retry_cap_secs(),
            max_attempts: default_retry_max_attempts(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            extract_interval_mins: default_extract_interval_mins(),
            transform_offset_mins: default_transform_offset_mins(),
        }
    }
}

impl Config {
    /// Get the default base directory for forgeflow (~/.forgeflow)
    pub fn default_base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".forgeflow")
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        Self::default_base_dir().join("config.toml")
    }

    fn init_paths(&mut self, base_dir: Option<PathBuf>) {
        let base = base_dir.unwrap_or_else(Self::default_base_dir);
        self.paths = PathsConfig {
            config_file: base.join("config.toml"),
            control_db_file: base.join("control.db"),
            tenant_db_dir: base.join("tenants"),
            base_dir: base,
        };
    }

    /// Load configuration from a specific file path
    pub fn load(config_path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", config_path);

        if !config_path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let mut config: Config = toml::from_str(&content)?;

        let base = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        config.paths = PathsConfig {
            config_file: config_path.to_path_buf(),
            control_db_file: base.join("control.db"),
            tenant_db_dir: base.join("tenants"),
            base_dir: base,
        };

        config.validate()?;
        Ok(config)
    }

    /// Default configuration rooted at the given base directory
    pub fn with_base_dir(base_dir: Option<PathBuf>) -> Self {
        let mut config = Config::default();
        config.init_paths(base_dir);
        config
    }

    /// Load configuration from a specific base directory, falling back to
    /// defaults when no config file exists
    pub fn load_from(base_dir: Option<PathBuf>) -> Result<Self> {
        let mut config = Config::with_base_dir(base_dir);

        if config.paths.config_file.exists() {
            debug!("Loading config from {:?}", config.paths.config_file);
            let content = std::fs::read_to_string(&config.paths.config_file)?;
            let mut loaded: Config = toml::from_str(&content)?;
            loaded.paths = config.paths;
            config = loaded;
        } else {
            debug!("No config file found, using defaults");
        }

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.paths.config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.paths.config_file, content)?;
        info!("Saved config to {:?}", self.paths.config_file);
        Ok(())
    }

    /// Read the GitHub token from environment
    pub fn github_token(&self) -> Option<String> {
        std::env::var(&self.forge.github_token_env).ok()
    }

    /// Read the GitLab token from environment
    pub fn gitlab_token(&self) -> Option<String> {
        std::env::var(&self.forge.gitlab_token_env).ok()
    }

    /// Rolling extraction window length
    pub fn extract_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.schedule.extract_interval_mins)
    }

    /// How far the transform window trails extraction
    pub fn transform_offset(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.schedule.transform_offset_mins)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.forge.github_base_url)?;
        url::Url::parse(&self.forge.gitlab_base_url)?;
        if self.crawl.per_page == 0 {
            return Err(Error::Config("crawl.per_page must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be positive".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(Error::Config(
                "retry.multiplier must be at least 1.0".into(),
            ));
        }
        if self.schedule.extract_interval_mins <= 0 {
            return Err(Error::Config(
                "schedule.extract_interval_mins must be positive".into(),
            ));
        }
        Ok(())
    }
}
