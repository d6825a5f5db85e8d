//! Tool configuration, read from `fng.toml` at the project root.
//!
//! Every key has a default, so a missing file is not an error. Relative
//! paths resolve against the project root.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::error::FngError;
use crate::core::schemas;

pub const CONFIG_FILE_NAME: &str = "fng.toml";

pub const DEFAULT_API_URL: &str = "https://production.dataviz.cnn.io/index/fearandgreed/graphdata/";

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub storage: StorageConfig,
    pub schedule: ScheduleConfig,
    pub version_control: VersionControlConfig,
    pub docs: DocsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceConfig {
    pub api_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub user_agent: String,
    /// First date requested when the store is empty.
    pub backfill_start: NaiveDate,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            timeout_secs: 30,
            max_retries: 3,
            retry_delay_secs: 5,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            backfill_start: NaiveDate::from_ymd_opt(2011, 1, 1).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub db_file: PathBuf,
    pub snapshots_dir: PathBuf,
    pub max_snapshots: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_file: PathBuf::from(schemas::FNG_DB_NAME),
            snapshots_dir: PathBuf::from("output/backups"),
            max_snapshots: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScheduleConfig {
    pub interval_hours: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self { interval_hours: 24 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VersionControlConfig {
    pub enabled: bool,
    pub push: bool,
    /// Fail the run when the commit fails.
    pub strict: bool,
    pub repo_root: Option<PathBuf>,
}

impl Default for VersionControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            push: false,
            strict: false,
            repo_root: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DocsConfig {
    pub readme_path: PathBuf,
    pub trend_days: usize,
}

impl Default for DocsConfig {
    fn default() -> Self {
        Self {
            readme_path: PathBuf::from("README.md"),
            trend_days: 30,
        }
    }
}

impl Config {
    /// Loads `explicit` if given (must exist), else `<root>/fng.toml` if present.
    pub fn load(root: &Path, explicit: Option<&Path>) -> Result<Config, FngError> {
        let path = match explicit {
            Some(p) => {
                if !p.exists() {
                    return Err(FngError::NotFound(format!("config file {}", p.display())));
                }
                p.to_path_buf()
            }
            None => root.join(CONFIG_FILE_NAME),
        };
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(&path)?;
        let config = Config::parse(&content)?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Config, FngError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FngError> {
        if self.source.api_url.trim().is_empty() {
            return Err(FngError::Config("source.api_url must not be empty".into()));
        }
        if self.source.max_retries == 0 {
            return Err(FngError::Config("source.max_retries must be at least 1".into()));
        }
        if self.schedule.interval_hours == 0 {
            return Err(FngError::Config("schedule.interval_hours must be positive".into()));
        }
        if self.storage.max_snapshots == 0 {
            return Err(FngError::Config("storage.max_snapshots must be at least 1".into()));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.schedule.interval_hours * 3600)
    }
}

/// Config with every path made absolute against a project root.
#[derive(Debug, Clone)]
pub struct Layout {
    pub root: PathBuf,
    pub db_path: PathBuf,
    pub snapshots_dir: PathBuf,
    pub readme_path: PathBuf,
    pub repo_root: PathBuf,
}

impl Layout {
    pub fn resolve(root: &Path, config: &Config) -> Layout {
        let abs = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                root.join(p)
            }
        };
        Layout {
            root: root.to_path_buf(),
            db_path: abs(&config.storage.db_file),
            snapshots_dir: abs(&config.storage.snapshots_dir),
            readme_path: abs(&config.docs.readme_path),
            repo_root: config
                .version_control
                .repo_root
                .as_deref()
                .map(abs)
                .unwrap_or_else(|| root.to_path_buf()),
        }
    }
}
