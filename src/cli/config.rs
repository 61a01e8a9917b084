// ABOUTME: Runtime configuration for taskweave
// ABOUTME: Loads settings from YAML files in standard locations and applies environment overrides

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Global cap on concurrently running task executions
    pub max_concurrent_tasks: usize,

    pub max_concurrent_workflows: usize,

    /// Applied to tasks that carry no timeout of their own
    #[serde(with = "humantime_serde")]
    pub default_task_timeout: Option<Duration>,

    #[serde(with = "humantime_serde")]
    pub resource_sample_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub rebalance_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub wait_poll_interval: Duration,

    pub resource_monitoring: bool,

    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            max_concurrent_workflows: 10,
            default_task_timeout: None,
            resource_sample_interval: Duration::from_secs(5),
            rebalance_interval: Duration::from_secs(30),
            wait_poll_interval: Duration::from_millis(100),
            resource_monitoring: true,
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file path or default locations
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => Self::find_config_file(),
        };

        let mut config = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            serde_yaml::from_str(&contents)?
        } else {
            Config::default()
        };

        config.merge_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> PathBuf {
        let candidates = [
            "taskweave.yaml",
            "taskweave.yml",
            ".taskweave.yaml",
            ".taskweave.yml",
        ];

        for candidate in candidates {
            let path = PathBuf::from(candidate);
            if path.exists() {
                return path;
            }
        }

        if let Some(home_dir) = dirs::home_dir() {
            let home_config = home_dir.join(".taskweave").join("config.yaml");
            if home_config.exists() {
                return home_config;
            }
        }

        PathBuf::from("taskweave.yaml")
    }

    fn merge_env(&mut self) -> Result<()> {
        if let Ok(max_tasks) = std::env::var("TASKWEAVE_MAX_CONCURRENT") {
            self.max_concurrent_tasks = max_tasks.parse()?;
        }
        if let Ok(max_workflows) = std::env::var("TASKWEAVE_MAX_WORKFLOWS") {
            self.max_concurrent_workflows = max_workflows.parse()?;
        }
        if let Ok(level) = std::env::var("TASKWEAVE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("TASKWEAVE_LOG_FORMAT") {
            self.logging.format = format;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            anyhow::bail!("max_concurrent_tasks must be at least 1");
        }
        if self.max_concurrent_workflows == 0 {
            anyhow::bail!("max_concurrent_workflows must be at least 1");
        }
        if self.wait_poll_interval.is_zero() {
            anyhow::bail!("wait_poll_interval must be greater than zero");
        }
        Ok(())
    }
}
