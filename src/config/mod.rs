mod file_config;

pub use file_config::{FileConfig, SchedulerConfig};

use anyhow::{bail, Context, Result};
use std::path::PathBuf;

pub const DEFAULT_PROVIDER_URL: &str = "https://apihub.copernicus.eu/apihub";

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub data_dir: Option<PathBuf>,
    pub schedule_path: Option<PathBuf>,
    pub port: u16,
    pub provider_url: Option<String>,
    pub provider_timeout_secs: u64,
    pub poll_interval_mins: u64,
    pub tick_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub data_dir: PathBuf,
    pub schedule_path: PathBuf,
    pub port: u16,
    pub provider_url: String,
    pub provider_timeout_secs: u64,

    // Polling engine settings (with defaults)
    pub scheduler: SchedulerSettings,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub poll_interval_mins: u64,
    pub tick_interval_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval_mins: 30,
            tick_interval_secs: 1,
        }
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        // TOML overrides CLI for each field
        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .or_else(|| cli.data_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("data_dir must be specified via --data-dir or in config file")
            })?;

        // The data directory is created on startup; a file in its place is
        // a configuration mistake.
        if data_dir.exists() && !data_dir.is_dir() {
            bail!("data_dir is not a directory: {:?}", data_dir);
        }
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;

        let schedule_path = file
            .schedule_path
            .map(PathBuf::from)
            .or_else(|| cli.schedule_path.clone())
            .unwrap_or_else(|| data_dir.join("schedule.json"));

        let port = file.port.unwrap_or(cli.port);

        let provider_url = file
            .provider_url
            .or_else(|| cli.provider_url.clone())
            .unwrap_or_else(|| DEFAULT_PROVIDER_URL.to_string());

        let provider_timeout_secs = file
            .provider_timeout_secs
            .unwrap_or(cli.provider_timeout_secs);

        // Polling engine settings - TOML overrides CLI, zero is invalid
        // from either source.
        let sched_file = file.scheduler.unwrap_or_default();
        let poll_interval_mins = sched_file
            .poll_interval_mins
            .unwrap_or(cli.poll_interval_mins);
        let tick_interval_secs = sched_file
            .tick_interval_secs
            .unwrap_or(cli.tick_interval_secs);
        if poll_interval_mins == 0 {
            bail!("poll_interval_mins must be greater than zero");
        }
        if tick_interval_secs == 0 {
            bail!("tick_interval_secs must be greater than zero");
        }

        Ok(Self {
            data_dir,
            schedule_path,
            port,
            provider_url,
            provider_timeout_secs,
            scheduler: SchedulerSettings {
                poll_interval_mins,
                tick_interval_secs,
            },
        })
    }
}
