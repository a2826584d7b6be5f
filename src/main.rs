use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sentinel_acquisition_server::acquisition::{
    CopernicusClient, FileBackedRegistry, NoOpProcessor, PollManager, RequestScheduler,
};
use sentinel_acquisition_server::config::{AppConfig, CliConfig, FileConfig};
use sentinel_acquisition_server::server::{run_server, ServerState};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML config file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory where product archives are downloaded and unpacked.
    #[clap(long, value_parser = parse_path)]
    pub data_dir: Option<PathBuf>,

    /// Path of the acquisition schedule file. Defaults to schedule.json
    /// inside the data directory.
    #[clap(long, value_parser = parse_path)]
    pub schedule_path: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 3001)]
    pub port: u16,

    /// Base URL of the Copernicus hub.
    #[clap(long)]
    pub provider_url: Option<String>,

    /// Timeout in seconds for provider requests.
    #[clap(long, default_value_t = 300)]
    pub provider_timeout_secs: u64,

    /// Minutes between polling attempts for an unresolved request.
    #[clap(long, default_value_t = 30)]
    pub poll_interval_mins: u64,

    /// Seconds between scheduler ticks.
    #[clap(long, default_value_t = 1)]
    pub tick_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let cli_config = CliConfig {
        data_dir: cli_args.data_dir.clone(),
        schedule_path: cli_args.schedule_path.clone(),
        port: cli_args.port,
        provider_url: cli_args.provider_url.clone(),
        provider_timeout_secs: cli_args.provider_timeout_secs,
        poll_interval_mins: cli_args.poll_interval_mins,
        tick_interval_secs: cli_args.tick_interval_secs,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    info!("Opening acquisition schedule at {:?}...", config.schedule_path);
    let registry = Arc::new(FileBackedRegistry::new(&config.schedule_path)?);

    let provider = Arc::new(CopernicusClient::new(
        config.provider_url.clone(),
        config.provider_timeout_secs,
    )?);
    info!("Using provider at {}", provider.base_url());

    let poller = PollManager::new(
        Duration::from_secs(config.scheduler.poll_interval_mins * 60),
        Duration::from_secs(config.scheduler.tick_interval_secs),
    );
    let scheduler = RequestScheduler::new(
        registry,
        provider,
        Arc::new(NoOpProcessor),
        Arc::clone(&poller),
        config.data_dir.clone(),
    );

    let shutdown = CancellationToken::new();
    let poller_task = tokio::spawn(Arc::clone(&poller).run(shutdown.clone()));

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal_token.cancel();
        }
    });

    let state = ServerState { scheduler };
    run_server(config.port, state, shutdown.clone()).await?;

    shutdown.cancel();
    poller_task.await.ok();
    info!("Bye!");
    Ok(())
}
