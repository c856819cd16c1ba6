use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use pkg_api::server::{ServerConfig, start_server};
use pkg_constants::controller::{
    DEFAULT_REMOTE_TIMEOUT_SECS, DEFAULT_RESYNC_INTERVAL_SECS, DEFAULT_RETRY_INTERVAL_SECS,
    DEFAULT_WORKERS,
};
use pkg_constants::network::{DEFAULT_API_PORT, DEFAULT_TOKEN};
use pkg_constants::paths::{DEFAULT_SERVER_CONFIG, DEFAULT_SERVER_DATA_DIR};
use pkg_types::config::{ServerConfigFile, load_config_file};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(
    name = "rbacfleet-server",
    about = "Propagates RBAC from a central store to a fleet of clusters"
)]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_SERVER_CONFIG)]
    config: String,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Directory for SlateDB state storage
    #[arg(long)]
    data_dir: Option<String>,

    /// Bearer token required on every API call
    #[arg(long)]
    token: Option<String>,

    /// Concurrent RoleBinding reconcile workers
    #[arg(long)]
    workers: Option<usize>,

    /// Seconds between full resyncs
    #[arg(long)]
    resync_interval_secs: Option<u64>,

    /// Seconds before a run with failed clusters is retried
    #[arg(long)]
    retry_interval_secs: Option<u64>,

    /// Deadline in seconds for each member cluster call
    #[arg(long)]
    remote_timeout_secs: Option<u64>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    // Load config file (returns defaults if file not found)
    let file_cfg: ServerConfigFile = load_config_file(&cli.config)?;
    info!("Config file: {}", cli.config);

    // Merge: CLI args > config file > defaults
    let port = cli.port.or(file_cfg.port).unwrap_or(DEFAULT_API_PORT);
    let data_dir = cli
        .data_dir
        .or(file_cfg.data_dir)
        .unwrap_or_else(|| DEFAULT_SERVER_DATA_DIR.to_string());
    let token = cli
        .token
        .or(file_cfg.token)
        .unwrap_or_else(|| DEFAULT_TOKEN.to_string());
    let workers = cli
        .workers
        .or(file_cfg.workers)
        .unwrap_or(DEFAULT_WORKERS)
        .max(1);
    let resync = cli
        .resync_interval_secs
        .or(file_cfg.resync_interval_secs)
        .unwrap_or(DEFAULT_RESYNC_INTERVAL_SECS);
    let retry = cli
        .retry_interval_secs
        .or(file_cfg.retry_interval_secs)
        .unwrap_or(DEFAULT_RETRY_INTERVAL_SECS);
    let remote_timeout = cli
        .remote_timeout_secs
        .or(file_cfg.remote_timeout_secs)
        .unwrap_or(DEFAULT_REMOTE_TIMEOUT_SECS);

    info!("Starting rbacfleet-server");
    info!("  Port:      {}", port);
    info!("  Data dir:  {}", data_dir);
    info!("  Token:     {}***", token.chars().take(4).collect::<String>());
    info!("  Workers:   {}", workers);
    info!(
        "  Intervals: resync={}s retry={}s remote-timeout={}s",
        resync, retry, remote_timeout
    );

    let config = ServerConfig {
        addr: SocketAddr::from(([0, 0, 0, 0], port)),
        data_dir,
        token,
        workers,
        resync_interval: Duration::from_secs(resync.max(1)),
        retry_interval: Duration::from_secs(retry.max(1)),
        remote_timeout: Duration::from_secs(remote_timeout.max(1)),
    };

    start_server(config).await?;

    Ok(())
}
