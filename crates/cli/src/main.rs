mod auth_commands;
mod device_commands;
mod pair_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    hublink_config::{HublinkConfig, discover_and_load, load_config},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "hublink", about = "Hublink: vendor cloud bridge for local devices")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file to use instead of the discovered one.
    #[arg(long, global = true, env = "HUBLINK_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the webhook receiver, registrar and diagnostic listener.
    Serve,
    /// Pair devices from a vendor account, or log in again for a saved session.
    Pair(pair_commands::PairArgs),
    /// Saved vendor sessions.
    Auth {
        #[command(subcommand)]
        action: auth_commands::AuthAction,
    },
    /// Paired devices.
    Devices {
        #[command(subcommand)]
        action: device_commands::DeviceAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

fn load(cli: &Cli) -> anyhow::Result<HublinkConfig> {
    match &cli.config {
        Some(path) => load_config(path),
        None => Ok(discover_and_load()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "hublink starting");
    let config = load(&cli)?;

    match cli.command {
        Commands::Serve => hublink_gateway::server::start(config).await,
        Commands::Pair(args) => pair_commands::handle_pair(config, args).await,
        Commands::Auth { action } => auth_commands::handle_auth(config, action),
        Commands::Devices { action } => device_commands::handle_devices(config, action),
    }
}
