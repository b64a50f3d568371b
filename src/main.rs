//! WolfTable - Distributed Replicated MergeTree Table Engine
//!
//! Node binary: runs one replica of a replicated table with its part
//! exchange endpoint and HTTP API.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolftable::api::ApiServer;
use wolftable::config::WolfTableConfig;
use wolftable::coordinator::CoordinatorService;
use wolftable::error::Result;
use wolftable::exchange::{ExchangeHandler, ExchangeServer};
use wolftable::table::ReplicatedTable;

/// WolfTable - Distributed Replicated MergeTree Table Engine
#[derive(Parser)]
#[command(name = "wolftable")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolftable.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the replica, creating the table if needed
    Start {
        /// Attach to an existing replica registration and reconcile
        /// local parts against it
        #[arg(long)]
        attach: bool,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolftable.toml")]
        output: PathBuf,

        /// Replica name
        #[arg(long, default_value = "r1")]
        replica: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Start { attach } => run_start(cli.config, attach).await,
        Commands::Init { output, replica } => run_init(output, replica),
        Commands::Validate => {
            WolfTableConfig::load(&cli.config)?;
            println!("configuration is valid");
            Ok(())
        }
    }
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_start(config_path: PathBuf, attach: bool) -> Result<()> {
    let config = WolfTableConfig::load(&config_path)?;

    // The node embeds its coordination service; a deployment pointing
    // several processes at a shared ensemble would hand in a client for
    // it here instead.
    let service = CoordinatorService::new();

    let exchange = ExchangeHandler::new();
    let exchange_server =
        ExchangeServer::bind(&config.node.exchange_bind, exchange.clone()).await?;

    let api_config = config.api.clone();
    let table = ReplicatedTable::open(
        config,
        Some(service),
        exchange,
        exchange_server.port(),
        attach,
    )
    .await?;

    let api = ApiServer::new(api_config, table.clone());
    api.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    table.shutdown().await;
    exchange_server.shutdown();
    Ok(())
}

fn run_init(output: PathBuf, replica: String) -> Result<()> {
    let example = format!(
        r#"[node]
replica_name = "{replica}"
data_dir = "./data"
exchange_bind = "127.0.0.1:9412"
host = "127.0.0.1"

[table]
name = "hits"
coordinator_path = "/wolftable/hits"
date_column = "event_date"
primary_key = "(counter_id, event_date)"
columns = [
    {{ name = "event_date", type = "Date" }},
    {{ name = "counter_id", type = "UInt32" }},
    {{ name = "value", type = "String" }},
]

[replication]
max_replicated_merges_in_queue = 6
replicated_deduplication_window = 100

[api]
enabled = true
bind = "127.0.0.1:9413"
"#
    );
    std::fs::write(&output, example)?;
    println!("wrote {}", output.display());
    Ok(())
}
