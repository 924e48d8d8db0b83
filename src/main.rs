use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use wzrpc::arith::Arith;
use wzrpc::config::AppConfig;
use wzrpc::logging::{self, LogConfig};
use wzrpc::rpc::{ChanPool, Server, tcp_factory};

#[derive(Parser)]
#[command(name = "wzrpc")]
#[command(about = "Minimal JSON-over-TCP RPC server and client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./wzrpc.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    verbose: bool,

    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the Arith service
    Serve(ServeArgs),
    /// Call a remote method and print the result
    Call(CallArgs),
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[derive(Args)]
struct CallArgs {
    /// Dotted method name, e.g. Arith.Double
    method: String,

    /// Request payload as JSON
    #[arg(default_value = "null")]
    params: String,

    #[arg(long)]
    addr: Option<SocketAddr>,

    #[arg(long)]
    timeout_ms: Option<u64>,
}

/// Command-line values layered over the configuration file.
#[derive(Serialize, Default)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    call_timeout_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    json_logs: Option<bool>,
}

impl Overrides {
    fn from_cli(cli: &Cli) -> Self {
        let mut overrides = Overrides {
            verbose: cli.verbose.then_some(true),
            json_logs: cli.json_logs.then_some(true),
            ..Default::default()
        };

        match &cli.command {
            Commands::Serve(args) => overrides.bind = args.bind,
            Commands::Call(args) => {
                overrides.bind = args.addr;
                overrides.call_timeout_ms = args.timeout_ms;
            }
        }

        overrides
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let overrides = Overrides::from_cli(&cli);
    let config = AppConfig::new(cli.config.as_deref(), Some(&overrides))
        .context("Failed to load configuration")?;

    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    match &cli.command {
        Commands::Serve(_) => run_serve(config).await.context("Failed to run server")?,
        Commands::Call(args) => run_call(config, args).await.context("Call failed")?,
    }

    Ok(())
}

async fn run_serve(config: AppConfig) -> Result<()> {
    let server = Arc::new(Server::new(config.bind.to_string()));
    server.register(Arith).await?;

    let signal_server = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            signal_server.shutdown();
        }
    });

    server.serve().await?;
    Ok(())
}

async fn run_call(config: AppConfig, args: &CallArgs) -> Result<()> {
    let params: Value =
        serde_json::from_str(&args.params).context("Request payload is not valid JSON")?;

    let pool = ChanPool::new(config.pool_capacity, tcp_factory(config.bind.to_string()))?;
    let mut conn = pool
        .get()
        .await
        .with_context(|| format!("Failed to connect to {}", config.bind))?;

    let outcome = conn
        .call_with_timeout::<Value, Value>(&args.method, &params, config.call_timeout())
        .await;

    conn.close().await?;
    pool.close().await;

    let result = outcome?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
