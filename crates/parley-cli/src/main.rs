mod logging;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use parley_agents::{ProtocolBridge, builtin_registry};
use parley_common::ConversationId;
use parley_config::{AppConfig, ConfigLoader};
use parley_db::SqliteStore;
use parley_gateway::{BotRuntime, GatewayServer, SupervisorOutcome};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(author, version, about = "Real-time chat bot over a live event stream")]
struct Cli {
    /// Config file (YAML, or TOML by extension). Defaults to ~/.parley/config.yml
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Verbosity (-v = debug, -vv = trace). RUST_LOG overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the event stream hub that relays envelopes between subscribers
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run the chat bot against the live event stream
    Bot,
    /// Serve the tool registry as JSON-RPC over stdin/stdout
    Mcp {
        /// Conversation whose tool configuration applies
        #[arg(long)]
        conversation: Option<String>,
    },
    /// List registered tools
    Tools {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config = ConfigLoader::new(cli.config.clone())
        .load()
        .context("failed to load configuration")?;

    match cli.command {
        Command::Serve { host, port } => serve(config, host, port).await,
        Command::Bot => bot(config).await,
        Command::Mcp { conversation } => mcp(config, conversation).await,
        Command::Tools { json } => tools(&config, json),
    }
}

fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl+C, shutting down"),
            Err(e) => warn!(error = %e, "failed to listen for Ctrl+C"),
        }
        token.cancel();
    });
    cancel
}

async fn serve(mut config: AppConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        config.gateway.host = host;
    }
    if let Some(port) = port {
        config.gateway.port = port;
    }
    GatewayServer::new(config).run(shutdown_token()).await?;
    Ok(())
}

async fn bot(config: AppConfig) -> Result<()> {
    let runtime = BotRuntime::from_config(config).context("failed to assemble bot")?;
    match runtime.run(shutdown_token()).await {
        SupervisorOutcome::Completed => info!("live connection closed normally"),
        SupervisorOutcome::Cancelled => info!("bot stopped"),
        SupervisorOutcome::Exhausted { attempts } => {
            bail!("live connection failed {attempts} times in a row, giving up")
        }
    }
    Ok(())
}

async fn mcp(config: AppConfig, conversation: Option<String>) -> Result<()> {
    let registry = Arc::new(builtin_registry(Duration::from_secs(
        config.tools.http_timeout_secs,
    ))?);
    let bridge = match conversation {
        Some(id) => {
            let store = Arc::new(SqliteStore::open(&config.database.resolve_path())?);
            ProtocolBridge::with_conversation(registry, store, ConversationId::from(id.as_str()))
        }
        None => ProtocolBridge::new(registry),
    };

    bridge
        .serve(tokio::io::BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await?;
    Ok(())
}

fn tools(config: &AppConfig, json: bool) -> Result<()> {
    let registry = builtin_registry(Duration::from_secs(config.tools.http_timeout_secs))?;
    let definitions = registry.definitions();
    if json {
        println!("{}", serde_json::to_string_pretty(&definitions)?);
        return Ok(());
    }
    for def in definitions {
        let init = if def.requires_init { " (requires init)" } else { "" };
        println!("{}{init}\n    {}", def.name, def.description);
    }
    Ok(())
}
