//! appforge - agentic web application generation server

use appforge_core::ServerConfig;
use appforge_server::start_server;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "appforge", about = "Agentic web application generation server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the generation server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(short, long)]
        bind: Option<String>,
        /// Directory holding template trees
        #[arg(short, long)]
        templates: Option<PathBuf>,
        /// Directory snapshots are written under
        #[arg(short, long)]
        snapshots: Option<PathBuf>,
        /// Replay-cache directory (record mode; replay via APPFORGE_REPLAY_MODE)
        #[arg(long)]
        replay_cache: Option<PathBuf>,
    },
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("info,appforge_agent=info,appforge_server=info")
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Serve {
            port,
            bind,
            templates,
            snapshots,
            replay_cache,
        }) => {
            let mut config = ServerConfig::from_env();
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if let Some(templates) = templates {
                config.template_root = templates;
            }
            if let Some(snapshots) = snapshots {
                config.snapshot_root = snapshots;
            }
            if let Some(replay_cache) = replay_cache {
                config.replay_cache = Some(replay_cache);
            }
            start_server(config).await
        }
        Some(Commands::Version) | None => {
            println!("appforge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
