use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use storygen::config::AppConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "storygen")]
#[command(version, about = "WebSocket gateway for streamed story and illustration generation")]
pub struct Cli {
    /// Verbose logging (RUST_LOG overrides this)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the gateway server
    Serve {
        /// Listen port (overrides PORT and storygen.toml)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Generate a story from the terminal against a running gateway
    Client {
        /// Keywords to build the story from
        keywords: String,

        /// Gateway base URL
        #[arg(long, default_value = "ws://127.0.0.1:8000")]
        url: String,

        /// Directory to save received images into
        #[arg(long)]
        save_images: Option<PathBuf>,

        /// Reconnect attempts before giving up (3-second fixed delay)
        #[arg(long, default_value_t = 5)]
        max_reconnects: u32,
    },
    /// Print resolved configuration and probe outbound connectivity
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = AppConfig::load(std::path::Path::new("."))?;

    match &cli.command {
        Commands::Serve { port } => {
            let mut config = config;
            if let Some(port) = port {
                config.server.port = *port;
            }
            cmd::cmd_serve(config).await
        }
        Commands::Client {
            keywords,
            url,
            save_images,
            max_reconnects,
        } => cmd::cmd_client(url, keywords, save_images.as_deref(), *max_reconnects).await,
        Commands::Check => cmd::cmd_check(&config).await,
    }
}

fn init_tracing(verbose: bool) {
    let default_directives = if verbose {
        "storygen=debug,info"
    } else {
        "storygen=info,warn"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
