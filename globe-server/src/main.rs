mod config;
mod discovery;
mod scheduler;
mod server;

use clap::{Parser, Subcommand};
use config::Config;
use globe_core::KeyPair;
use server::run_server;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "globe")]
#[command(about = "Owner-keyed replicated file storage node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Server {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Generate an owner key pair and print it as hex
    Keygen,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "globe=info,globe_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config } => {
            tracing::info!("Starting Globe server with config: {}", config);

            let cfg = match Config::from_file(&config) {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!("Failed to load config: {}", e);
                    std::process::exit(1);
                }
            };

            tracing::info!(
                "Server ID: {}, Bind: {}, Data: {}",
                cfg.node.server_id,
                cfg.node.bind_addr,
                cfg.node.data_dir.display()
            );

            if let Err(e) = run_server(cfg).await {
                tracing::error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Keygen => {
            let keys = KeyPair::generate();
            println!("public: {}", keys.public_key().to_hex());
            println!("secret: {}", keys.secret_hex());
        }
    }

    Ok(())
}
