use clap::Parser;
use log::{error, info};
use server::config::ServerConfig;
use server::network::RelayServer;
use server::state::ServerState;
use std::path::PathBuf;
use std::sync::Arc;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the JSON configuration file
    #[clap(short, long, default_value = "server.json")]
    config: PathBuf,
    /// TCP port to listen on (overrides the config file)
    #[clap(short, long)]
    port: Option<u16>,
    /// Maximum number of simultaneous clients (overrides the config file)
    #[clap(short, long)]
    max_clients: Option<usize>,
    /// Message shown to every client on connect (overrides the config file)
    #[clap(short, long)]
    join_message: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match ServerConfig::load(&args.config) {
        Ok(config) => {
            info!("Loaded configuration from {}", args.config.display());
            config
        }
        Err(e) => {
            info!("Using default configuration ({}: {})", args.config.display(), e);
            ServerConfig::default()
        }
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(max_clients) = args.max_clients {
        config.max_clients = max_clients;
    }
    if let Some(join_message) = args.join_message {
        config.join_message = join_message;
    }

    let state = Arc::new(ServerState::new(config));
    let server = RelayServer::bind(Arc::clone(&state)).await?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            state.shutdown_all("Server is shutting down").await;
        }
    }

    Ok(())
}
