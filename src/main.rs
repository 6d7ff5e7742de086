use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::anyhow;
use axum::Router;
use clap::Parser;
use http::{
    Method,
    header::{AUTHORIZATION, CONTENT_TYPE},
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use voicebridge_gateway::{AppState, ServerConfig, routes};

/// VoiceBridge Gateway - realtime telephony-to-speech-AI bridge
#[derive(Parser, Debug)]
#[command(name = "voicebridge-gateway")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration from file or environment
    let config = if let Some(config_path) = cli.config {
        println!("Loading configuration from {}", config_path.display());
        ServerConfig::from_file(&config_path).map_err(|e| anyhow!(e.to_string()))?
    } else {
        ServerConfig::from_env().map_err(|e| anyhow!(e.to_string()))?
    };

    let address = config.address();
    println!("Starting server on {address}");

    // Create application state
    let app_state = AppState::new(config);

    // Same-origin CORS; the telephony peer connects server-to-server and
    // needs no cross-origin grants
    let cors_layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    // Combine routes: media stream + management surface
    let app: Router = routes::create_media_router()
        .merge(routes::create_api_router())
        .with_state(app_state)
        .layer(cors_layer);

    // Parse socket address
    let socket_addr: SocketAddr = address
        .parse()
        .map_err(|e| anyhow!("Invalid server address '{}': {}", address, e))?;

    println!("Server listening on http://{}", socket_addr);

    let listener = TcpListener::bind(&socket_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
