use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use concierge_server::chat::typing::spawn_typing_sweep;
use concierge_server::config::{generate_config_template, Config};
use concierge_server::db::{ChatStore, SqliteChatStore};
use concierge_server::routes;
use concierge_server::state::AppState;
use concierge_server::ws::ConnectionRegistry;

/// Close code sent to every socket when the server stops.
const CLOSE_GOING_AWAY: u16 = 1001;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("concierge_server=info"))?;
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(env_filter)
            .init();
    }

    tracing::info!(
        "Concierge chat server v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    // Open the chat database and seed in-memory state from it
    let store: Arc<dyn ChatStore> = Arc::new(SqliteChatStore::open(&config.data_dir)?);
    let app_state = AppState::load(store, config.limits(), config.typing_ttl())
        .await?
        .with_heartbeat(config.heartbeat());

    // Expire typing indicators whose client went quiet
    let sweep = spawn_typing_sweep(app_state.clone(), config.typing_sweep_interval());

    let connections = app_state.connections.clone();
    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(connections))
    .await?;

    sweep.abort();
    tracing::info!("Server stopped");

    Ok(())
}

/// Wait for Ctrl-C, then ask every live socket to close.
async fn shutdown_signal(connections: ConnectionRegistry) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    tracing::info!("Shutdown requested, closing connections");
    connections.close_all(CLOSE_GOING_AWAY, "Server shutting down");
}
