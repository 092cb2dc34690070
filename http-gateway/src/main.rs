mod config;
mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use rabbitmq_client::{ConnectionConfig, ConnectionManager, ExchangeKind, ExchangeSpec, Publisher, PublisherConfig};
use stderrlog::Timestamp;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("FATAL ERROR: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    stderrlog::new()
        .verbosity(log::Level::Info)
        .timestamp(Timestamp::Millisecond)
        .show_module_names(true)
        .init()
        .unwrap();

    log::info!("=== HTTP Gateway Starting ===");
    match dotenvy::dotenv() {
        Ok(_) => log::info!("Environment variables loaded from .env file"),
        Err(_) => log::info!("No .env file found, using system environment variables"),
    }

    let gateway_config = config::GatewayConfig::from_env()?;
    log::info!("Gateway port: {}", gateway_config.port);

    let connection = ConnectionConfig::from_env();
    log::info!("Connecting to {}", connection.masked_url());
    let manager = Arc::new(ConnectionManager::new(connection));

    let exchange_name = std::env::var("RABBITMQ_EXCHANGE").unwrap_or_else(|_| "events".to_string());
    let service = std::env::var("RABBITMQ_SERVICE_NAME").unwrap_or_else(|_| "http-gateway".to_string());
    let exchange = ExchangeSpec::new(exchange_name, ExchangeKind::Fanout, service, 0);
    let publisher_config = PublisherConfig {
        connection: ConnectionConfig::from_env(),
        exchange,
        confirmable: true,
    };

    let publisher = Arc::new(Publisher::start(manager, publisher_config).await?);
    let state = handlers::AppState { publisher };

    let app = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], gateway_config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("HTTP gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    log::info!("HTTP gateway shutdown complete");
    Ok(())
}

fn create_router(state: handlers::AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/up", get(handlers::up))
        .route("/entry", get(handlers::entry_hint).post(handlers::entry_publish))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down gracefully...");
        },
        _ = terminate => {
            log::info!("Received terminate signal, shutting down gracefully...");
        },
    }
}
