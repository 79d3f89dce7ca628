//! Main Entrypoint for the Joinly Manager API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing logging.
//! 3. Building the agent supervisor with its MCP transport and LLM providers.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and stopping all agents on shutdown.

use anyhow::Context;
use axum::http::HeaderValue;
use joinly_api::{
    config::{Config, CorsOrigins, LogFormat},
    joinly::McpConnectionFactory,
    router::create_router,
    state::AppState,
};
use joinly_core::{
    Supervisor, SupervisorSettings,
    llm::{CredentialedProviders, ProviderCredentials},
};
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info};

/// Waits for `Ctrl+C`, then stops every agent. Stopping the supervisor
/// closes the event hub, which ends the open WebSocket streams so the server
/// can drain.
async fn shutdown_signal(supervisor: Supervisor) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {e}");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Stopping agents...");
    supervisor.shutdown().await;
    info!("All agents stopped. Draining connections...");
}

fn init_tracing(config: &Config) {
    let builder = tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339());
    match config.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn cors_layer(origins: &CorsOrigins) -> anyhow::Result<CorsLayer> {
    let allow_origin = match origins {
        CorsOrigins::Any => AllowOrigin::any(),
        CorsOrigins::List(list) => AllowOrigin::list(
            list.iter()
                .map(|o| HeaderValue::from_str(o).with_context(|| format!("Invalid CORS origin {o}")))
                .collect::<anyhow::Result<Vec<_>>>()?,
        ),
    };
    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    init_tracing(&config);
    info!("Configuration loaded. Initializing agent supervisor...");

    // --- 3. Initialize the Supervisor ---
    let connections = Arc::new(McpConnectionFactory::new(
        config.joinly_url.clone(),
        config.request_timeout,
    ));
    let providers = Arc::new(CredentialedProviders::new(ProviderCredentials {
        openai_api_key: config.openai_api_key.clone(),
        anthropic_api_key: config.anthropic_api_key.clone(),
        google_api_key: config.google_api_key.clone(),
        ollama_base_url: Some(config.ollama_url.clone()),
    }));
    let settings = SupervisorSettings {
        max_agents: config.max_agents,
        poll_interval: config.poll_interval,
        analysis_dir: config.analysis_dir.clone(),
        ..SupervisorSettings::default()
    };
    let supervisor = Supervisor::new(settings, connections, providers);

    let app_state = Arc::new(AppState {
        supervisor: supervisor.clone(),
        config: Arc::new(config.clone()),
    });

    // --- 4. Create Router and Apply Middleware ---
    let app = create_router(app_state).layer(cors_layer(&config.cors_origins)?);

    // --- 5. Start Server ---
    info!(
        joinly_url = %config.joinly_url,
        max_agents = config.max_agents,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(supervisor.clone()))
    .await?;

    // No-op after a signal; covers the server exiting on its own.
    supervisor.shutdown().await;
    info!("Server has shut down.");
    Ok(())
}
