mod auth;
mod chat;
mod config;
mod db;
mod notify;
mod relay;
mod routes;
mod state;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use config::{generate_config_template, Config};
use relay::EventBus;

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
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "taller_chat_server=info".parse().unwrap()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "taller_chat_server=info".parse().unwrap()),
            )
            .init();
    }

    tracing::info!("Taller chat server v{} starting", env!("CARGO_PKG_VERSION"));

    // Initialize SQLite database
    let db = db::init_db(&config.data_dir)?;

    // Load or generate JWT signing key (256-bit random, stored in data_dir)
    let jwt_secret = auth::jwt::load_or_generate_jwt_secret(&config.data_dir)?;

    // --- Relay backbone selection ---
    // Backbone trouble never blocks startup: chat degrades to local-only.
    let instance_id = config.resolve_instance_id();
    let bus: Arc<dyn EventBus> = match &config.redis_url {
        Some(url) => match relay::redis::RedisBus::connect(url).await {
            Ok(bus) => {
                tracing::info!(instance_id = %instance_id, "Cross-instance relay enabled via Redis");
                Arc::new(bus)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Relay backbone unreachable, running local-only");
                Arc::new(relay::NoopBus)
            }
        },
        None => {
            tracing::info!("No relay backbone configured, running single-instance");
            Arc::new(relay::NoopBus)
        }
    };

    // Connection registry + relay listener
    let registry = chat::registry::ChatRegistry::new(bus.clone(), instance_id);
    relay::spawn_relay_listener(bus, registry.clone());

    // Idle reaper
    let chat_config = config.chat.clone().unwrap_or_default();
    chat::reaper::spawn_idle_reaper(
        registry.clone(),
        Duration::from_secs(chat_config.sweep_interval_secs),
        Duration::from_secs(chat_config.connection_timeout_secs),
    );
    tracing::info!(
        sweep_interval_secs = chat_config.sweep_interval_secs,
        connection_timeout_secs = chat_config.connection_timeout_secs,
        "Idle reaper started"
    );

    // Build application state
    let app_state = state::AppState {
        registry: registry.clone(),
        store: Arc::new(chat::store::SqliteChatStore::new(db)),
        validator: Arc::new(auth::jwt::JwtValidator::new(jwt_secret.clone())),
        notifier: Arc::new(notify::LogNotifier),
        jwt_secret,
    };

    // Build router
    let app = routes::build_router(app_state);

    // Bind and serve; ctrl-c closes the registry (reaper, relay listener and
    // every connection) before the server returns.
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    let shutdown_registry = registry.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
            shutdown_registry.close();
        })
        .await?;

    Ok(())
}
