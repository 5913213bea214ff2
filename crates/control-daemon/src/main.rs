//! control-daemon entry point.
//!
//! This file is intentionally thin: it loads config, connects + migrates
//! the database, builds the shared state, wires middleware, and starts the
//! HTTP server. All route handlers live in `routes.rs`; all shared state
//! lives in `state.rs`.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use control_daemon::{routes, state::AppState};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if absent —
    // production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let config_paths = config_paths_from_env();
    let path_refs: Vec<&str> = config_paths.iter().map(String::as_str).collect();
    let (config, loaded) = control_config::ControlConfig::from_layers(&path_refs)
        .context("failed to load layered control-plane config")?;
    info!(config_hash = %loaded.config_hash, "resolved control-plane config");

    let pool = control_db::connect_from_env().await?;
    control_db::migrate(&pool).await?;
    control_db::ensure_slots(&pool, &config.slot_ids).await?;

    let state = Arc::new(AppState::new(pool, config, loaded.config_hash));

    let app = routes::build_router(state).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
    .layer(cors_localhost_only());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8899)));
    info!("control-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("CONTROL_DAEMON_ADDR").ok()?.parse().ok()
}

/// `CONTROL_CONFIG_PATHS` is a colon-separated list of layered YAML files,
/// applied in order (base -> env -> overrides). Falls back to a single
/// `config/base.yaml` if unset.
fn config_paths_from_env() -> Vec<String> {
    match std::env::var("CONTROL_CONFIG_PATHS") {
        Ok(raw) if !raw.is_empty() => raw.split(':').map(str::to_string).collect(),
        _ => vec!["config/base.yaml".to_string()],
    }
}

/// CORS: allow only localhost origins — the Control API is an internal
/// tool surface, never exposed directly to end users.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins.iter().filter_map(|o| HeaderValue::from_str(o).ok()).collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
