use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;

use common::mask::Mask;
use server::{api, config, guard, hub, store, turnstile};

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down..."),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("server=info".parse().unwrap()),
        )
        .init();

    let config = config::Config::from_env();
    tracing::info!("Starting server on {}", config.bind_addr);

    let store = Arc::new(store::StateStore::connect(&config.state_store_url).await?);
    tracing::info!("State store ready ({})", config.state_store_url);

    let mask = match (&config.mask_path, config.mask_bounds) {
        (Some(path), Some(bounds)) => {
            let mask = Mask::load(path, bounds)?;
            tracing::info!(
                "Loaded mask {} ({}x{} tiles)",
                path,
                bounds.width(),
                bounds.height()
            );
            Some(mask)
        }
        (Some(_), None) => anyhow::bail!("MASK_PATH is set but MASK_BOUNDS is missing or invalid"),
        _ => {
            tracing::info!("No mask configured, using the lat/lon prefilter");
            None
        }
    };

    let verifier = if config.enable_token_check {
        tracing::info!("Token verification enabled");
        Some(turnstile::TurnstileClient::new(config.token_secret.clone()))
    } else {
        None
    };

    let guard = Arc::new(guard::AdmissionGuard::new(&config, mask, verifier));
    let hub = Arc::new(hub::Hub::new(config.sub_outbox_cap));

    let state = api::AppState {
        store,
        hub,
        guard,
        config: Arc::new(config.clone()),
    };

    let app = api::router(state).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Server stopped.");
    Ok(())
}
