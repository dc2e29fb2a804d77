mod config;
mod moves;
mod registry;
mod routes;
mod state;
mod upkeep;

use std::sync::Arc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()
        .expect("invalid PORT");

    let registry = registry::Registry::new(config::RegistryConfig::from_env());
    registry.spawn_upkeep();

    let state = state::AppState::new(registry.clone(), Arc::new(moves::PassthroughProcessor));
    let app = routes::app(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "parlor sync listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server failed");

    registry.shutdown();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
