use std::sync::Arc;

use tower_http::cors::CorsLayer;

use trivia_backend::config::Config;
use trivia_backend::db::Database;
use trivia_backend::notify::Notifier;
use trivia_backend::{api, lifecycle, metrics};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::load();
    metrics::register_metrics();

    let db = Database::new(&config.database_url)
        .await
        .expect("Failed to initialize database");
    let db = Arc::new(db);

    // Background workers: notification outbox and tournament lifecycle
    let notifier = Notifier::spawn(db.clone());
    lifecycle::spawn_lifecycle_worker(db.clone(), lifecycle::DEFAULT_TICK);

    if config.local_mode {
        tracing::warn!("Local mode: local login enabled, energy checks bypassed");
    }

    let app = api::app(&config, db, notifier).layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to {addr}: {e}"));

    tracing::info!("Trivia backend listening on {addr}");
    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
