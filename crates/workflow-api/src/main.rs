// Workflow engine HTTP API

use anyhow::{Context, Result};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use workflow_api::{engine_setup, state::AppState, workflows};
use workflow_storage::PgStorage;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "workflow_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("workflow-api starting...");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;
    let pg = PgStorage::connect(&database_url).await.context("failed to connect to database")?;
    pg.migrate().await.context("failed to run migrations")?;
    let storage = Arc::new(pg);
    tracing::info!("connected to database");

    let engine = engine_setup::build_engine(storage.clone());
    let state = AppState { storage, engine };

    let app = workflows::routes(state).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    )
    .layer(TraceLayer::new_for_http());

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await.context("failed to bind to address")?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
