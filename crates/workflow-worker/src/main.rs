//! Worker process (`spec.md` §6 CLI surface): claims tasks from the
//! Postgres-backed queue and executes them through registered actors. Binds
//! a minimal health endpoint so an operator (or a load balancer) can see the
//! pool is alive without touching the database directly.

mod echo_actor;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use workflow_queue::{GroupConfig, WorkerPool, WorkerPoolConfig, WorkerPoolStatus};
use workflow_storage::PgStorage;

use echo_actor::EchoActor;

/// `spec.md` §6: worker and virtual-server processes share this CLI
/// surface. `--mongo` in the spec names the storage URI generically (a
/// legacy name from the system this was distilled from); since this
/// implementation's document store is Postgres the flag is `--db-url` here
/// (see `DESIGN.md`).
#[derive(Debug, Parser)]
#[command(name = "workflow-worker")]
struct Cli {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = 8090)]
    port: u16,

    #[arg(long, env = "DATABASE_URL")]
    db_url: String,

    #[arg(short = 'v', long)]
    verbose: bool,

    /// `provider:max_concurrent` entries, e.g. `media:4,export:2`.
    #[arg(long, value_delimiter = ',', default_value = "media:4")]
    groups: Vec<String>,
}

#[derive(Clone)]
struct HealthState {
    pool: Arc<WorkerPool<PgStorage>>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    worker_id: String,
}

async fn health(State(state): State<HealthState>) -> Json<HealthResponse> {
    let status = state.pool.status().await;
    Json(HealthResponse {
        status: if status == WorkerPoolStatus::Running { "ok" } else { "draining" },
        worker_id: state.pool.worker_id().to_string(),
    })
}

fn parse_groups(raw: &[String]) -> Vec<GroupConfig> {
    raw.iter()
        .filter_map(|entry| {
            let (group, max) = entry.split_once(':')?;
            Some(GroupConfig {
                group: group.to_string(),
                max_concurrent: max.parse().ok()?,
            })
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(if cli.verbose {
            "workflow_worker=trace,workflow_queue=trace"
        } else {
            "workflow_worker=info,workflow_queue=info"
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("workflow-worker starting...");

    let pg = PgStorage::connect(&cli.db_url).await.context("failed to connect to database")?;
    pg.migrate().await.context("failed to run migrations")?;
    let storage = Arc::new(pg);

    let config = WorkerPoolConfig::new(parse_groups(&cli.groups));
    let pool = Arc::new(WorkerPool::new(storage, config));
    pool.register_actor("media", Arc::new(EchoActor)).await;

    pool.start().await.context("failed to start worker pool")?;
    tracing::info!(worker_id = pool.worker_id(), "worker pool running");

    let health_state = HealthState { pool: pool.clone() };
    let app = Router::new().route("/health", get(health)).with_state(health_state);
    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.context("failed to bind health endpoint")?;
    tracing::info!(%addr, "health endpoint listening");

    let serve = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let exit_code = wait_for_shutdown(&pool).await;
    serve.abort();
    std::process::exit(exit_code);
}

/// Graceful shutdown on the first interrupt, forced exit(1) on the second
/// (`spec.md` §6: "Exit codes: 0 on clean shutdown, 1 on forced
/// termination").
async fn wait_for_shutdown(pool: &Arc<WorkerPool<PgStorage>>) -> i32 {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
    }
    tracing::info!("shutdown signal received, draining in-flight tasks...");

    tokio::select! {
        result = pool.shutdown() => {
            match result {
                Ok(()) => {
                    tracing::info!("worker pool drained cleanly");
                    0
                }
                Err(e) => {
                    tracing::warn!(error = %e, "graceful shutdown did not complete cleanly");
                    1
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("second interrupt received, forcing exit");
            1
        }
        _ = tokio::time::sleep(Duration::from_secs(60)) => {
            tracing::warn!("shutdown watchdog elapsed, forcing exit");
            1
        }
    }
}
