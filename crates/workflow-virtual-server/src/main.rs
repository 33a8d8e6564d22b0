//! Virtual-server process (`spec.md` §6 CLI surface): exposes `VirtualStart`
//! / `VirtualRespond` (§4.6) over HTTP. Unlike `workflow-api` this process
//! never touches Postgres — every call builds a fresh in-memory namespace
//! from the caller-supplied blob (or an empty one), so there is no
//! `--mongo`/`--db-url` flag to wire up despite sharing the rest of the CLI
//! surface with `workflow-worker`.

mod blob_codec;
mod engine_setup;
mod routes;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "workflow-virtual-server")]
struct Cli {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = 8091)]
    port: u16,

    #[arg(short = 'v', long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(if cli.verbose {
            "workflow_virtual_server=trace"
        } else {
            "workflow_virtual_server=info"
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("workflow-virtual-server starting...");

    let app = routes::routes()
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.context("failed to bind to address")?;
    tracing::info!(%addr, "listening");

    let serve = tokio::spawn(async move {
        axum::serve(listener, app).with_graceful_shutdown(first_interrupt()).await
    });

    let exit_code = wait_for_shutdown(serve).await;
    std::process::exit(exit_code);
}

async fn first_interrupt() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received, draining in-flight requests...");
}

/// Graceful shutdown on the first interrupt, forced exit(1) on the second
/// (`spec.md` §6: "Exit codes: 0 on clean shutdown, 1 on forced
/// termination"), mirroring `workflow-worker`'s shutdown race.
async fn wait_for_shutdown(serve: tokio::task::JoinHandle<std::io::Result<()>>) -> i32 {
    tokio::select! {
        result = serve => {
            match result {
                Ok(Ok(())) => {
                    tracing::info!("shut down cleanly");
                    0
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "server error during shutdown");
                    1
                }
                Err(e) => {
                    tracing::warn!(error = %e, "server task panicked");
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
