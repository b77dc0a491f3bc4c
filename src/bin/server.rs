//! nta-eval HTTP server binary.
//!
//! Opens the job store, starts the evaluation workers and serves the
//! dispatch and long-poll endpoints.
//!
//! # Environment Variables
//!
//! - `SERVICE_PORT` — HTTP port (default: 8000)
//! - `DATABASE_URL` — SQLite path or `:memory:` (default: `:memory:`)
//! - `OPENAI_API_KEY` — enables real evaluations; without it a simulated client is used
//! - `RUST_LOG` — Tracing filter (default: "info,nta_eval=debug")
//!
//! See [`nta_eval::Config`] for the long-polling settings.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin server
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use nta_eval::evaluator::{CompletionClient, EvaluationService, OpenAiClient, SimulatedClient};
use nta_eval::server::{app_router, AppState};
use nta_eval::{Config, SqliteJobStore, WorkerPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,nta_eval=debug".into()),
        )
        .init();

    let config = Config::from_env();
    let bind_addr = format!("0.0.0.0:{}", config.service_port);

    let store = Arc::new(
        SqliteJobStore::open_with_echo(&config.database_url, config.db_echo)
            .with_context(|| format!("failed to open database {}", config.database_url))?,
    );

    let client: Arc<dyn CompletionClient> = match OpenAiClient::from_config(&config) {
        Ok(client) => {
            tracing::info!("Using OpenAI model {}", client.model());
            Arc::new(client)
        }
        Err(e) => {
            tracing::warn!("{}; falling back to simulated evaluations", e);
            Arc::new(SimulatedClient)
        }
    };
    let evaluator = EvaluationService::new(client, config.evaluation_samples);
    let workers = Arc::new(WorkerPool::spawn(
        store.clone(),
        evaluator,
        config.worker_concurrency,
    ));

    tracing::info!(
        "Long polling: default timeout {}s, interval {}s, {} per client, {} global",
        config.long_polling_default_timeout,
        config.long_polling_poll_interval,
        config.long_polling_max_client_connections,
        config.long_polling_global_max_connections
    );

    let state = AppState::new(config, store, workers.clone());
    let app = app_router(state);

    tracing::info!("nta-eval server starting on {}", bind_addr);
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health");
    tracing::info!("  POST /api/tasks/dispatch/:job_id");
    tracing::info!("  POST /api/long-poll/:evaluation_id?timeout=N");

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server failed")?;

    tracing::info!("HTTP server stopped; waiting for in-flight evaluations");
    workers.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
