//! Server bootstrap: binds the listener, drives the periodic review sweep,
//! and shuts down cleanly on ctrl-c.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use crate::api::routes::{AppState, build_router};
use crate::model::RunStatus;
use crate::review::TickReport;

pub async fn run_server(
    state: AppState,
    addr: SocketAddr,
    tick_interval: Duration,
) -> anyhow::Result<()> {
    let scheduler = state.scheduler.clone();
    let engine = state.engine.clone();
    let store = state.store.clone();
    let sweep = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match scheduler.tick().await {
                Ok(report) => {
                    if report != TickReport::default() {
                        info!(?report, "review sweep acted");
                    }
                }
                Err(e) => warn!("review sweep failed: {}", e),
            }

            // Resume runs reset by a revision whose decision response was
            // lost (e.g. a crash before the caller could re-enter the
            // engine).
            let stalled = store
                .call(|s| s.runs_with_status(RunStatus::RevisionRequested))
                .await;
            match stalled {
                Ok(ids) => {
                    for id in ids {
                        if let Err(e) = engine.advance(id).await {
                            warn!(run_id = %id, "failed to resume revised run: {}", e);
                        }
                    }
                }
                Err(e) => warn!("failed to list revised runs: {}", e),
            }
        }
    });

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    sweep.abort();
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to install ctrl-c handler: {}", e);
        return;
    }
    info!("shutdown signal received");
}
