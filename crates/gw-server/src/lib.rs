#![recursion_limit = "256"]

pub mod audit;
pub mod config;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod stream;

use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Builds the full route table: every request-bearing endpoint sits behind
/// `admission_gate`; `/health` and `/ready` are exempted inside the
/// middleware itself so probes never need a key.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(routes::chat_completions))
        .route("/v1/process", post(routes::process))
        .route("/v1/task", post(routes::task))
        .route("/v1/batch", post(routes::batch))
        .route("/v1/usage", get(routes::usage))
        .route("/v1/capabilities", get(routes::capabilities))
        .route("/v1/stream", get(stream::stream))
        .route("/health", get(routes::health))
        .route("/ready", get(routes::ready))
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::admission_gate))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Runs the gateway until ctrl-c, then drains in-flight work before
/// returning. Readiness flips true only after the listener is bound, so a
/// load balancer never routes traffic to a socket that isn't accepting yet.
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    state.mark_ready();
    tracing::info!(%addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    tracing::info!("shutdown signal received, draining worker pool");
    state.pool.drain(state.config.drain_deadline).await;
    state.audit.flush(std::time::Duration::from_secs(5)).await;
    tracing::info!("drain complete, exiting");
    Ok(())
}

/// Waits for ctrl-c, then immediately flips `draining` and fires
/// `shutdown` — before returning to let axum's graceful-shutdown wait
/// begin. `mark_draining` is what wakes every idle `/v1/stream` session, so
/// it has to happen here: axum's own graceful-shutdown future doesn't
/// resolve until every open connection closes on its own, and an idle
/// socket never would without this signal reaching it first.
async fn shutdown_signal(state: AppState) {
    if tokio::signal::ctrl_c().await.is_err() {
        futures::future::pending::<()>().await;
    }
    state.mark_draining();
}
