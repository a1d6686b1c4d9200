use std::net::SocketAddr;

use axum::{
    routing::{get, post},
    Router,
};
use color_eyre::eyre::Result;
use tower_http::trace::{self, TraceLayer};
use tracing::Level;

use super::api::{self, AppState};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/write", post(api::write))
        .route("/api/v1/series/:id", get(api::series))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
        )
}

/// Serves until Ctrl-C, then drains the copier pool.
pub async fn server(addr: SocketAddr, state: AppState) -> Result<()> {
    let ingestor = state.ingestor.clone();
    let app = router(state);

    tracing::info!("start http server: {:?}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(%error, "failed to listen for shutdown signal");
            }
        })
        .await?;

    tracing::info!("shutting down");
    ingestor.shutdown().await;
    Ok(())
}
