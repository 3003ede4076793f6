use axum::routing::{get, patch, post};
use axum::Router;
use perp_engine::EngineHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;

/// Control/reporting surface for the operator UI. Holds nothing but the
/// engine handle; no globals.
pub struct ApiServer {
    engine: EngineHandle,
}

impl ApiServer {
    #[must_use]
    pub const fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }

    /// Builds the `/bot` router.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/bot/status", get(handlers::status))
            .route("/bot/start", post(handlers::start))
            .route("/bot/stop", post(handlers::stop))
            .route("/bot/config", patch(handlers::patch_config))
            .route("/bot/close", post(handlers::close))
            .route("/bot/history", get(handlers::history))
            .with_state(self.engine.clone())
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Binds and serves until the process exits.
    ///
    /// # Errors
    /// Returns an error if the address cannot be bound.
    pub async fn serve(self, addr: &str) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("operator API listening on {addr}");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}
