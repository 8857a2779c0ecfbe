mod routes;

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::orchestrator::Ruler;

pub struct Server {
    ruler: Arc<Ruler>,
}

impl Server {
    pub fn new(ruler: Arc<Ruler>) -> Self {
        Self { ruler }
    }

    pub fn build_router(self) -> Router {
        let state = Arc::new(self);

        Router::new()
            .route("/health", get(routes::health))
            .route("/metrics", get(routes::metrics))
            .route("/api/v1/rules", get(routes::list_rules))
            .route("/ruler/local/rules", get(routes::list_local_rules))
            .route("/ruler/ring", get(routes::ring))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve until interrupted, then run the orderly shutdown sequence:
    /// schedulers drain, notifier queues flush, the ring entry is removed.
    pub async fn start(self, addr: &str) -> crate::Result<()> {
        let ruler = self.ruler.clone();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown signal received");
            })
            .await
            .map_err(crate::Error::Io)?;
        ruler.stop().await;
        Ok(())
    }

    pub(crate) fn ruler(&self) -> &Arc<Ruler> {
        &self.ruler
    }
}
