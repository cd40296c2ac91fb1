pub mod api;
pub mod dtos;
pub mod error;
pub mod services;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::{Extension, Router, routing::get};
use once_cell::sync::Lazy;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::AppConfig;

use api::health_controller;
use api::proxy_controller::ProxyController;
use services::edge_services::EdgeServices;

static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

pub fn get_uptime_seconds() -> u64 {
    START_TIME.elapsed().as_secs()
}

pub fn get_app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub struct EdgeApplicationServer;

impl EdgeApplicationServer {
    pub async fn serve(config: Arc<AppConfig>) -> anyhow::Result<()> {
        // pin the start time before the first request asks for uptime
        Lazy::force(&START_TIME);

        let services = EdgeServices::new(config.clone());
        let app = Self::app(services);

        let address = format!("0.0.0.0:{}", config.port);
        info!("routes initialized, listening on {}", address);

        let listener = tokio::net::TcpListener::bind(&address)
            .await
            .context("failed to bind server address")?;

        axum::serve(listener, app)
            .await
            .context("error while serving api")?;

        Ok(())
    }

    /// the full router, also what the integration tests drive directly
    pub fn app(services: EdgeServices) -> Router {
        ProxyController::app()
            .route(
                "/health",
                get(health_controller::health_endpoint)
                    .options(ProxyController::preflight_endpoint),
            )
            .layer(Extension(services))
            .layer(TraceLayer::new_for_http())
    }
}
