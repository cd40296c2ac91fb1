use axum::Extension;
use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use chrono::Utc;

use crate::server::dtos::health_dto::{HealthResponse, HealthStatus};
use crate::server::services::edge_services::EdgeServices;
use crate::server::{get_app_version, get_uptime_seconds};

/// health endpoint - there's nothing to probe beyond the process itself, the
/// upstream embed origins aren't dependencies we can meaningfully ping
pub async fn health_endpoint(
    Extension(services): Extension<EdgeServices>,
) -> impl IntoResponse {
    let response = HealthResponse {
        status: HealthStatus::Healthy,
        timestamp: Utc::now(),
        uptime_seconds: get_uptime_seconds(),
        version: get_app_version().to_string(),
        environment: format!("{:?}", services.config.cargo_env).to_lowercase(),
    };

    (
        StatusCode::OK,
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(response),
    )
}
