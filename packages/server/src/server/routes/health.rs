use std::sync::Arc;
use std::time::Duration;

use axum::{extract::Extension, http::StatusCode, Json};
use serde::Serialize;

use crate::kernel::ServerDeps;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    database: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Liveness: the process is up and the database answers.
pub async fn healthz_handler(
    Extension(deps): Extension<Arc<ServerDeps>>,
) -> (StatusCode, Json<HealthResponse>) {
    let db = tokio::time::timeout(Duration::from_secs(5), deps.store.ping()).await;

    let (database, error) = match db {
        Ok(Ok(())) => ("ok".to_string(), None),
        Ok(Err(e)) => ("error".to_string(), Some(e.to_string())),
        Err(_) => ("error".to_string(), Some("query timeout (>5s)".to_string())),
    };

    let healthy = database == "ok";
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
            database,
            error,
        }),
    )
}

/// Readiness: migrations ran at open time, so readiness equals liveness.
pub async fn readyz_handler(
    Extension(deps): Extension<Arc<ServerDeps>>,
) -> (StatusCode, Json<HealthResponse>) {
    healthz_handler(Extension(deps)).await
}
