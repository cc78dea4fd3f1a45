//! Router assembly.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::Extension;
use axum::routing::{any, get, post, put};
use axum::Router;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::ServerDeps;
use crate::server::routes::{
    create_job_handler, delete_server_handler, get_job_handler, get_server_handler,
    healthz_handler, list_jobs_handler, readyz_handler, serve_task_iso_handler,
    status_webhook_handler, upsert_server_handler,
};

/// Build the Axum application router.
pub fn build_app(deps: Arc<ServerDeps>) -> Router {
    Router::new()
        .route("/api/v1/jobs", post(create_job_handler).get(list_jobs_handler))
        .route("/api/v1/jobs/:id", get(get_job_handler))
        .route(
            "/api/v1/servers/:serial",
            put(upsert_server_handler)
                .get(get_server_handler)
                .delete(delete_server_handler),
        )
        .route("/api/v1/status-webhook/:serial", post(status_webhook_handler))
        // `any` so that non-GET/HEAD methods can be answered with 404 instead
        // of the router's default 405.
        .route("/media/tasks/:job_id/task.iso", any(serve_task_iso_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        // Middleware layers (applied in reverse order - last added runs first)
        .layer(Extension(deps))
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(TraceLayer::new_for_http())
}
