//! Job submission and retrieval.

use std::sync::Arc;

use axum::extract::{Extension, Path, Query};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::{ApiError, ApiResult};
use crate::kernel::store::{Job, JobEvent, JobStatus, ServerRecord};
use crate::kernel::{validator, ServerDeps};

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub server_serial: String,
    pub recipe: serde_json::Value,
}

#[derive(Serialize)]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub server_serial: String,
    pub created_at: DateTime<Utc>,
}

/// `POST /api/v1/jobs`
pub async fn create_job_handler(
    Extension(deps): Extension<Arc<ServerDeps>>,
    Json(body): Json<CreateJobRequest>,
) -> ApiResult<(StatusCode, Json<CreateJobResponse>)> {
    let errors = validator::validate_value(&body.recipe);
    if !errors.is_empty() {
        return Err(ApiError::InvalidRecipe(errors));
    }

    let server = ServerRecord::find_by_serial(&body.server_serial, &deps.store)
        .await?
        .ok_or(ApiError::NotFound("server"))?;

    let job = Job::builder()
        .server_serial(server.serial)
        .recipe(body.recipe)
        .maintenance_iso_url(deps.config.maintenance_iso_url.clone())
        .build();
    job.insert(&deps.store).await?;
    JobEvent::append(
        job.id,
        crate::kernel::store::EventLevel::Info,
        None,
        "job accepted",
        &deps.store,
    )
    .await?;

    tracing::info!(job_id = %job.id, serial = %job.server_serial, "job queued");

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateJobResponse {
            job_id: job.id,
            status: job.status,
            server_serial: job.server_serial,
            created_at: job.created_at,
        }),
    ))
}

#[derive(Serialize)]
pub struct JobDetailResponse {
    pub job_id: Uuid,
    pub server_serial: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub events: Vec<JobEvent>,
}

/// `GET /api/v1/jobs/{id}`
pub async fn get_job_handler(
    Extension(deps): Extension<Arc<ServerDeps>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobDetailResponse>> {
    let job = Job::find_by_id(id, &deps.store)
        .await?
        .ok_or(ApiError::NotFound("job"))?;
    let events = JobEvent::list_for_job(id, &deps.store).await?;

    Ok(Json(JobDetailResponse {
        job_id: job.id,
        server_serial: job.server_serial,
        status: job.status,
        failed_step: job.failed_step,
        created_at: job.created_at,
        last_update: job.updated_at,
        events,
    }))
}

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 500;

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<JobStatus>,
    pub limit: Option<i64>,
}

#[derive(Serialize)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub server_serial: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<JobSummary>,
}

/// `GET /api/v1/jobs?status=&limit=`
pub async fn list_jobs_handler(
    Extension(deps): Extension<Arc<ServerDeps>>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<ListJobsResponse>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let jobs = Job::list(query.status, limit, &deps.store).await?;

    Ok(Json(ListJobsResponse {
        jobs: jobs
            .into_iter()
            .map(|job| JobSummary {
                job_id: job.id,
                server_serial: job.server_serial,
                status: job.status,
                failed_step: job.failed_step,
                created_at: job.created_at,
                last_update: job.updated_at,
            })
            .collect(),
    }))
}
