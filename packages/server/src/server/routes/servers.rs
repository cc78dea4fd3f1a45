//! Out-of-band server inventory administration.

use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::common::{ApiError, ApiResult};
use crate::kernel::store::{DeleteServerOutcome, ServerRecord};
use crate::kernel::ServerDeps;

#[derive(Debug, Deserialize)]
pub struct UpsertServerRequest {
    pub bmc_address: String,
    pub bmc_username: String,
    pub bmc_password: String,
    pub vendor: Option<String>,
}

/// `PUT /api/v1/servers/{serial}`
pub async fn upsert_server_handler(
    Extension(deps): Extension<Arc<ServerDeps>>,
    Path(serial): Path<String>,
    Json(body): Json<UpsertServerRequest>,
) -> ApiResult<Json<ServerRecord>> {
    if serial.trim().is_empty() {
        return Err(ApiError::BadRequest("serial must not be empty".to_string()));
    }
    if body.bmc_address.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "bmc_address must not be empty".to_string(),
        ));
    }

    let record = ServerRecord::builder()
        .serial(serial)
        .bmc_address(body.bmc_address)
        .bmc_username(body.bmc_username)
        .bmc_password(body.bmc_password)
        .vendor(body.vendor)
        .build();
    record.upsert(&deps.store).await?;

    tracing::info!(serial = %record.serial, "server upserted");
    Ok(Json(record))
}

/// `GET /api/v1/servers/{serial}` — the BMC password is never returned.
pub async fn get_server_handler(
    Extension(deps): Extension<Arc<ServerDeps>>,
    Path(serial): Path<String>,
) -> ApiResult<Json<ServerRecord>> {
    let record = ServerRecord::find_by_serial(&serial, &deps.store)
        .await?
        .ok_or(ApiError::NotFound("server"))?;
    Ok(Json(record))
}

/// `DELETE /api/v1/servers/{serial}` — refused while jobs reference it.
pub async fn delete_server_handler(
    Extension(deps): Extension<Arc<ServerDeps>>,
    Path(serial): Path<String>,
) -> ApiResult<StatusCode> {
    match ServerRecord::delete(&serial, &deps.store).await? {
        DeleteServerOutcome::Deleted => Ok(StatusCode::NO_CONTENT),
        DeleteServerOutcome::NotFound => Err(ApiError::NotFound("server")),
        DeleteServerOutcome::ReferencedByJobs => Err(ApiError::Conflict(
            "server is referenced by existing jobs".to_string(),
        )),
    }
}
