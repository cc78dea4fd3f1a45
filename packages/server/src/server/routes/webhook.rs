//! Status webhook called by the in-guest dispatcher.
//!
//! Authenticated (when configured) by a shared-secret header with a rotation
//! grace for the previous secret, deduplicated per job by delivery id, and
//! idempotent at the store level regardless: the terminal transition is
//! guarded on `status = provisioning`.

use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::common::{ApiError, ApiResult};
use crate::kernel::store::{EventLevel, Job, JobEvent, TerminalOutcome};
use crate::kernel::ServerDeps;

pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";

#[derive(Debug, Deserialize)]
pub struct WebhookRequest {
    pub status: String,
    pub failed_step: Option<String>,
    pub delivery_id: Option<String>,
}

#[derive(Serialize)]
pub struct WebhookResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotent: Option<bool>,
}

impl WebhookResponse {
    fn fresh() -> Self {
        Self {
            ok: true,
            idempotent: None,
        }
    }

    fn duplicate() -> Self {
        Self {
            ok: true,
            idempotent: Some(true),
        }
    }
}

/// `POST /api/v1/status-webhook/{serial}`
pub async fn status_webhook_handler(
    Extension(deps): Extension<Arc<ServerDeps>>,
    Path(serial): Path<String>,
    headers: HeaderMap,
    Json(body): Json<WebhookRequest>,
) -> ApiResult<Json<WebhookResponse>> {
    authenticate(&deps, &headers)?;

    let outcome = match body.status.trim().to_ascii_lowercase().as_str() {
        "success" => TerminalOutcome::Succeeded,
        "failed" => TerminalOutcome::Failed,
        other => {
            return Err(ApiError::BadRequest(format!(
                "status must be success or failed, got {other:?}"
            )))
        }
    };

    let job = Job::active_provisioning_for_serial(&serial, &deps.store)
        .await?
        .ok_or(ApiError::NotFound("active provisioning job"))?;

    let delivery_id = body.delivery_id.as_deref().unwrap_or("");
    if !delivery_id.is_empty() && deps.deliveries.check_and_record(job.id, delivery_id) {
        JobEvent::append(
            job.id,
            EventLevel::Info,
            Some("webhook-duplicate"),
            &format!("duplicate delivery {delivery_id} ignored"),
            &deps.store,
        )
        .await?;
        tracing::debug!(job_id = %job.id, delivery_id, "duplicate webhook delivery");
        return Ok(Json(WebhookResponse::duplicate()));
    }

    match outcome {
        TerminalOutcome::Succeeded => {
            let marked = Job::mark_status(job.id, outcome, None, &deps.store).await?;
            if !marked {
                // Finished between the lookup and the update; nothing to redo.
                return Ok(Json(WebhookResponse::duplicate()));
            }
            JobEvent::append(
                job.id,
                EventLevel::Info,
                Some("webhook-success"),
                "dispatcher reported success",
                &deps.store,
            )
            .await?;
            tracing::info!(job_id = %job.id, %serial, "dispatcher reported success");
        }
        TerminalOutcome::Failed => {
            let failed_step = body
                .failed_step
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or("unknown");
            let marked = Job::mark_status(job.id, outcome, Some(failed_step), &deps.store).await?;
            if !marked {
                return Ok(Json(WebhookResponse::duplicate()));
            }
            JobEvent::append(
                job.id,
                EventLevel::Error,
                Some("webhook-failed"),
                &format!("dispatcher reported failure at {failed_step}"),
                &deps.store,
            )
            .await?;
            tracing::warn!(job_id = %job.id, %serial, failed_step, "dispatcher reported failure");
        }
    }

    Ok(Json(WebhookResponse::fresh()))
}

fn authenticate(deps: &ServerDeps, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = deps.config.webhook_secret.as_deref() else {
        return Ok(());
    };

    let provided = headers
        .get(WEBHOOK_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;

    if secrets_match(provided, expected) {
        return Ok(());
    }
    // Rotation grace: the previous secret is still accepted.
    if let Some(previous) = deps.config.webhook_secret_previous.as_deref() {
        if secrets_match(provided, previous) {
            tracing::debug!("webhook authenticated with previous secret");
            return Ok(());
        }
    }

    Err(ApiError::Unauthorized)
}

/// Compare via digests so the comparison cost does not depend on where the
/// strings diverge.
fn secrets_match(provided: &str, expected: &str) -> bool {
    Sha256::digest(provided.as_bytes()) == Sha256::digest(expected.as_bytes())
}
