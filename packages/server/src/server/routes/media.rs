//! Signed task ISO delivery to BMCs.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Extension, Path, Query};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};

use chrono::Utc;
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::kernel::media::{MediaAuth, UrlSigner};
use crate::kernel::ServerDeps;
use crate::server::client_ip::ClientIp;

#[derive(Debug, Default, Deserialize)]
pub struct MediaQuery {
    pub expires: Option<String>,
    pub sig: Option<String>,
    pub ip: Option<String>,
}

/// `GET /media/tasks/{job_id}/task.iso`
///
/// Failures are deliberately uniform: expired, tampered, and missing
/// signatures all answer 403 so the endpoint is not an oracle. Non-GET/HEAD
/// methods 404 rather than advertising the route.
pub async fn serve_task_iso_handler(
    Extension(deps): Extension<Arc<ServerDeps>>,
    client_ip: Option<ClientIp>,
    Path(job_id): Path<Uuid>,
    Query(query): Query<MediaQuery>,
    method: Method,
) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return StatusCode::NOT_FOUND.into_response();
    }

    let auth = MediaAuth {
        expires: query.expires.as_deref(),
        sig: query.sig.as_deref(),
        ip: query.ip.as_deref(),
    };
    let client_ip = client_ip.map(|ClientIp(ip)| ip);

    if !deps
        .signer
        .verify(&UrlSigner::media_path(job_id), &auth, client_ip, Utc::now())
    {
        tracing::debug!(%job_id, "rejected media request");
        return StatusCode::FORBIDDEN.into_response();
    }

    let path = deps.iso.task_iso_path(job_id);
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    let len = file.metadata().await.ok().map(|m| m.len());

    let mut response = (
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        )],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response();
    if let Some(len) = len {
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }
    response
}
