//! Effective client IP for signed-media verification.
//!
//! Only the media endpoint cares about the caller's address, and only to
//! check IP-bound task ISO URLs, so this is an extractor rather than a
//! router-wide middleware. When `trust_proxy_headers` is on, exactly one
//! `X-Forwarded-For` hop is honored; otherwise (BMCs fetching directly, no
//! proxy to vouch for the header) the socket address is authoritative.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::async_trait;
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};

use crate::kernel::ServerDeps;

#[derive(Clone, Copy, Debug)]
pub struct ClientIp(pub IpAddr);

#[async_trait]
impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    // Swallowed at the call site: verification treats "address unknown" the
    // same as any other mismatch.
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let trust_proxy = parts
            .extensions
            .get::<Arc<ServerDeps>>()
            .map(|deps| deps.config.trust_proxy_headers)
            .unwrap_or(false);

        if trust_proxy {
            if let Some(ip) = forwarded_ip(&parts.headers) {
                return Ok(ClientIp(ip));
            }
        }

        parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| ClientIp(info.0.ip()))
            .ok_or(StatusCode::BAD_REQUEST)
    }
}

/// First hop of `X-Forwarded-For`. The controller sits behind at most one
/// proxy; anything a client appended beyond that is ignored.
fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}
