//! Minimal Redfish client for driving server BMCs.
//!
//! Covers the slice of the Redfish protocol a provisioning controller needs:
//! power state and reset, one-shot boot-source override, and virtual-media
//! insert/eject. Resource paths (`ComputerSystem`, CD-capable `VirtualMedia`
//! slot) are discovered once per client and cached.
//!
//! Every request carries a hard timeout; transient failures (connect errors,
//! timeouts, 5xx responses) are retried with exponential backoff up to a
//! bounded attempt count. BMCs almost universally present self-signed TLS
//! certificates, so certificate verification is an explicit option.

use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::OnceCell;
use url::Url;

pub mod models;

use models::{Collection, ComputerSystem, Manager, VirtualMedia};

const SYSTEMS_COLLECTION: &str = "/redfish/v1/Systems";
const MANAGERS_COLLECTION: &str = "/redfish/v1/Managers";

#[derive(Debug, Error)]
pub enum RedfishError {
    #[error("invalid BMC address {address}: {source}")]
    Address {
        address: String,
        source: url::ParseError,
    },

    #[error("failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),

    #[error("request to {path} failed: {source}")]
    Transport {
        path: String,
        source: reqwest::Error,
    },

    #[error("{path} returned {status}: {body}")]
    Status {
        path: String,
        status: StatusCode,
        body: String,
    },

    #[error("BMC exposes no {0} resource")]
    MissingResource(&'static str),

    #[error("unexpected payload from {path}: {reason}")]
    Payload { path: String, reason: String },
}

/// Observed chassis power state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
    /// Transitional or vendor-specific states (`PoweringOn`, `Paused`, ...).
    Other(String),
}

impl PowerState {
    fn parse(raw: &str) -> Self {
        match raw {
            "On" => PowerState::On,
            "Off" => PowerState::Off,
            other => PowerState::Other(other.to_string()),
        }
    }

    pub fn is_on(&self) -> bool {
        matches!(self, PowerState::On)
    }
}

/// `ComputerSystem.Reset` action types used by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetType {
    On,
    ForceOff,
    GracefulShutdown,
    ForceRestart,
}

impl ResetType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResetType::On => "On",
            ResetType::ForceOff => "ForceOff",
            ResetType::GracefulShutdown => "GracefulShutdown",
            ResetType::ForceRestart => "ForceRestart",
        }
    }
}

/// One-shot boot-source override targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootTarget {
    Cd,
    Pxe,
    Hdd,
}

impl BootTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            BootTarget::Cd => "Cd",
            BootTarget::Pxe => "Pxe",
            BootTarget::Hdd => "Hdd",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedfishOptions {
    /// Base URL of the BMC, e.g. `https://10.0.0.9`.
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Additional attempts after the first on transient failure.
    pub retries: u32,
    pub accept_invalid_certs: bool,
}

impl RedfishOptions {
    pub fn new(base_url: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            username: username.into(),
            password: password.into(),
            timeout: Duration::from_secs(30),
            retries: 3,
            accept_invalid_certs: true,
        }
    }
}

pub struct RedfishClient {
    http: Client,
    base: Url,
    options: RedfishOptions,
    system_path: OnceCell<String>,
    media_path: OnceCell<String>,
}

impl RedfishClient {
    pub fn new(options: RedfishOptions) -> Result<Self, RedfishError> {
        let base = Url::parse(&options.base_url).map_err(|source| RedfishError::Address {
            address: options.base_url.clone(),
            source,
        })?;
        let http = Client::builder()
            .timeout(options.timeout)
            .danger_accept_invalid_certs(options.accept_invalid_certs)
            .build()?;
        Ok(Self {
            http,
            base,
            options,
            system_path: OnceCell::new(),
            media_path: OnceCell::new(),
        })
    }

    /// Current chassis power state.
    pub async fn power_state(&self) -> Result<PowerState, RedfishError> {
        let path = self.system_path().await?.to_string();
        let system: ComputerSystem = self.get_json(&path).await?;
        let raw = system.power_state.ok_or_else(|| RedfishError::Payload {
            path: path.clone(),
            reason: "ComputerSystem has no PowerState".to_string(),
        })?;
        Ok(PowerState::parse(&raw))
    }

    /// Issue a `ComputerSystem.Reset` action.
    pub async fn reset(&self, reset_type: ResetType) -> Result<(), RedfishError> {
        let system = self.system_path().await?.to_string();
        let path = format!("{}/Actions/ComputerSystem.Reset", system.trim_end_matches('/'));
        let body = serde_json::json!({ "ResetType": reset_type.as_str() });
        let resp = self.send(Method::POST, &path, Some(&body)).await?;
        Self::ensure_success(&path, resp).await?;
        Ok(())
    }

    /// Set a next-boot-only override. Safe to repeat: the PATCH is absolute.
    pub async fn set_boot_override_once(&self, target: BootTarget) -> Result<(), RedfishError> {
        let path = self.system_path().await?.to_string();
        let body = serde_json::json!({
            "Boot": {
                "BootSourceOverrideEnabled": "Once",
                "BootSourceOverrideTarget": target.as_str(),
            }
        });
        let resp = self.send(Method::PATCH, &path, Some(&body)).await?;
        Self::ensure_success(&path, resp).await?;
        Ok(())
    }

    /// Attach an ISO URL to the CD-capable virtual-media slot.
    pub async fn insert_virtual_media(&self, image_url: &str) -> Result<(), RedfishError> {
        let slot = self.media_path().await?.to_string();
        let path = format!("{}/Actions/VirtualMedia.InsertMedia", slot.trim_end_matches('/'));
        let body = serde_json::json!({
            "Image": image_url,
            "Inserted": true,
            "WriteProtected": true,
        });
        let resp = self.send(Method::POST, &path, Some(&body)).await?;
        Self::ensure_success(&path, resp).await?;
        Ok(())
    }

    /// Detach whatever is in the CD-capable slot.
    ///
    /// Ejecting an empty drive answers 400 or 409 depending on the vendor;
    /// both count as the desired state.
    pub async fn eject_virtual_media(&self) -> Result<(), RedfishError> {
        let slot = self.media_path().await?.to_string();
        let path = format!("{}/Actions/VirtualMedia.EjectMedia", slot.trim_end_matches('/'));
        let body = serde_json::json!({});
        let resp = self.send(Method::POST, &path, Some(&body)).await?;
        let status = resp.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::CONFLICT {
            tracing::debug!(%path, %status, "eject on empty drive, treating as ejected");
            return Ok(());
        }
        Self::ensure_success(&path, resp).await?;
        Ok(())
    }

    /// State of the CD-capable virtual-media slot.
    pub async fn virtual_media(&self) -> Result<VirtualMedia, RedfishError> {
        let slot = self.media_path().await?.to_string();
        self.get_json(&slot).await
    }

    async fn system_path(&self) -> Result<&str, RedfishError> {
        self.system_path
            .get_or_try_init(|| async {
                let col: Collection = self.get_json(SYSTEMS_COLLECTION).await?;
                col.members
                    .first()
                    .map(|m| m.odata_id.clone())
                    .ok_or(RedfishError::MissingResource("ComputerSystem"))
            })
            .await
            .map(String::as_str)
    }

    async fn media_path(&self) -> Result<&str, RedfishError> {
        self.media_path
            .get_or_try_init(|| async {
                let managers: Collection = self.get_json(MANAGERS_COLLECTION).await?;
                let manager_ref = managers
                    .members
                    .first()
                    .ok_or(RedfishError::MissingResource("Manager"))?;
                let manager: Manager = self.get_json(&manager_ref.odata_id).await?;
                let media_ref = manager
                    .virtual_media
                    .ok_or(RedfishError::MissingResource("VirtualMedia"))?;
                let slots: Collection = self.get_json(&media_ref.odata_id).await?;

                // Prefer a slot advertising CD/DVD; fall back to the first one.
                for member in &slots.members {
                    let slot: VirtualMedia = self.get_json(&member.odata_id).await?;
                    if slot.accepts_cd() {
                        return Ok(member.odata_id.clone());
                    }
                }
                slots
                    .members
                    .first()
                    .map(|m| m.odata_id.clone())
                    .ok_or(RedfishError::MissingResource("VirtualMedia"))
            })
            .await
            .map(String::as_str)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RedfishError> {
        let resp = self.send(Method::GET, path, None).await?;
        let resp = Self::ensure_success(path, resp).await?;
        resp.json::<T>().await.map_err(|e| RedfishError::Payload {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response, RedfishError> {
        let url = self.base.join(path).map_err(|source| RedfishError::Address {
            address: format!("{}{}", self.base, path),
            source,
        })?;

        let mut attempt: u32 = 0;
        loop {
            let mut req = self
                .http
                .request(method.clone(), url.clone())
                .basic_auth(&self.options.username, Some(&self.options.password));
            if let Some(body) = body {
                req = req.json(body);
            }

            match req.send().await {
                Ok(resp) if resp.status().is_server_error() && attempt < self.options.retries => {
                    tracing::warn!(%path, status = %resp.status(), attempt, "transient BMC error, retrying");
                }
                Ok(resp) => return Ok(resp),
                Err(e) if (e.is_connect() || e.is_timeout()) && attempt < self.options.retries => {
                    tracing::warn!(%path, error = %e, attempt, "BMC unreachable, retrying");
                }
                Err(source) => {
                    return Err(RedfishError::Transport {
                        path: path.to_string(),
                        source,
                    })
                }
            }

            attempt += 1;
            tokio::time::sleep(backoff(attempt)).await;
        }
    }

    async fn ensure_success(
        path: &str,
        resp: reqwest::Response,
    ) -> Result<reqwest::Response, RedfishError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(RedfishError::Status {
            path: path.to_string(),
            status,
            body,
        })
    }
}

fn backoff(attempt: u32) -> Duration {
    let millis = 250u64.saturating_mul(1u64 << attempt.min(6));
    Duration::from_millis(millis.min(8_000))
}
