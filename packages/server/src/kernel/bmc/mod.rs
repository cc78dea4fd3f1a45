//! BMC client contract.
//!
//! The pipeline drives hardware exclusively through [`BmcClient`]; the
//! concrete implementation is chosen per server by a [`BmcConnector`] using
//! the server's `vendor` hint. Unknown vendors get the standards-conformant
//! Redfish profile.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::kernel::store::ServerRecord;

pub mod testing;

/// Power state as the pipeline sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
    /// Powering on/off, paused, or anything vendor-specific.
    Transitioning,
}

/// Boot devices the pipeline overrides to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDevice {
    VirtualCd,
}

/// Operations the pipeline needs from a management controller.
///
/// Eject and boot-override must tolerate already-desired states; every call
/// carries the per-request timeout and bounded retry budget configured at
/// connect time.
#[async_trait]
pub trait BmcClient: Send + Sync {
    async fn insert_virtual_media(&self, image_url: &str) -> Result<()>;
    async fn eject_virtual_media(&self) -> Result<()>;
    async fn set_boot_override_once(&self, device: BootDevice) -> Result<()>;
    async fn power_on(&self) -> Result<()>;
    async fn power_off(&self) -> Result<()>;
    async fn power_state(&self) -> Result<PowerState>;
}

/// Per-vendor behavioral tweaks, selected from `Server.vendor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VendorQuirks {
    pub name: &'static str,
    /// Some firmwares refuse InsertMedia while stale media is attached.
    pub eject_before_insert: bool,
    /// Whether GracefulShutdown is honored; otherwise power off forcibly.
    pub graceful_shutdown: bool,
}

const STANDARD: VendorQuirks = VendorQuirks {
    name: "standard",
    eject_before_insert: false,
    graceful_shutdown: true,
};

const DELL: VendorQuirks = VendorQuirks {
    name: "dell",
    eject_before_insert: true,
    graceful_shutdown: true,
};

const SUPERMICRO: VendorQuirks = VendorQuirks {
    name: "supermicro",
    eject_before_insert: true,
    graceful_shutdown: false,
};

pub fn quirks_for_vendor(vendor: Option<&str>) -> VendorQuirks {
    match vendor.map(str::to_ascii_lowercase).as_deref() {
        Some("dell") | Some("idrac") => DELL,
        Some("supermicro") => SUPERMICRO,
        _ => STANDARD,
    }
}

/// Builds a client for a server's management controller.
#[async_trait]
pub trait BmcConnector: Send + Sync {
    async fn connect(&self, server: &ServerRecord) -> Result<Arc<dyn BmcClient>>;
}

/// Production connector backed by the `redfish` crate.
pub struct RedfishConnector {
    timeout: Duration,
    retries: u32,
}

impl RedfishConnector {
    pub fn new(timeout: Duration, retries: u32) -> Self {
        Self { timeout, retries }
    }
}

#[async_trait]
impl BmcConnector for RedfishConnector {
    async fn connect(&self, server: &ServerRecord) -> Result<Arc<dyn BmcClient>> {
        let quirks = quirks_for_vendor(server.vendor.as_deref());
        let mut options = redfish::RedfishOptions::new(
            server.bmc_address.clone(),
            server.bmc_username.clone(),
            server.bmc_password.clone(),
        );
        options.timeout = self.timeout;
        options.retries = self.retries;

        let client = redfish::RedfishClient::new(options)
            .with_context(|| format!("connecting to BMC of {}", server.serial))?;
        Ok(Arc::new(RedfishBmc { client, quirks }))
    }
}

/// [`BmcClient`] over a Redfish BMC.
pub struct RedfishBmc {
    client: redfish::RedfishClient,
    quirks: VendorQuirks,
}

#[async_trait]
impl BmcClient for RedfishBmc {
    async fn insert_virtual_media(&self, image_url: &str) -> Result<()> {
        if self.quirks.eject_before_insert {
            self.client.eject_virtual_media().await?;
        }
        self.client.insert_virtual_media(image_url).await?;
        Ok(())
    }

    async fn eject_virtual_media(&self) -> Result<()> {
        self.client.eject_virtual_media().await?;
        Ok(())
    }

    async fn set_boot_override_once(&self, device: BootDevice) -> Result<()> {
        let target = match device {
            BootDevice::VirtualCd => redfish::BootTarget::Cd,
        };
        self.client.set_boot_override_once(target).await?;
        Ok(())
    }

    async fn power_on(&self) -> Result<()> {
        self.client.reset(redfish::ResetType::On).await?;
        Ok(())
    }

    async fn power_off(&self) -> Result<()> {
        let reset = if self.quirks.graceful_shutdown {
            redfish::ResetType::GracefulShutdown
        } else {
            redfish::ResetType::ForceOff
        };
        self.client.reset(reset).await?;
        Ok(())
    }

    async fn power_state(&self) -> Result<PowerState> {
        let state = match self.client.power_state().await? {
            redfish::PowerState::On => PowerState::On,
            redfish::PowerState::Off => PowerState::Off,
            redfish::PowerState::Other(_) => PowerState::Transitioning,
        };
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_vendor_falls_back_to_standard() {
        assert_eq!(quirks_for_vendor(None).name, "standard");
        assert_eq!(quirks_for_vendor(Some("ACME")).name, "standard");
    }

    #[test]
    fn vendor_match_is_case_insensitive() {
        assert_eq!(quirks_for_vendor(Some("Dell")).name, "dell");
        assert_eq!(quirks_for_vendor(Some("iDRAC")).name, "dell");
        assert_eq!(quirks_for_vendor(Some("SuperMicro")).name, "supermicro");
    }

    #[test]
    fn dell_ejects_before_insert() {
        assert!(quirks_for_vendor(Some("dell")).eject_before_insert);
        assert!(!quirks_for_vendor(None).eject_before_insert);
    }
}
