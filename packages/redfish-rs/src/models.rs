//! Serde models for the subset of the Redfish data model the client touches.
//!
//! Only the properties the provisioning flow reads are mapped; everything else
//! in a BMC response is ignored on deserialization.

use serde::Deserialize;

/// A bare `@odata.id` reference to another resource.
#[derive(Debug, Clone, Deserialize)]
pub struct ODataRef {
    #[serde(rename = "@odata.id")]
    pub odata_id: String,
}

/// A Redfish resource collection (`Systems`, `Managers`, `VirtualMedia`, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct Collection {
    #[serde(rename = "Members", default)]
    pub members: Vec<ODataRef>,
    #[serde(rename = "Members@odata.count", default)]
    pub count: Option<u64>,
}

/// `ComputerSystem` resource, power and boot properties only.
#[derive(Debug, Clone, Deserialize)]
pub struct ComputerSystem {
    #[serde(rename = "Id", default)]
    pub id: Option<String>,
    #[serde(rename = "PowerState", default)]
    pub power_state: Option<String>,
    #[serde(rename = "Boot", default)]
    pub boot: Option<Boot>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Boot {
    #[serde(rename = "BootSourceOverrideEnabled", default)]
    pub override_enabled: Option<String>,
    #[serde(rename = "BootSourceOverrideTarget", default)]
    pub override_target: Option<String>,
}

/// `Manager` resource; only the link to its virtual-media collection matters.
#[derive(Debug, Clone, Deserialize)]
pub struct Manager {
    #[serde(rename = "Id", default)]
    pub id: Option<String>,
    #[serde(rename = "VirtualMedia", default)]
    pub virtual_media: Option<ODataRef>,
}

/// A single `VirtualMedia` slot.
#[derive(Debug, Clone, Deserialize)]
pub struct VirtualMedia {
    #[serde(rename = "Id", default)]
    pub id: Option<String>,
    #[serde(rename = "MediaTypes", default)]
    pub media_types: Vec<String>,
    #[serde(rename = "Inserted", default)]
    pub inserted: Option<bool>,
    #[serde(rename = "Image", default)]
    pub image: Option<String>,
}

impl VirtualMedia {
    /// Whether this slot can mount an optical image.
    pub fn accepts_cd(&self) -> bool {
        self.media_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case("CD") || t.eq_ignore_ascii_case("DVD"))
    }
}
