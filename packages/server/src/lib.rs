//! Bare-metal provisioning controller.
//!
//! Drives Redfish-style BMCs to install operating systems onto servers:
//! operators submit a job (server serial + recipe), the controller persists
//! it, builds a bootable task ISO, walks the BMC through a virtual-media boot
//! sequence, and reconciles with the in-guest dispatcher's status webhook.

pub mod common;
pub mod config;
pub mod kernel;
pub mod server;

pub use config::Config;
