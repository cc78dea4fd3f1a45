//! Scriptable in-memory BMC for pipeline and API tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::{BmcClient, BmcConnector, BootDevice, PowerState};
use crate::kernel::store::ServerRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BmcOp {
    Insert(String),
    Eject,
    SetBootOnce,
    PowerOn,
    PowerOff,
}

#[derive(Default)]
struct MockState {
    ops: Vec<BmcOp>,
    power: Option<PowerState>,
    /// Remaining forced failures per operation name.
    failures: HashMap<&'static str, u32>,
}

/// A BMC that records every operation and can be told to fail.
#[derive(Default)]
pub struct MockBmc {
    state: Mutex<MockState>,
}

impl MockBmc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn recorded(&self) -> Vec<BmcOp> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn set_power(&self, power: PowerState) {
        self.state.lock().unwrap().power = Some(power);
    }

    /// Make the next `times` calls of `op` fail. Op names: `insert`, `eject`,
    /// `set_boot`, `power_on`, `power_off`, `power_state`.
    pub fn fail_next(&self, op: &'static str, times: u32) {
        self.state.lock().unwrap().failures.insert(op, times);
    }

    fn trip(&self, op: &'static str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(remaining) = state.failures.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(anyhow!("mock BMC failure: {op}"));
            }
        }
        Ok(())
    }

    fn record(&self, op: BmcOp) {
        self.state.lock().unwrap().ops.push(op);
    }
}

#[async_trait]
impl BmcClient for MockBmc {
    async fn insert_virtual_media(&self, image_url: &str) -> Result<()> {
        self.trip("insert")?;
        self.record(BmcOp::Insert(image_url.to_string()));
        Ok(())
    }

    async fn eject_virtual_media(&self) -> Result<()> {
        self.trip("eject")?;
        self.record(BmcOp::Eject);
        Ok(())
    }

    async fn set_boot_override_once(&self, _device: BootDevice) -> Result<()> {
        self.trip("set_boot")?;
        self.record(BmcOp::SetBootOnce);
        Ok(())
    }

    async fn power_on(&self) -> Result<()> {
        self.trip("power_on")?;
        self.record(BmcOp::PowerOn);
        self.state.lock().unwrap().power = Some(PowerState::On);
        Ok(())
    }

    async fn power_off(&self) -> Result<()> {
        self.trip("power_off")?;
        self.record(BmcOp::PowerOff);
        self.state.lock().unwrap().power = Some(PowerState::Off);
        Ok(())
    }

    async fn power_state(&self) -> Result<PowerState> {
        self.trip("power_state")?;
        let power = self.state.lock().unwrap().power.unwrap_or(PowerState::Off);
        Ok(power)
    }
}

/// Connector that hands out one shared [`MockBmc`] for every server.
pub struct MockConnector {
    bmc: Arc<MockBmc>,
    connected_serials: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn new(bmc: Arc<MockBmc>) -> Arc<Self> {
        Arc::new(Self {
            bmc,
            connected_serials: Mutex::new(Vec::new()),
        })
    }

    pub fn connected_serials(&self) -> Vec<String> {
        self.connected_serials.lock().unwrap().clone()
    }
}

#[async_trait]
impl BmcConnector for MockConnector {
    async fn connect(&self, server: &ServerRecord) -> Result<Arc<dyn BmcClient>> {
        self.connected_serials
            .lock()
            .unwrap()
            .push(server.serial.clone());
        Ok(self.bmc.clone())
    }
}
