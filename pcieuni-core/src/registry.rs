// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Attached-device registry.
//!
//! Devices are owned here, keyed by their identity, and handed out as
//! `Arc` references; engine operations always go through such a
//! reference instead of any process-wide table.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::info;
use parking_lot::RwLock;

use crate::device::{BoardDevice, DeviceConfig, DeviceId};
use crate::error::{Error, Result};
use crate::hw::BoardIo;

pub struct DeviceRegistry {
    devices: RwLock<BTreeMap<DeviceId, Arc<BoardDevice>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(BTreeMap::new()),
        }
    }

    /// Attach a probed board: allocate its DMA resources, wire its
    /// interrupt and register it under `id`.
    pub fn attach(
        &self,
        id: DeviceId,
        hw: Arc<dyn BoardIo>,
        config: DeviceConfig,
    ) -> Result<Arc<BoardDevice>> {
        let mut devices = self.devices.write();
        if devices.contains_key(&id) {
            return Err(Error::AlreadyAttached(id.0));
        }

        let device = Arc::new(BoardDevice::new(id, Arc::clone(&hw), config)?);
        // Weak so a detached device does not linger through the board's
        // interrupt wiring.
        let handler_arc: Arc<dyn crate::hw::IrqHandler> = Arc::clone(&device) as Arc<dyn crate::hw::IrqHandler>;
        let handler: std::sync::Weak<dyn crate::hw::IrqHandler> = Arc::downgrade(&handler_arc);
        hw.set_irq_handler(handler);
        devices.insert(id, Arc::clone(&device));
        Ok(device)
    }

    /// Detach a board, waiting for in-flight DMA to settle first.
    pub fn detach(&self, id: DeviceId) -> Result<()> {
        let device = self.devices.write().remove(&id).ok_or(Error::Detached)?;
        device.shutdown();
        info!("{}: detached", id);
        Ok(())
    }

    pub fn get(&self, id: DeviceId) -> Option<Arc<BoardDevice>> {
        self.devices.read().get(&id).cloned()
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.devices.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
