//! GPIB adapter implementations
//!
//! This module contains the [`GpibAdapter`] trait, implemented once per
//! supported USB-GPIB bridge, and the [`AdapterDriver`] trait used to
//! discover adapters of one model. [`AdapterRegistry`] ties drivers together
//! and hands out shared [`Interface`](crate::Interface) handles.

pub mod agilent_82357a;
pub mod registry;

pub use agilent_82357a::{Agilent82357A, Agilent82357ADriver, Agilent82357AOptions};
pub use registry::{default_registry, list_adapters, AdapterRegistry};

use async_trait::async_trait;
use serde::Serialize;

use crate::bus::{BusConfig, LineStatus, PrimaryAddress};
use crate::error::GpibResult;
use crate::usb::UsbDeviceInfo;

/// Description of a discovered adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterInfo {
    /// Name of the driver handling the adapter (e.g. "agilent_82357a")
    pub driver: String,
    /// Stable identifier while the adapter stays attached
    pub id: String,
    /// Underlying USB device
    pub usb: UsbDeviceInfo,
}

impl AdapterInfo {
    /// Build the info record for a USB device handled by `driver`.
    pub fn from_usb(driver: &str, usb: UsbDeviceInfo) -> Self {
        Self {
            driver: driver.to_string(),
            id: usb.location(),
            usb,
        }
    }

    /// Human readable one-line description.
    pub fn describe(&self) -> String {
        let product = self.usb.product.as_deref().unwrap_or("unknown product");
        match &self.usb.serial_number {
            Some(serial) => format!("{} {} (serial {}) at {}", self.driver, product, serial, self.id),
            None => format!("{} {} at {}", self.driver, product, self.id),
        }
    }
}

/// One USB-GPIB bridge acting as controller in charge.
///
/// Implementations translate message-level reads and writes into their
/// hardware's command set. Callers serialize access; methods take `&mut self`.
#[async_trait]
pub trait GpibAdapter: Send + Sync {
    /// Identity of this adapter.
    fn info(&self) -> &AdapterInfo;

    /// Whether [`open`](Self::open) has succeeded and [`close`](Self::close) has not been called since.
    fn is_open(&self) -> bool;

    /// Take the adapter as system controller at `controller_address`.
    ///
    /// Calling this on an open adapter re-initializes it.
    async fn open(&mut self, controller_address: PrimaryAddress) -> GpibResult<()>;

    /// Release the adapter and relinquish bus control.
    async fn close(&mut self) -> GpibResult<()>;

    /// Address `address` as talker and read one message.
    async fn read_msg(&mut self, address: PrimaryAddress, config: &BusConfig)
        -> GpibResult<Vec<u8>>;

    /// Address `address` as listener and send `data`.
    async fn write_msg(
        &mut self,
        address: PrimaryAddress,
        data: &[u8],
        config: &BusConfig,
    ) -> GpibResult<()>;

    /// Pulse IFC, returning every device to its idle state.
    async fn clear_interface(&mut self) -> GpibResult<()>;

    /// Read the controller's address and bus status.
    async fn line_status(&mut self) -> GpibResult<LineStatus>;
}

/// Discovery for one adapter model.
pub trait AdapterDriver: Send + Sync {
    /// Driver name, also used in [`AdapterInfo::driver`].
    fn name(&self) -> &'static str;

    /// Adapters of this model currently attached.
    fn list_adapters(&self) -> GpibResult<Vec<Box<dyn GpibAdapter>>>;
}
