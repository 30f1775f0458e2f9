//! USB transport abstraction
//!
//! Adapter drivers speak to their hardware through [`UsbTransport`], an
//! already-opened device with one claimed interface, and find hardware
//! through [`UsbBackend`]. The real implementation lives in
//! [`nusb_backend`] (feature `usb`); drivers can also be handed simulated
//! transports for testing without hardware.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[cfg(feature = "usb")]
pub mod nusb_backend;

#[cfg(feature = "usb")]
pub use nusb_backend::NusbBackend;

/// Failure of a single USB operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transfer timed out")]
    Timeout,

    #[error("endpoint stalled")]
    Stall,

    #[error("device disconnected")]
    Disconnected,

    #[error("transfer cancelled")]
    Cancelled,

    #[error("transfer failed: {0}")]
    Fault(String),

    #[error("failed to open device: {0}")]
    Open(String),
}

/// Identity of a USB device found during enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsbDeviceInfo {
    /// USB vendor ID
    pub vendor_id: u16,
    /// USB product ID
    pub product_id: u16,
    /// Bus the device is attached to
    pub bus_number: u8,
    /// Device address on that bus
    pub device_address: u8,
    /// Product string, if the device reports one
    pub product: Option<String>,
    /// Serial number string, if the device reports one
    pub serial_number: Option<String>,
}

impl UsbDeviceInfo {
    /// Stable key for this device while it stays plugged in.
    pub fn location(&self) -> String {
        format!("usb:{}-{}", self.bus_number, self.device_address)
    }
}

/// Setup fields of a control transfer (everything but the data stage).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
}

impl ControlRequest {
    /// Vendor-specific, device-recipient, device-to-host request.
    pub fn vendor_in(request: u8, value: u16, index: u16) -> Self {
        Self {
            request_type: 0xc0,
            request,
            value,
            index,
        }
    }

    /// Vendor-specific, device-recipient, host-to-device request.
    pub fn vendor_out(request: u8, value: u16, index: u16) -> Self {
        Self {
            request_type: 0x40,
            request,
            value,
            index,
        }
    }
}

/// An opened USB device with a claimed interface.
///
/// Every operation takes a timeout; a transfer that does not complete in
/// time is cancelled and reported as [`TransportError::Timeout`].
#[async_trait]
pub trait UsbTransport: Send + Sync {
    /// Control transfer reading up to `length` bytes.
    async fn control_in(
        &self,
        request: ControlRequest,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Control transfer writing `data`.
    async fn control_out(
        &self,
        request: ControlRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Bulk OUT transfer; returns the number of bytes written.
    async fn bulk_out(
        &self,
        endpoint: u8,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Bulk IN transfer of at most `max_len` bytes.
    async fn bulk_in(
        &self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Interrupt IN transfer of at most `max_len` bytes.
    async fn interrupt_in(
        &self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;
}

/// Enumerates and opens USB devices.
pub trait UsbBackend: Send + Sync {
    /// All attached devices matching the given vendor and product ID.
    fn list_devices(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Vec<UsbDeviceInfo>, TransportError>;

    /// Open a device, select `configuration` and claim `interface`.
    fn open(
        &self,
        device: &UsbDeviceInfo,
        configuration: u8,
        interface: u8,
    ) -> Result<Box<dyn UsbTransport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_request_types() {
        let req = ControlRequest::vendor_in(4, 0x00a0, 1);
        assert_eq!(req.request_type, 0xc0);
        assert_eq!(req.request, 4);
        assert_eq!(req.value, 0x00a0);
        assert_eq!(req.index, 1);
        assert_eq!(ControlRequest::vendor_out(0xa0, 0x7f92, 0).request_type, 0x40);
    }

    #[test]
    fn test_device_location() {
        let info = UsbDeviceInfo {
            vendor_id: 0x0957,
            product_id: 0x0107,
            bus_number: 3,
            device_address: 7,
            product: None,
            serial_number: None,
        };
        assert_eq!(info.location(), "usb:3-7");
    }
}
