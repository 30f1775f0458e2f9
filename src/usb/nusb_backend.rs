//! Real USB access through the `nusb` crate.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use nusb::transfer::{
    Completion, ControlIn, ControlOut, ControlType, Recipient, RequestBuffer, TransferError,
};
use tracing::debug;

use super::{ControlRequest, TransportError, UsbBackend, UsbDeviceInfo, UsbTransport};

/// [`UsbBackend`] backed by the operating system's USB stack (usbfs on Linux).
#[derive(Debug, Default, Clone, Copy)]
pub struct NusbBackend;

impl NusbBackend {
    /// Create the backend.
    pub fn new() -> Self {
        Self
    }
}

fn device_info(dev: &nusb::DeviceInfo) -> UsbDeviceInfo {
    UsbDeviceInfo {
        vendor_id: dev.vendor_id(),
        product_id: dev.product_id(),
        bus_number: dev.bus_number(),
        device_address: dev.device_address(),
        product: dev.product_string().map(str::to_string),
        serial_number: dev.serial_number().map(str::to_string),
    }
}

impl UsbBackend for NusbBackend {
    fn list_devices(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Vec<UsbDeviceInfo>, TransportError> {
        let devices = nusb::list_devices()
            .map_err(|e| TransportError::Fault(format!("USB enumeration failed: {}", e)))?;

        Ok(devices
            .filter(|dev| dev.vendor_id() == vendor_id && dev.product_id() == product_id)
            .map(|dev| device_info(&dev))
            .collect())
    }

    fn open(
        &self,
        device: &UsbDeviceInfo,
        configuration: u8,
        interface: u8,
    ) -> Result<Box<dyn UsbTransport>, TransportError> {
        let info = nusb::list_devices()
            .map_err(|e| TransportError::Open(e.to_string()))?
            .find(|dev| {
                dev.bus_number() == device.bus_number
                    && dev.device_address() == device.device_address
            })
            .ok_or(TransportError::Disconnected)?;

        let handle = info
            .open()
            .map_err(|e| TransportError::Open(format!("{}: {}", device.location(), e)))?;

        // Fails while the adapter's 8051 is held in reset.
        handle.set_configuration(configuration).map_err(|e| {
            TransportError::Open(format!(
                "{}: cannot set configuration {}: {}",
                device.location(),
                configuration,
                e
            ))
        })?;

        let claimed = handle.claim_interface(interface).map_err(|e| {
            TransportError::Open(format!(
                "{}: cannot claim interface {}: {}",
                device.location(),
                interface,
                e
            ))
        })?;

        debug!(device = %device.location(), configuration, interface, "USB device opened");

        Ok(Box::new(NusbTransport {
            _device: handle,
            interface: claimed,
        }))
    }
}

/// An open device with one claimed interface.
pub struct NusbTransport {
    _device: nusb::Device,
    interface: nusb::Interface,
}

fn map_transfer_error(err: TransferError) -> TransportError {
    match err {
        TransferError::Stall => TransportError::Stall,
        TransferError::Disconnected => TransportError::Disconnected,
        TransferError::Cancelled => TransportError::Cancelled,
        other => TransportError::Fault(other.to_string()),
    }
}

/// Await a transfer, cancelling it (by dropping the future) on timeout.
async fn complete<T>(
    transfer: impl Future<Output = Completion<T>>,
    timeout: Duration,
) -> Result<T, TransportError> {
    let completion = tokio::time::timeout(timeout, transfer)
        .await
        .map_err(|_| TransportError::Timeout)?;
    completion.into_result().map_err(map_transfer_error)
}

fn control_type(request_type: u8) -> ControlType {
    match (request_type >> 5) & 0x03 {
        0 => ControlType::Standard,
        1 => ControlType::Class,
        _ => ControlType::Vendor,
    }
}

fn recipient(request_type: u8) -> Recipient {
    match request_type & 0x1f {
        1 => Recipient::Interface,
        2 => Recipient::Endpoint,
        3 => Recipient::Other,
        _ => Recipient::Device,
    }
}

#[async_trait]
impl UsbTransport for NusbTransport {
    async fn control_in(
        &self,
        request: ControlRequest,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let transfer = self.interface.control_in(ControlIn {
            control_type: control_type(request.request_type),
            recipient: recipient(request.request_type),
            request: request.request,
            value: request.value,
            index: request.index,
            length,
        });
        complete(transfer, timeout).await
    }

    async fn control_out(
        &self,
        request: ControlRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let transfer = self.interface.control_out(ControlOut {
            control_type: control_type(request.request_type),
            recipient: recipient(request.request_type),
            request: request.request,
            value: request.value,
            index: request.index,
            data,
        });
        complete(transfer, timeout).await.map(|_| ())
    }

    async fn bulk_out(
        &self,
        endpoint: u8,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let transfer = self.interface.bulk_out(endpoint, data);
        complete(transfer, timeout)
            .await
            .map(|written| written.actual_length())
    }

    async fn bulk_in(
        &self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let transfer = self.interface.bulk_in(endpoint, RequestBuffer::new(max_len));
        complete(transfer, timeout).await
    }

    async fn interrupt_in(
        &self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let transfer = self
            .interface
            .interrupt_in(endpoint, RequestBuffer::new(max_len));
        complete(transfer, timeout).await
    }
}
