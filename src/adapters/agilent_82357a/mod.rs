//! Userspace driver for the Agilent 82357A USB/GPIB interface
//!
//! Talks to the adapter firmware directly over USB, so neither the vendor
//! library nor linux-gpib kernel modules are needed.
//!
//! Every WRITE is acknowledged by an interrupt packet once the data has left
//! the adapter; reads are answered on the bulk IN endpoint. A read that times
//! out leaves the firmware mid-transfer, so it is always followed by an abort
//! with buffer flush before the adapter is used again.
//!
//! The 82357B uses different endpoint numbers and is not handled here.

pub mod protocol;
pub mod simulator;

pub use simulator::{SimulatedBackend, Simulated82357A};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use self::protocol::*;
use super::{AdapterDriver, AdapterInfo, GpibAdapter};
use crate::bus::{BusConfig, LineStatus, PrimaryAddress};
use crate::error::{GpibError, GpibResult};
use crate::usb::{ControlRequest, TransportError, UsbBackend, UsbDeviceInfo, UsbTransport};

/// Driver name reported in [`AdapterInfo::driver`].
pub const DRIVER_NAME: &str = "agilent_82357a";

/// Tunables for the 82357A driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Agilent82357AOptions {
    /// Largest message requested from an instrument in one READ
    pub read_chunk_len: u32,
    /// Timeout for register command replies and control requests
    pub reply_timeout: Duration,
    /// How long to wait for the write-complete interrupt
    pub write_complete_timeout: Duration,
    /// Timeout for pushing a command frame to the adapter
    pub bulk_out_timeout: Duration,
}

impl Default for Agilent82357AOptions {
    fn default() -> Self {
        Self {
            read_chunk_len: 1024,
            reply_timeout: Duration::from_millis(100),
            write_complete_timeout: Duration::from_millis(100),
            bulk_out_timeout: Duration::from_secs(1),
        }
    }
}

/// Discovers 82357A adapters through a [`UsbBackend`].
pub struct Agilent82357ADriver {
    backend: Arc<dyn UsbBackend>,
    options: Agilent82357AOptions,
}

impl Agilent82357ADriver {
    /// Create a driver enumerating devices through `backend`.
    pub fn new(backend: Arc<dyn UsbBackend>) -> Self {
        Self {
            backend,
            options: Agilent82357AOptions::default(),
        }
    }

    /// Override the options handed to every adapter this driver finds.
    pub fn with_options(mut self, options: Agilent82357AOptions) -> Self {
        self.options = options;
        self
    }
}

impl AdapterDriver for Agilent82357ADriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn list_adapters(&self) -> GpibResult<Vec<Box<dyn GpibAdapter>>> {
        let devices = self.backend.list_devices(VENDOR_ID, PRODUCT_ID)?;
        debug!(count = devices.len(), "Enumerated 82357A adapters");

        Ok(devices
            .into_iter()
            .map(|usb| {
                Box::new(Agilent82357A::new(usb, self.backend.clone(), self.options))
                    as Box<dyn GpibAdapter>
            })
            .collect())
    }
}

/// One Agilent 82357A adapter.
pub struct Agilent82357A {
    info: AdapterInfo,
    backend: Arc<dyn UsbBackend>,
    options: Agilent82357AOptions,
    transport: Option<Box<dyn UsbTransport>>,
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl Agilent82357A {
    /// Wrap a discovered (not yet opened) device.
    pub fn new(
        usb: UsbDeviceInfo,
        backend: Arc<dyn UsbBackend>,
        options: Agilent82357AOptions,
    ) -> Self {
        Self {
            info: AdapterInfo::from_usb(DRIVER_NAME, usb),
            backend,
            options,
            transport: None,
        }
    }

    /// Options in effect for this adapter.
    pub fn options(&self) -> &Agilent82357AOptions {
        &self.options
    }

    fn transport(&self) -> GpibResult<&dyn UsbTransport> {
        self.transport
            .as_deref()
            .ok_or_else(|| GpibError::NotOpen(self.info.id.clone()))
    }

    async fn send(&self, frame: Vec<u8>) -> GpibResult<()> {
        let transport = self.transport()?;
        let len = frame.len();
        let written = transport
            .bulk_out(EP_BULK_OUT, frame, self.options.bulk_out_timeout)
            .await?;
        if written != len {
            return Err(GpibError::Protocol(format!(
                "short write to adapter: {} of {} bytes",
                written, len
            )));
        }
        Ok(())
    }

    async fn read_reply(&self, command: u8, extra_bytes: usize) -> GpibResult<Vec<u8>> {
        let reply = self
            .transport()?
            .bulk_in(EP_BULK_IN, 2 + extra_bytes, self.options.reply_timeout)
            .await?;
        parse_reply(command, &reply, extra_bytes)
    }

    async fn write_regs(&self, writes: &[RegWrite]) -> GpibResult<()> {
        self.send(encode_write_regs(writes)).await?;
        self.read_reply(CMD_WRITE_REGS, 0).await.map(|_| ())
    }

    async fn read_regs(&self, regs: &[u8]) -> GpibResult<Vec<u8>> {
        self.send(encode_read_regs(regs)).await?;
        self.read_reply(CMD_READ_REGS, regs.len()).await
    }

    /// Abort whatever the firmware is doing; returns the 2-byte transfer status.
    async fn abort_transfer(&self, flush_buffers: bool) -> GpibResult<Vec<u8>> {
        let transport = self.transport()?;
        let request =
            ControlRequest::vendor_in(REQ_CONTROL, WVALUE_ABORT_TRANSFER, u16::from(flush_buffers));
        let status = transport
            .control_in(request, 2, self.options.reply_timeout)
            .await?;

        if flush_buffers {
            // Nothing left over is the normal case.
            if let Ok(leftover) = transport
                .bulk_in(EP_BULK_IN, 2, self.options.reply_timeout)
                .await
            {
                if !leftover.is_empty() {
                    warn!(adapter = %self.info.id, leftover = %hex(&leftover), "Leftover buffer data");
                }
            }
        }

        Ok(status)
    }

    async fn initialize(&self, controller_address: PrimaryAddress) -> GpibResult<()> {
        self.abort_transfer(false).await?;
        self.write_regs(&[(RESET_TO_POWERUP, 1)]).await?;
        self.write_regs(&init_sequence(controller_address)).await?;
        self.pulse_ifc().await
    }

    async fn pulse_ifc(&self) -> GpibResult<()> {
        self.write_regs(&[(TMS9914_AUXCR, AUX_SIC | AUX_CS)]).await?;
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.write_regs(&[(TMS9914_AUXCR, AUX_SIC)]).await
    }

    async fn wait_for_write_complete(&self) -> GpibResult<()> {
        let transport = self.transport()?;
        let deadline = Instant::now() + self.options.write_complete_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(adapter = %self.info.id, "Write completion was not signalled in time");
                return Ok(());
            }

            match transport
                .interrupt_in(EP_INTERRUPT_IN, INTERRUPT_PACKET_LEN, remaining)
                .await
            {
                Ok(packet)
                    if packet
                        .first()
                        .is_some_and(|status| status & INTERRUPT_WRITE_COMPLETE != 0) =>
                {
                    return Ok(());
                }
                Ok(packet) => {
                    warn!(adapter = %self.info.id, packet = %hex(&packet), "Unknown interrupt packet");
                }
                Err(TransportError::Timeout) => {
                    warn!(adapter = %self.info.id, "Write completion was not signalled in time");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Put the adapter back into a usable state after a failed read.
    async fn recover_failed_read(&self) {
        match self.abort_transfer(true).await {
            Ok(status) => error!(adapter = %self.info.id, status = %hex(&status), "Transfer aborted"),
            Err(err) => error!(adapter = %self.info.id, error = %err, "Failed to abort transfer"),
        }

        match self.read_line_status().await {
            Ok(status) => error!(adapter = %self.info.id, lines = %status, "Line status after abort"),
            Err(err) => warn!(adapter = %self.info.id, error = %err, "Could not read line status"),
        }
    }

    async fn read_line_status(&self) -> GpibResult<LineStatus> {
        let values = self
            .read_regs(&[TMS9914_ADDR_STATUS, TMS9914_BUS_STATUS])
            .await?;
        Ok(LineStatus {
            address_status: values[0],
            bus_status: values[1],
        })
    }

    /// Hold and release the adapter's 8051 core in reset.
    ///
    /// The device drops off the bus and re-enumerates, so the adapter is
    /// closed afterwards and must be rediscovered.
    pub async fn reset_microcontroller(&mut self) -> GpibResult<()> {
        let transport = self.transport()?;
        let request = ControlRequest::vendor_out(REQ_FX_FIRMWARE, FX_CPUCS_ADDRESS, 0);
        transport
            .control_out(request, &[1], self.options.reply_timeout)
            .await?;
        transport
            .control_out(request, &[0], self.options.reply_timeout)
            .await?;

        warn!(adapter = %self.info.id, "8051 reset issued, adapter will re-enumerate");
        self.transport = None;
        Ok(())
    }
}

#[async_trait]
impl GpibAdapter for Agilent82357A {
    fn info(&self) -> &AdapterInfo {
        &self.info
    }

    fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    async fn open(&mut self, controller_address: PrimaryAddress) -> GpibResult<()> {
        if self.transport.is_none() {
            let backend = self.backend.clone();
            let usb = self.info.usb.clone();

            // Device open and configuration are blocking syscalls.
            let transport = tokio::task::spawn_blocking(move || {
                backend.open(&usb, USB_CONFIGURATION, USB_INTERFACE)
            })
            .await
            .map_err(|e| TransportError::Open(format!("open task failed: {}", e)))??;

            self.transport = Some(transport);
        } else {
            debug!(adapter = %self.info.id, "Re-initializing open adapter");
        }

        if let Err(err) = self.initialize(controller_address).await {
            self.transport = None;
            return Err(err);
        }

        info!(
            adapter = %self.info.id,
            controller_address = %controller_address,
            "Adapter is controller in charge"
        );
        Ok(())
    }

    async fn close(&mut self) -> GpibResult<()> {
        if self.transport.take().is_some() {
            debug!(adapter = %self.info.id, "Adapter released");
        }
        Ok(())
    }

    async fn read_msg(
        &mut self,
        address: PrimaryAddress,
        config: &BusConfig,
    ) -> GpibResult<Vec<u8>> {
        let max_len = self.options.read_chunk_len;
        self.send(encode_read(address, max_len, config)).await?;

        let result = self
            .transport()?
            .bulk_in(EP_BULK_IN, max_len as usize + 1, config.read_timeout)
            .await;

        match result {
            Ok(reply) if reply.is_empty() => {
                warn!(adapter = %self.info.id, address = %address, "No reply to read request");
                Err(GpibError::NoReply(address.value()))
            }
            Ok(reply) => {
                let data = strip_read_trailer(reply);
                debug!(adapter = %self.info.id, address = %address, bytes = data.len(), "Read message");
                Ok(data)
            }
            Err(err) => {
                self.recover_failed_read().await;
                match err {
                    TransportError::Timeout => Err(GpibError::Timeout {
                        address: address.value(),
                        timeout: config.read_timeout,
                    }),
                    other => Err(other.into()),
                }
            }
        }
    }

    async fn write_msg(
        &mut self,
        address: PrimaryAddress,
        data: &[u8],
        config: &BusConfig,
    ) -> GpibResult<()> {
        self.send(encode_write(address, data, config)?).await?;
        debug!(adapter = %self.info.id, address = %address, bytes = data.len(), "Wrote message");
        self.wait_for_write_complete().await
    }

    async fn clear_interface(&mut self) -> GpibResult<()> {
        self.transport()?;
        self.pulse_ifc().await
    }

    async fn line_status(&mut self) -> GpibResult<LineStatus> {
        self.read_line_status().await
    }
}
