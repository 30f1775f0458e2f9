//! In-memory 82357A for testing without hardware
//!
//! [`Simulated82357A`] implements [`UsbTransport`] by interpreting the same
//! command frames the real firmware does:
//! - register writes/reads with complemented-command replies
//! - WRITE frames delivered to per-address instrument responders, followed
//!   by a write-complete interrupt packet
//! - READ frames answered from the addressed instrument's output buffer,
//!   honouring the EOS and EOI flags and the requested length
//!
//! It also keeps a call log and supports failure injection. IN transfers
//! yield to the scheduler once, and those with nothing to return fail with
//! [`TransportError::Timeout`] immediately instead of waiting out the timeout.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use super::protocol::*;
use crate::bus::LineStatus;
use crate::usb::{ControlRequest, TransportError, UsbBackend, UsbDeviceInfo, UsbTransport};

/// Computes an instrument's response to a received message; `None` means
/// the message produces no output.
pub type Responder = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// Trailer byte appended to read data.
const READ_TRAILER: u8 = 0x00;

#[derive(Default)]
struct SimState {
    register_writes: Vec<(u8, u8)>,
    line_status: LineStatus,
    bulk_in: VecDeque<Vec<u8>>,
    interrupts: VecDeque<Vec<u8>>,
    output: HashMap<u8, VecDeque<u8>>,
    received: HashMap<u8, Vec<Vec<u8>>>,
    call_log: Vec<String>,
    drop_next_reply: bool,
    next_status: Option<u8>,
    suppress_write_complete: bool,
    query_interruption: bool,
}

/// Simulated Agilent 82357A firmware.
///
/// Clones share state, so a test can keep one handle while the adapter
/// owns another.
#[derive(Clone, Default)]
pub struct Simulated82357A {
    state: Arc<Mutex<SimState>>,
    instruments: Arc<Mutex<HashMap<u8, Responder>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Simulated82357A {
    /// Create a simulator with no instruments on the bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an instrument at `address`.
    pub fn with_instrument<F>(self, address: u8, responder: F) -> Self
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        lock(&self.instruments).insert(address, Arc::new(responder));
        self
    }

    /// Make every instrument discard unread output when it is sent a new
    /// message, as IEEE 488.2 devices do on a query interruption.
    pub fn with_query_interruption(self) -> Self {
        lock(&self.state).query_interruption = true;
        self
    }

    /// Messages the instrument at `address` has received, in order.
    pub fn messages_to(&self, address: u8) -> Vec<Vec<u8>> {
        lock(&self.state)
            .received
            .get(&address)
            .cloned()
            .unwrap_or_default()
    }

    /// Every register write the firmware has accepted, in order.
    pub fn register_writes(&self) -> Vec<(u8, u8)> {
        lock(&self.state).register_writes.clone()
    }

    /// Get the call log
    pub fn call_log(&self) -> Vec<String> {
        lock(&self.state).call_log.clone()
    }

    /// Clear the call log
    pub fn clear_log(&self) {
        lock(&self.state).call_log.clear();
    }

    /// Set what the status registers report.
    pub fn set_line_status(&self, status: LineStatus) {
        lock(&self.state).line_status = status;
    }

    /// Swallow the reply to the next command.
    pub fn inject_reply_drop(&self) {
        lock(&self.state).drop_next_reply = true;
    }

    /// Report `code` as the status of the next register command.
    pub fn inject_adapter_status(&self, code: u8) {
        lock(&self.state).next_status = Some(code);
    }

    /// Stop (or resume) sending write-complete interrupts.
    pub fn suppress_write_complete(&self, suppress: bool) {
        lock(&self.state).suppress_write_complete = suppress;
    }

    /// Put raw bytes at the front of the bulk IN queue.
    pub fn queue_bulk_in(&self, data: Vec<u8>) {
        lock(&self.state).bulk_in.push_front(data);
    }

    fn responder(&self, address: u8) -> Option<Responder> {
        lock(&self.instruments).get(&address).cloned()
    }

    fn handle_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        let command = *frame
            .first()
            .ok_or_else(|| TransportError::Fault("empty command frame".to_string()))?;

        match command {
            CMD_WRITE_REGS => self.handle_write_regs(frame),
            CMD_READ_REGS => self.handle_read_regs(frame),
            CMD_WRITE => self.handle_write(frame),
            CMD_READ => self.handle_read(frame),
            other => Err(TransportError::Fault(format!(
                "unknown command 0x{:02x}",
                other
            ))),
        }
    }

    fn handle_write_regs(&self, frame: &[u8]) -> Result<(), TransportError> {
        let count = usize::from(*frame.get(1).unwrap_or(&0));
        let pairs = frame.get(2..2 + 2 * count).ok_or_else(|| {
            TransportError::Fault("truncated WRITE_REGS frame".to_string())
        })?;

        let mut state = lock(&self.state);
        state.call_log.push(format!("bulk_out WRITE_REGS n={}", count));
        let status = state.next_status.take().unwrap_or(0);
        if status == 0 {
            state
                .register_writes
                .extend(pairs.chunks_exact(2).map(|pair| (pair[0], pair[1])));
        }
        Self::push_reply(&mut state, vec![!CMD_WRITE_REGS, status]);
        Ok(())
    }

    fn handle_read_regs(&self, frame: &[u8]) -> Result<(), TransportError> {
        let count = usize::from(*frame.get(1).unwrap_or(&0));
        let regs = frame
            .get(2..2 + count)
            .ok_or_else(|| TransportError::Fault("truncated READ_REGS frame".to_string()))?;

        let mut state = lock(&self.state);
        state.call_log.push(format!("bulk_out READ_REGS n={}", count));
        let status = state.next_status.take().unwrap_or(0);
        let mut reply = vec![!CMD_READ_REGS, status];
        for reg in regs {
            reply.push(match *reg {
                TMS9914_ADDR_STATUS => state.line_status.address_status,
                TMS9914_BUS_STATUS => state.line_status.bus_status,
                _ => 0,
            });
        }
        Self::push_reply(&mut state, reply);
        Ok(())
    }

    fn handle_write(&self, frame: &[u8]) -> Result<(), TransportError> {
        let header = frame
            .get(..WRITE_HEADER_LEN)
            .ok_or_else(|| TransportError::Fault("truncated WRITE header".to_string()))?;
        let address = header[1];
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let payload = frame
            .get(WRITE_HEADER_LEN..WRITE_HEADER_LEN + len)
            .ok_or_else(|| TransportError::Fault("WRITE payload shorter than header".to_string()))?
            .to_vec();

        let response = self.responder(address).and_then(|respond| respond(&payload));

        let mut state = lock(&self.state);
        state
            .call_log
            .push(format!("bulk_out WRITE addr={} len={}", address, len));
        let query_interruption = state.query_interruption;
        let output = state.output.entry(address).or_default();
        if query_interruption && !output.is_empty() {
            trace!(address, discarded = output.len(), "Query interrupted");
            output.clear();
        }
        if let Some(response) = response {
            output.extend(response);
        }
        state.received.entry(address).or_default().push(payload);
        if !state.suppress_write_complete {
            let mut packet = vec![0u8; INTERRUPT_PACKET_LEN];
            packet[0] = INTERRUPT_WRITE_COMPLETE;
            state.interrupts.push_back(packet);
        }
        Ok(())
    }

    fn handle_read(&self, frame: &[u8]) -> Result<(), TransportError> {
        if frame.len() < 9 {
            return Err(TransportError::Fault("truncated READ frame".to_string()));
        }
        let address = frame[1];
        let flags = frame[3];
        let max_len = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
        let eos = frame[8];

        let mut state = lock(&self.state);
        state.call_log.push(format!(
            "bulk_out READ addr={} flags=0x{:02x} max={}",
            address, flags, max_len
        ));

        let Some(buffer) = state.output.get_mut(&address) else {
            return Ok(());
        };
        if buffer.is_empty() {
            return Ok(());
        }

        // The talker asserts EOI with its last buffered byte. Without an
        // enabled end condition the firmware waits for max_len bytes.
        let available = buffer.len().min(max_len);
        let eos_end = (flags & READ_XFER_FLAG_END_ON_EOS != 0)
            .then(|| buffer.iter().take(available).position(|b| *b == eos))
            .flatten();
        let take = match eos_end {
            Some(pos) => pos + 1,
            None if flags & READ_XFER_FLAG_END_ON_EOI != 0 => available,
            None if buffer.len() >= max_len => max_len,
            None => return Ok(()),
        };
        let mut reply: Vec<u8> = buffer.drain(..take).collect();
        reply.push(READ_TRAILER);
        Self::push_reply(&mut state, reply);
        Ok(())
    }

    fn push_reply(state: &mut SimState, reply: Vec<u8>) {
        if state.drop_next_reply {
            state.drop_next_reply = false;
            return;
        }
        state.bulk_in.push_back(reply);
    }
}

#[async_trait]
impl UsbTransport for Simulated82357A {
    async fn control_in(
        &self,
        request: ControlRequest,
        length: u16,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut state = lock(&self.state);
        if request.request == REQ_CONTROL && request.value == WVALUE_ABORT_TRANSFER {
            state
                .call_log
                .push(format!("control_in abort flush={}", request.index & 1 == 1));
        } else {
            state.call_log.push(format!(
                "control_in req=0x{:02x} wValue=0x{:04x}",
                request.request, request.value
            ));
        }
        Ok(vec![0; usize::from(length)])
    }

    async fn control_out(
        &self,
        request: ControlRequest,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        let data_hex: String = data.iter().map(|b| format!("{:02x}", b)).collect();
        lock(&self.state).call_log.push(format!(
            "control_out req=0x{:02x} wValue=0x{:04x} data={}",
            request.request, request.value, data_hex
        ));
        Ok(())
    }

    async fn bulk_out(
        &self,
        endpoint: u8,
        data: Vec<u8>,
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        if endpoint != EP_BULK_OUT {
            return Err(TransportError::Stall);
        }
        trace!(bytes = data.len(), "Simulated bulk OUT");
        self.handle_frame(&data)?;
        Ok(data.len())
    }

    async fn bulk_in(
        &self,
        endpoint: u8,
        max_len: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if endpoint != EP_BULK_IN {
            return Err(TransportError::Stall);
        }
        // IN transfers take bus time; let other tasks run meanwhile.
        tokio::task::yield_now().await;
        let mut state = lock(&self.state);
        let mut reply = state.bulk_in.pop_front().ok_or(TransportError::Timeout)?;
        reply.truncate(max_len);
        Ok(reply)
    }

    async fn interrupt_in(
        &self,
        endpoint: u8,
        max_len: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if endpoint != EP_INTERRUPT_IN {
            return Err(TransportError::Stall);
        }
        tokio::task::yield_now().await;
        let mut state = lock(&self.state);
        let mut packet = state.interrupts.pop_front().ok_or(TransportError::Timeout)?;
        packet.truncate(max_len);
        Ok(packet)
    }
}

/// [`UsbBackend`] serving simulated adapters.
#[derive(Clone, Default)]
pub struct SimulatedBackend {
    devices: Arc<Mutex<Vec<(UsbDeviceInfo, Simulated82357A)>>>,
    opens: Arc<Mutex<usize>>,
}

impl SimulatedBackend {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug in a simulated adapter; it gets the next free device address on bus 1.
    pub fn with_device(self, sim: Simulated82357A) -> Self {
        self.plug(sim);
        self
    }

    /// Plug in a simulated adapter, returning its USB identity.
    pub fn plug(&self, sim: Simulated82357A) -> UsbDeviceInfo {
        let mut devices = lock(&self.devices);
        let next_address = devices
            .iter()
            .map(|(info, _)| info.device_address)
            .max()
            .unwrap_or(1)
            + 1;
        let info = UsbDeviceInfo {
            vendor_id: VENDOR_ID,
            product_id: PRODUCT_ID,
            bus_number: 1,
            device_address: next_address,
            product: Some("82357A USB/GPIB Interface (simulated)".to_string()),
            serial_number: Some(format!("SIM{:04}", next_address)),
        };
        devices.push((info.clone(), sim));
        info
    }

    /// Remove the adapter at `location` (as in [`UsbDeviceInfo::location`]).
    pub fn unplug(&self, location: &str) {
        lock(&self.devices).retain(|(info, _)| info.location() != location);
    }

    /// Identities of all plugged-in adapters.
    pub fn devices(&self) -> Vec<UsbDeviceInfo> {
        lock(&self.devices)
            .iter()
            .map(|(info, _)| info.clone())
            .collect()
    }

    /// How many times a device has been opened.
    pub fn open_count(&self) -> usize {
        *lock(&self.opens)
    }
}

impl UsbBackend for SimulatedBackend {
    fn list_devices(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Vec<UsbDeviceInfo>, TransportError> {
        Ok(lock(&self.devices)
            .iter()
            .filter(|(info, _)| info.vendor_id == vendor_id && info.product_id == product_id)
            .map(|(info, _)| info.clone())
            .collect())
    }

    fn open(
        &self,
        device: &UsbDeviceInfo,
        _configuration: u8,
        _interface: u8,
    ) -> Result<Box<dyn UsbTransport>, TransportError> {
        let devices = lock(&self.devices);
        let (_, sim) = devices
            .iter()
            .find(|(info, _)| info.location() == device.location())
            .ok_or(TransportError::Disconnected)?;
        *lock(&self.opens) += 1;
        Ok(Box::new(sim.clone()))
    }
}
