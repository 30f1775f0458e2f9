//! I/O stream to one GPIB device

use std::sync::PoisonError;

use tracing::debug;

use crate::bus::{BusConfig, PrimaryAddress};
use crate::error::GpibResult;
use crate::interface::{Interface, SharedBusConfig};

/// A device on the bus, obtained from [`Interface::get_instrument`].
///
/// ```no_run
/// # async fn demo() -> gpib_usb::GpibResult<()> {
/// let interface = gpib_usb::list_adapters()?
///     .into_iter()
///     .next()
///     .ok_or(gpib_usb::GpibError::NoAdapter)?;
/// interface.open(0).await?;
///
/// let dmm = interface.get_instrument(22)?;
/// dmm.configure(gpib_usb::BusConfig::default().with_eos(b'\n'))?;
/// println!("{}", dmm.query_text("ID?").await?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Instrument {
    interface: Interface,
    address: PrimaryAddress,
    config: SharedBusConfig,
}

impl std::fmt::Debug for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrument")
            .field("interface", &self.interface.info().id)
            .field("address", &self.address)
            .field("config", &self.config())
            .finish()
    }
}

impl Instrument {
    pub(crate) fn new(interface: Interface, address: PrimaryAddress, config: SharedBusConfig) -> Self {
        Self {
            interface,
            address,
            config,
        }
    }

    /// Primary address of the device.
    pub fn address(&self) -> PrimaryAddress {
        self.address
    }

    /// The interface this device is reached through.
    pub fn interface(&self) -> &Interface {
        &self.interface
    }

    /// Replace the termination settings for this address.
    pub fn configure(&self, config: BusConfig) -> GpibResult<()> {
        config.validate()?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        debug!(address = %self.address, ?config, "Instrument configured");
        Ok(())
    }

    /// Current termination settings.
    pub fn config(&self) -> BusConfig {
        *self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send one message. Text is sent as UTF-8.
    pub async fn write(&self, data: impl AsRef<[u8]>) -> GpibResult<()> {
        let config = self.config();
        self.interface
            .write_to(self.address, data.as_ref(), &config)
            .await
    }

    /// Read one message, ending on EOI and/or EOS as configured.
    pub async fn read(&self) -> GpibResult<Vec<u8>> {
        let config = self.config();
        self.interface.read_from(self.address, &config).await
    }

    /// Write `data` and read the answer as one bus transaction.
    pub async fn query(&self, data: impl AsRef<[u8]>) -> GpibResult<Vec<u8>> {
        let config = self.config();
        self.interface
            .transact(self.address, data.as_ref(), &config)
            .await
    }

    /// [`query`](Self::query) returning text without the trailing line terminator.
    pub async fn query_text(&self, data: impl AsRef<[u8]>) -> GpibResult<String> {
        let reply = self.query(data).await?;
        Ok(String::from_utf8_lossy(&reply)
            .trim_end_matches(['\r', '\n'])
            .to_string())
    }
}
