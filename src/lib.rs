//! Userspace drivers for USB-attached GPIB (IEEE-488) adapters.
//!
//! The library talks to the adapter's firmware directly over USB, so no
//! vendor library or kernel module is needed. Typical use:
//!
//! ```no_run
//! # async fn demo() -> gpib_usb::GpibResult<()> {
//! use gpib_usb::{list_adapters, BusConfig, GpibError};
//!
//! let interface = list_adapters()?.into_iter().next().ok_or(GpibError::NoAdapter)?;
//! interface.open(0).await?;
//!
//! let dmm = interface.get_instrument(22)?;
//! dmm.configure(BusConfig::default().with_eos(b'\n'))?;
//! let id = dmm.query_text("ID?").await?;
//! println!("{id}");
//!
//! interface.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Supported adapters:
//! - Agilent 82357A ([`adapters::agilent_82357a`])
//!
//! Without hardware, [`adapters::agilent_82357a::Simulated82357A`] stands in
//! for an adapter with scripted instruments attached.

pub mod adapters;
pub mod bus;
pub mod config;
pub mod error;
pub mod instrument;
pub mod interface;
pub mod logging;
pub mod usb;

pub use adapters::{list_adapters, AdapterInfo, AdapterRegistry, GpibAdapter};
pub use bus::{BusConfig, LineStatus, PrimaryAddress};
pub use config::GpibConfig;
pub use error::{GpibError, GpibResult};
pub use instrument::Instrument;
pub use interface::Interface;
