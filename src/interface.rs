//! Shared controller-in-charge handle
//!
//! An [`Interface`] wraps one [`GpibAdapter`] behind `Arc<tokio::sync::Mutex<_>>`
//! so that any number of [`Instrument`] handles (and tasks) can share the
//! adapter while bus transactions stay strictly serialized.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::adapters::{AdapterInfo, GpibAdapter};
use crate::bus::{BusConfig, LineStatus, PrimaryAddress};
use crate::error::{GpibError, GpibResult};
use crate::instrument::Instrument;

/// Settings shared by every [`Instrument`] handle for one address.
pub(crate) type SharedBusConfig = Arc<RwLock<BusConfig>>;

struct InterfaceInner {
    info: AdapterInfo,
    adapter: Mutex<Box<dyn GpibAdapter>>,
    controller_address: StdMutex<Option<PrimaryAddress>>,
    instruments: StdMutex<HashMap<PrimaryAddress, SharedBusConfig>>,
}

/// One USB-GPIB adapter acting as controller in charge.
///
/// Cloning is cheap; clones refer to the same adapter.
#[derive(Clone)]
pub struct Interface {
    inner: Arc<InterfaceInner>,
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("id", &self.inner.info.id)
            .field("driver", &self.inner.info.driver)
            .finish()
    }
}

impl Interface {
    /// Wrap an adapter. The adapter is not opened.
    pub fn new(adapter: Box<dyn GpibAdapter>) -> Self {
        let info = adapter.info().clone();
        Self {
            inner: Arc::new(InterfaceInner {
                info,
                adapter: Mutex::new(adapter),
                controller_address: StdMutex::new(None),
                instruments: StdMutex::new(HashMap::new()),
            }),
        }
    }

    /// Initialize the adapter as system controller at `primary_address`.
    ///
    /// Opening an already open interface re-initializes the adapter.
    pub async fn open(&self, primary_address: u8) -> GpibResult<()> {
        let address = PrimaryAddress::new(primary_address)?;
        let mut adapter = self.inner.adapter.lock().await;
        let result = adapter.open(address).await;

        // A failed open leaves the adapter closed, even if it was open before.
        let current = if result.is_ok() && adapter.is_open() {
            Some(address)
        } else {
            None
        };
        *self
            .inner
            .controller_address
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = current;
        result?;

        info!(adapter = %self.inner.info.id, controller_address = %address, "Interface opened");
        Ok(())
    }

    /// Release the adapter.
    pub async fn close(&self) -> GpibResult<()> {
        let mut adapter = self.inner.adapter.lock().await;
        adapter.close().await?;
        *self
            .inner
            .controller_address
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;

        info!(adapter = %self.inner.info.id, "Interface closed");
        Ok(())
    }

    /// Whether the adapter is currently controller in charge.
    pub async fn is_open(&self) -> bool {
        self.inner.adapter.lock().await.is_open()
    }

    /// Identity of the underlying adapter.
    pub fn info(&self) -> &AdapterInfo {
        &self.inner.info
    }

    /// The address given to the last successful [`open`](Self::open), if still open.
    pub fn controller_address(&self) -> Option<PrimaryAddress> {
        *self
            .inner
            .controller_address
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle to the device at `primary_address`.
    ///
    /// Handles for the same address share their [`BusConfig`].
    pub fn get_instrument(&self, primary_address: u8) -> GpibResult<Instrument> {
        let address = PrimaryAddress::new(primary_address)?;
        let config = self
            .inner
            .instruments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(address)
            .or_insert_with(|| {
                debug!(adapter = %self.inner.info.id, address = %address, "New instrument");
                Arc::new(RwLock::new(BusConfig::default()))
            })
            .clone();

        Ok(Instrument::new(self.clone(), address, config))
    }

    /// Pulse IFC.
    pub async fn clear(&self) -> GpibResult<()> {
        let mut adapter = self.lock_open().await?;
        adapter.clear_interface().await?;
        debug!(adapter = %self.inner.info.id, "Interface cleared");
        Ok(())
    }

    /// Read the controller's status registers.
    pub async fn line_status(&self) -> GpibResult<LineStatus> {
        let mut adapter = self.lock_open().await?;
        adapter.line_status().await
    }

    /// True when both handles refer to the same adapter.
    pub fn same_adapter(&self, other: &Interface) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    async fn lock_open(&self) -> GpibResult<tokio::sync::MutexGuard<'_, Box<dyn GpibAdapter>>> {
        let adapter = self.inner.adapter.lock().await;
        if !adapter.is_open() {
            return Err(GpibError::NotOpen(self.inner.info.id.clone()));
        }
        Ok(adapter)
    }

    pub(crate) async fn write_to(
        &self,
        address: PrimaryAddress,
        data: &[u8],
        config: &BusConfig,
    ) -> GpibResult<()> {
        let mut adapter = self.lock_open().await?;
        adapter.write_msg(address, data, config).await
    }

    pub(crate) async fn read_from(
        &self,
        address: PrimaryAddress,
        config: &BusConfig,
    ) -> GpibResult<Vec<u8>> {
        let mut adapter = self.lock_open().await?;
        adapter.read_msg(address, config).await
    }

    /// Write then read without releasing the bus in between.
    pub(crate) async fn transact(
        &self,
        address: PrimaryAddress,
        data: &[u8],
        config: &BusConfig,
    ) -> GpibResult<Vec<u8>> {
        let mut adapter = self.lock_open().await?;
        adapter.write_msg(address, data, config).await?;
        adapter.read_msg(address, config).await
    }
}
