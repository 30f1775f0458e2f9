//! Adapter discovery across drivers
//!
//! The registry remembers every [`Interface`] it has handed out, keyed by
//! [`AdapterInfo::id`](super::AdapterInfo::id). Listing again returns the
//! same shared handle for an adapter that is still attached, so one physical
//! adapter is never driven through two independent handles.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use once_cell::sync::Lazy;
use tracing::{debug, warn};

use super::AdapterDriver;
use crate::error::{GpibError, GpibResult};
use crate::interface::Interface;

/// Set of adapter drivers plus the interfaces they have produced.
#[derive(Default)]
pub struct AdapterRegistry {
    drivers: Vec<Box<dyn AdapterDriver>>,
    known: Mutex<HashMap<String, Interface>>,
}

impl AdapterRegistry {
    /// Create a registry without drivers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a driver; adapters are listed in registration order.
    pub fn register(&mut self, driver: Box<dyn AdapterDriver>) {
        debug!(driver = driver.name(), "Registered adapter driver");
        self.drivers.push(driver);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_driver(mut self, driver: Box<dyn AdapterDriver>) -> Self {
        self.register(driver);
        self
    }

    /// Names of the registered drivers.
    pub fn driver_names(&self) -> Vec<&'static str> {
        self.drivers.iter().map(|d| d.name()).collect()
    }

    /// All adapters currently attached, across every driver.
    ///
    /// A driver that fails to enumerate is logged and skipped, unless every
    /// driver fails, in which case the first error is returned.
    pub fn list_adapters(&self) -> GpibResult<Vec<Interface>> {
        let mut found = Vec::new();
        let mut any_succeeded = false;
        let mut first_error = None;

        for driver in &self.drivers {
            match driver.list_adapters() {
                Ok(adapters) => {
                    any_succeeded = true;
                    found.extend(adapters);
                }
                Err(err) => {
                    warn!(driver = driver.name(), error = %err, "Adapter enumeration failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        if !any_succeeded {
            if let Some(err) = first_error {
                return Err(err);
            }
        }

        let mut known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
        let present: Vec<String> = found.iter().map(|a| a.info().id.clone()).collect();
        known.retain(|id, _| {
            let keep = present.contains(id);
            if !keep {
                debug!(adapter = %id, "Adapter is gone");
            }
            keep
        });

        Ok(found
            .into_iter()
            .map(|adapter| {
                let id = adapter.info().id.clone();
                known
                    .entry(id)
                    .or_insert_with(|| {
                        debug!(adapter = %adapter.info().describe(), "New adapter");
                        Interface::new(adapter)
                    })
                    .clone()
            })
            .collect())
    }
}

/// Registry used by the crate-level [`list_adapters`].
#[cfg(feature = "usb")]
pub fn default_registry() -> &'static AdapterRegistry {
    use std::sync::Arc;

    use super::Agilent82357ADriver;
    use crate::usb::NusbBackend;

    static REGISTRY: Lazy<AdapterRegistry> = Lazy::new(|| {
        AdapterRegistry::new()
            .with_driver(Box::new(Agilent82357ADriver::new(Arc::new(NusbBackend::new()))))
    });
    &REGISTRY
}

/// Registry used by the crate-level [`list_adapters`]. Empty without the `usb` feature.
#[cfg(not(feature = "usb"))]
pub fn default_registry() -> &'static AdapterRegistry {
    static REGISTRY: Lazy<AdapterRegistry> = Lazy::new(AdapterRegistry::new);
    &REGISTRY
}

/// List every supported USB-GPIB adapter attached to this machine.
///
/// Repeated calls return the same [`Interface`] for the same adapter.
pub fn list_adapters() -> GpibResult<Vec<Interface>> {
    if cfg!(not(feature = "usb")) {
        return Err(GpibError::FeatureNotEnabled("usb".to_string()));
    }
    default_registry().list_adapters()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::adapters::agilent_82357a::{Agilent82357ADriver, SimulatedBackend, Simulated82357A};
    use crate::adapters::GpibAdapter;

    struct FailingDriver;

    impl AdapterDriver for FailingDriver {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn list_adapters(&self) -> GpibResult<Vec<Box<dyn GpibAdapter>>> {
            Err(GpibError::NoAdapter)
        }
    }

    fn registry_over(backend: &SimulatedBackend) -> AdapterRegistry {
        AdapterRegistry::new().with_driver(Box::new(Agilent82357ADriver::new(Arc::new(
            backend.clone(),
        ))))
    }

    #[test]
    fn test_same_adapter_is_returned_once() {
        let backend = SimulatedBackend::new().with_device(Simulated82357A::new());
        let registry = registry_over(&backend);

        let first = registry.list_adapters().unwrap();
        let second = registry.list_adapters().unwrap();
        assert_eq!(first.len(), 1);
        assert!(first[0].same_adapter(&second[0]));
    }

    #[test]
    fn test_unplugged_adapter_is_dropped() {
        let backend = SimulatedBackend::new()
            .with_device(Simulated82357A::new())
            .with_device(Simulated82357A::new());
        let registry = registry_over(&backend);
        let before = registry.list_adapters().unwrap();
        assert_eq!(before.len(), 2);

        backend.unplug(&before[0].info().id);
        let after = registry.list_adapters().unwrap();
        assert_eq!(after.len(), 1);
        assert!(after[0].same_adapter(&before[1]));
    }

    #[test]
    fn test_failing_driver_is_skipped() {
        let backend = SimulatedBackend::new().with_device(Simulated82357A::new());
        let registry = registry_over(&backend).with_driver(Box::new(FailingDriver));
        assert_eq!(registry.driver_names(), vec!["agilent_82357a", "failing"]);
        assert_eq!(registry.list_adapters().unwrap().len(), 1);
    }

    #[test]
    fn test_all_drivers_failing_is_an_error() {
        let registry = AdapterRegistry::new().with_driver(Box::new(FailingDriver));
        assert!(matches!(
            registry.list_adapters(),
            Err(GpibError::NoAdapter)
        ));
    }

    #[test]
    fn test_empty_registry_lists_nothing() {
        assert!(AdapterRegistry::new().list_adapters().unwrap().is_empty());
    }
}
