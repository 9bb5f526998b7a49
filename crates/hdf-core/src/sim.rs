//! [`SimHost`] – in-process device host for tests and CI.
//!
//! Wires a [`DeviceHostService`] to a [`LocalDeviceManager`], a
//! [`LocalServiceManager`] and a dedicated [`PowerManager`], and registers
//! stub drivers that need no hardware.
//!
//! # Stub driver behaviour
//!
//! | Entry point | Behaviour |
//! |---|---|
//! | `bind` | exposes a [`StubService`] carrying the module name and node id |
//! | `init` | succeeds |
//! | `release` | nothing to undo |
//!
//! # Example
//!
//! ```rust
//! use hdf_core::service_manager::ServiceManager;
//! use hdf_core::sim::SimHost;
//! use hdf_types::{DevId, DeviceInfo, ServicePolicy};
//!
//! let bench = SimHost::builder().with_stub_driver("sample").build().unwrap();
//! let id = bench
//!     .host
//!     .add_device(
//!         &DeviceInfo::new(DevId::new(0, 1, 0), "sample")
//!             .with_service("sample_service", ServicePolicy::Public),
//!     )
//!     .unwrap();
//!
//! assert_eq!(id, DevId::new(0, 1, 1));
//! assert!(bench.services.get_service("sample_service").is_some());
//! ```

use std::sync::Arc;

use hdf_power::PowerManager;
use hdf_types::{DevId, HdfError, HdfResult};

use crate::devmgr::LocalDeviceManager;
use crate::driver::{DriverEntry, DriverRegistry};
use crate::host::DeviceHostService;
use crate::object_registry::{ObjectKind, ObjectRegistry};
use crate::service_manager::{LocalServiceManager, ServiceManager};

/// Service object exposed by stub drivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubService {
    pub module: String,
    pub dev_id: DevId,
}

/// Driver entry that binds a [`StubService`] and initialises successfully.
pub fn stub_driver(module_name: &str) -> DriverEntry {
    let module = module_name.to_string();
    DriverEntry::new(module_name)
        .with_bind(move |obj| {
            obj.set_service_value(StubService {
                module: module.clone(),
                dev_id: obj.dev_id(),
            });
            Ok(())
        })
        .with_init(|_obj| Ok(()))
        .with_release(|_obj| {})
}

/// A started host plus handles on everything it is wired to.
pub struct SimBench {
    pub host: Arc<DeviceHostService>,
    pub drivers: Arc<DriverRegistry>,
    pub devmgr: Arc<LocalDeviceManager>,
    pub services: Arc<LocalServiceManager>,
    pub power: Arc<PowerManager>,
}

/// Builder for a [`SimBench`].
pub struct SimHost {
    host_id: u8,
    host_name: String,
    drivers: Vec<DriverEntry>,
}

impl Default for SimHost {
    fn default() -> Self {
        Self {
            host_id: 0,
            host_name: "sim_host".to_string(),
            drivers: Vec::new(),
        }
    }
}

impl SimHost {
    pub fn builder() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host_id: u8, host_name: impl Into<String>) -> Self {
        self.host_id = host_id;
        self.host_name = host_name.into();
        self
    }

    /// Register a [`stub_driver`] under `module_name`.
    pub fn with_stub_driver(mut self, module_name: &str) -> Self {
        self.drivers.push(stub_driver(module_name));
        self
    }

    /// Register a custom driver entry.
    pub fn with_driver(mut self, entry: DriverEntry) -> Self {
        self.drivers.push(entry);
        self
    }

    /// Register the drivers, create the host through an
    /// [`ObjectRegistry`] and start it.
    pub fn build(self) -> HdfResult<SimBench> {
        let drivers = Arc::new(DriverRegistry::new());
        for entry in self.drivers {
            drivers.register(entry)?;
        }
        let devmgr = Arc::new(LocalDeviceManager::new());
        let services = Arc::new(LocalServiceManager::new());
        let power = Arc::new(PowerManager::start()?);

        let registry = ObjectRegistry::new()
            .with_drivers(Arc::clone(&drivers))
            .with_device_manager(devmgr.clone())
            .with_service_manager(services.clone() as Arc<dyn ServiceManager>)
            .with_power_manager(Arc::clone(&power))
            .with_host(self.host_id, self.host_name);
        let host = registry
            .create(ObjectKind::DeviceHostService)?
            .into_host()
            .ok_or_else(|| HdfError::InvalidObject("registry built a non-host object".into()))?;
        host.start_service()?;

        Ok(SimBench {
            host,
            drivers,
            devmgr,
            services,
            power,
        })
    }
}
