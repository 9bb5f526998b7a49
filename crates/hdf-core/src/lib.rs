//! `hdf-core` – device host runtime of the driver framework.
//!
//! Loads drivers into device nodes, publishes their services, and routes
//! power events down the device tree.
//!
//! # Modules
//!
//! - [`object_registry`] – [`ObjectRegistry`][object_registry::ObjectRegistry]:
//!   closed-enum factory for every core object kind.
//! - [`driver`] – [`DriverEntry`][driver::DriverEntry] and the
//!   [`DriverRegistry`][driver::DriverRegistry] with installer fallback.
//! - [`loader`] – the [`DriverLoader`][loader::DriverLoader] seam.
//! - [`device_object`] – the driver-facing
//!   [`DeviceObject`][device_object::DeviceObject].
//! - [`node`] – [`DeviceNode`][node::DeviceNode] launch / unlaunch and
//!   service publication.
//! - [`device`] – [`Device`][device::Device]: node id allocation and the
//!   node list.
//! - [`host`] – [`DeviceHostService`][host::DeviceHostService].
//! - [`devmgr`] – device manager client and the in-process manager.
//! - [`service_manager`] – external service directory seam.
//! - [`token`] – [`DeviceToken`][token::DeviceToken].
//! - [`sim`] – [`SimHost`][sim::SimHost]: stub-driven host for tests and CI.

pub mod device;
pub mod device_object;
pub mod devmgr;
pub mod driver;
pub mod host;
pub mod loader;
pub mod node;
pub mod object_registry;
pub mod service_manager;
pub mod sim;
pub mod token;

pub use device::Device;
pub use device_object::DeviceObject;
pub use devmgr::{DeviceManager, DevmgrServiceClient, LocalDeviceManager};
pub use driver::{DriverEntry, DriverHandle, DriverRegistry, ModuleInstaller};
pub use host::{DeviceHostService, HostContext, PowerSweep};
pub use loader::{DriverLoader, StaticDriverLoader};
pub use node::DeviceNode;
pub use object_registry::{HdfObject, ObjectKind, ObjectRegistry};
pub use service_manager::{LocalServiceManager, ServiceManager};
pub use token::DeviceToken;
