//! [`ObjectRegistry`] – factory for the framework's core objects.
//!
//! Every core object has an [`ObjectKind`].  [`ObjectRegistry::create`]
//! builds a fresh instance of a kind from the collaborators configured on
//! the registry, and [`ObjectRegistry::release`] runs the matching
//! destructor.
//!
//! | Kind | Needs | Release |
//! |---|---|---|
//! | `DeviceManagerService` | device manager | drop |
//! | `DeviceServiceManager` | service manager | drop |
//! | `DeviceHostService` | [`with_host`](ObjectRegistry::with_host) | host teardown |
//! | `DriverInstaller` | [`with_installer`](ObjectRegistry::with_installer) | drop |
//! | `DriverLoader` | driver registry or custom loader | drop |
//! | `Device` | – | detach all nodes |
//! | `DeviceToken` | – | drop |
//! | `DeviceNode` | – | unlaunch |
//! | `RemoteService` | [`with_remote_service`](ObjectRegistry::with_remote_service) | drop |
//!
//! # Example
//!
//! ```
//! use hdf_core::object_registry::{HdfObject, ObjectKind, ObjectRegistry};
//!
//! let registry = ObjectRegistry::new().with_host(0, "sample_host");
//! let host = registry.create(ObjectKind::DeviceHostService).unwrap();
//! assert_eq!(host.kind(), ObjectKind::DeviceHostService);
//! registry.release(host);
//!
//! assert!(registry.create(ObjectKind::RemoteService).is_err());
//! ```

use std::fmt;
use std::sync::{Arc, Weak};

use hdf_power::PowerManager;
use hdf_types::{DevId, DeviceInfo, HdfError, HdfResult, ServiceObject};
use tracing::debug;

use crate::device::Device;
use crate::devmgr::{DeviceManager, DevmgrServiceClient, LocalDeviceManager};
use crate::driver::{DriverRegistry, ModuleInstaller};
use crate::host::{DeviceHostService, HostContext};
use crate::loader::{DriverLoader, StaticDriverLoader};
use crate::node::DeviceNode;
use crate::service_manager::{LocalServiceManager, ServiceManager};
use crate::token::DeviceToken;

/// Closed set of object kinds the registry can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    DeviceManagerService,
    DeviceServiceManager,
    DeviceHostService,
    DriverInstaller,
    DriverLoader,
    Device,
    DeviceToken,
    DeviceNode,
    RemoteService,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 9] = [
        ObjectKind::DeviceManagerService,
        ObjectKind::DeviceServiceManager,
        ObjectKind::DeviceHostService,
        ObjectKind::DriverInstaller,
        ObjectKind::DriverLoader,
        ObjectKind::Device,
        ObjectKind::DeviceToken,
        ObjectKind::DeviceNode,
        ObjectKind::RemoteService,
    ];
}

/// An object built by [`ObjectRegistry::create`].
pub enum HdfObject {
    DeviceManagerService(Arc<DevmgrServiceClient>),
    DeviceServiceManager(Arc<dyn ServiceManager>),
    DeviceHostService(Arc<DeviceHostService>),
    DriverInstaller(Arc<dyn ModuleInstaller>),
    DriverLoader(Arc<dyn DriverLoader>),
    Device(Arc<Device>),
    DeviceToken(DeviceToken),
    DeviceNode(Arc<DeviceNode>),
    RemoteService(ServiceObject),
}

impl HdfObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            HdfObject::DeviceManagerService(_) => ObjectKind::DeviceManagerService,
            HdfObject::DeviceServiceManager(_) => ObjectKind::DeviceServiceManager,
            HdfObject::DeviceHostService(_) => ObjectKind::DeviceHostService,
            HdfObject::DriverInstaller(_) => ObjectKind::DriverInstaller,
            HdfObject::DriverLoader(_) => ObjectKind::DriverLoader,
            HdfObject::Device(_) => ObjectKind::Device,
            HdfObject::DeviceToken(_) => ObjectKind::DeviceToken,
            HdfObject::DeviceNode(_) => ObjectKind::DeviceNode,
            HdfObject::RemoteService(_) => ObjectKind::RemoteService,
        }
    }

    pub fn into_host(self) -> Option<Arc<DeviceHostService>> {
        match self {
            HdfObject::DeviceHostService(host) => Some(host),
            _ => None,
        }
    }
}

impl fmt::Debug for HdfObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HdfObject").field(&self.kind()).finish()
    }
}

/// Builder-configured object factory.
pub struct ObjectRegistry {
    drivers: Arc<DriverRegistry>,
    devmgr: Arc<dyn DeviceManager>,
    service_manager: Arc<dyn ServiceManager>,
    installer: Option<Arc<dyn ModuleInstaller>>,
    loader: Option<Arc<dyn DriverLoader>>,
    power: Option<Arc<PowerManager>>,
    host: Option<(u8, String)>,
    remote_service: Option<ServiceObject>,
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self {
            drivers: Arc::new(DriverRegistry::new()),
            devmgr: Arc::new(LocalDeviceManager::new()),
            service_manager: Arc::new(LocalServiceManager::new()),
            installer: None,
            loader: None,
            power: None,
            host: None,
            remote_service: None,
        }
    }
}

impl ObjectRegistry {
    /// Registry with an empty driver table and in-process managers.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_drivers(mut self, drivers: Arc<DriverRegistry>) -> Self {
        if let Some(installer) = self.installer.as_ref() {
            drivers.set_installer(Arc::clone(installer));
        }
        self.drivers = drivers;
        self
    }

    pub fn with_device_manager(mut self, devmgr: Arc<dyn DeviceManager>) -> Self {
        self.devmgr = devmgr;
        self
    }

    pub fn with_service_manager(mut self, service_manager: Arc<dyn ServiceManager>) -> Self {
        self.service_manager = service_manager;
        self
    }

    /// Installer consulted by the driver registry on lookup misses.
    pub fn with_installer(mut self, installer: Arc<dyn ModuleInstaller>) -> Self {
        self.drivers.set_installer(Arc::clone(&installer));
        self.installer = Some(installer);
        self
    }

    /// Replace the default [`StaticDriverLoader`].
    pub fn with_loader(mut self, loader: Arc<dyn DriverLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Power manager for hosts.  Defaults to [`PowerManager::shared`].
    pub fn with_power_manager(mut self, power: Arc<PowerManager>) -> Self {
        self.power = Some(power);
        self
    }

    /// Identity of the host built for [`ObjectKind::DeviceHostService`].
    pub fn with_host(mut self, host_id: u8, host_name: impl Into<String>) -> Self {
        self.host = Some((host_id, host_name.into()));
        self
    }

    pub fn with_remote_service(mut self, service: ServiceObject) -> Self {
        self.remote_service = Some(service);
        self
    }

    pub fn drivers(&self) -> &Arc<DriverRegistry> {
        &self.drivers
    }

    /// Build a fresh object of `kind`.
    ///
    /// # Errors
    ///
    /// [`HdfError::NotFound`] when the kind's collaborator is not
    /// configured; errors from starting the shared power manager.
    pub fn create(&self, kind: ObjectKind) -> HdfResult<HdfObject> {
        let object = match kind {
            ObjectKind::DeviceManagerService => {
                HdfObject::DeviceManagerService(Arc::new(self.devmgr_client()))
            }
            ObjectKind::DeviceServiceManager => {
                HdfObject::DeviceServiceManager(Arc::clone(&self.service_manager))
            }
            ObjectKind::DeviceHostService => {
                let (host_id, host_name) = self
                    .host
                    .clone()
                    .ok_or_else(|| HdfError::NotFound("device host identity".into()))?;
                let ctx = HostContext {
                    devmgr: Arc::new(self.devmgr_client()),
                    service_manager: Arc::clone(&self.service_manager),
                    loader: self.loader(),
                    power: self.power()?,
                };
                HdfObject::DeviceHostService(DeviceHostService::new(host_id, host_name, ctx))
            }
            ObjectKind::DriverInstaller => HdfObject::DriverInstaller(
                self.installer
                    .clone()
                    .ok_or_else(|| HdfError::NotFound("driver installer".into()))?,
            ),
            ObjectKind::DriverLoader => HdfObject::DriverLoader(self.loader()),
            ObjectKind::Device => HdfObject::Device(Arc::new(Device::new(DevId::default()))),
            ObjectKind::DeviceToken => HdfObject::DeviceToken(DeviceToken::default()),
            ObjectKind::DeviceNode => HdfObject::DeviceNode(Arc::new(DeviceNode::new(
                &DeviceInfo::default(),
                Weak::new(),
            ))),
            ObjectKind::RemoteService => HdfObject::RemoteService(
                self.remote_service
                    .clone()
                    .ok_or_else(|| HdfError::NotFound("remote service".into()))?,
            ),
        };
        debug!(?kind, "object created");
        Ok(object)
    }

    /// Run the destructor matching `object`'s kind.
    pub fn release(&self, object: HdfObject) {
        let kind = object.kind();
        match object {
            HdfObject::DeviceHostService(host) => host.teardown(),
            HdfObject::Device(device) => device.detach_all(),
            HdfObject::DeviceNode(node) => node.unlaunch(),
            HdfObject::DeviceManagerService(_)
            | HdfObject::DeviceServiceManager(_)
            | HdfObject::DriverInstaller(_)
            | HdfObject::DriverLoader(_)
            | HdfObject::DeviceToken(_)
            | HdfObject::RemoteService(_) => {}
        }
        debug!(?kind, "object released");
    }

    fn devmgr_client(&self) -> DevmgrServiceClient {
        DevmgrServiceClient::new(Arc::clone(&self.devmgr))
    }

    fn loader(&self) -> Arc<dyn DriverLoader> {
        match self.loader.as_ref() {
            Some(loader) => Arc::clone(loader),
            None => Arc::new(StaticDriverLoader::new(Arc::clone(&self.drivers))),
        }
    }

    fn power(&self) -> HdfResult<Arc<PowerManager>> {
        match self.power.as_ref() {
            Some(power) => Ok(Arc::clone(power)),
            None => PowerManager::shared(),
        }
    }
}
