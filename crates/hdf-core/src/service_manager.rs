//! External service manager seam.
//!
//! Nodes with a public or capability-scoped policy register their service
//! here in addition to the host's local observer.  [`LocalServiceManager`]
//! is the in-process implementation used by single-process deployments and
//! tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use hdf_types::{DeviceClass, HdfError, HdfResult, ServiceObject};
use tracing::debug;

/// System-wide service directory.
pub trait ServiceManager: Send + Sync {
    fn add_service(
        &self,
        name: &str,
        class: DeviceClass,
        service: &ServiceObject,
        info: &str,
    ) -> HdfResult<()>;

    fn update_service(
        &self,
        name: &str,
        class: DeviceClass,
        service: &ServiceObject,
        info: &str,
    ) -> HdfResult<()>;

    /// Withdraw `name`.  Unknown names are not an error.
    fn remove_service(&self, name: &str) -> HdfResult<()>;

    fn get_service(&self, name: &str) -> Option<ServiceObject>;
}

struct ServiceEntry {
    class: DeviceClass,
    service: ServiceObject,
    info: String,
}

/// In-process [`ServiceManager`].
#[derive(Default)]
pub struct LocalServiceManager {
    services: Mutex<HashMap<String, ServiceEntry>>,
}

impl LocalServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered service names, sorted.
    pub fn list_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn service_class(&self, name: &str) -> Option<DeviceClass> {
        self.lock().get(name).map(|e| e.class)
    }

    pub fn service_info(&self, name: &str) -> Option<String> {
        self.lock().get(name).map(|e| e.info.clone())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ServiceEntry>> {
        self.services.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ServiceManager for LocalServiceManager {
    fn add_service(
        &self,
        name: &str,
        class: DeviceClass,
        service: &ServiceObject,
        info: &str,
    ) -> HdfResult<()> {
        let mut services = self.lock();
        if services.contains_key(name) {
            return Err(HdfError::Failure(format!("service '{name}' already registered")));
        }
        services.insert(
            name.to_string(),
            ServiceEntry {
                class,
                service: ServiceObject::clone(service),
                info: info.to_string(),
            },
        );
        debug!(service = name, ?class, "service added");
        Ok(())
    }

    fn update_service(
        &self,
        name: &str,
        class: DeviceClass,
        service: &ServiceObject,
        info: &str,
    ) -> HdfResult<()> {
        let mut services = self.lock();
        let entry = services
            .get_mut(name)
            .ok_or_else(|| HdfError::NotFound(format!("service '{name}'")))?;
        entry.class = class;
        entry.service = ServiceObject::clone(service);
        entry.info = info.to_string();
        debug!(service = name, "service updated");
        Ok(())
    }

    fn remove_service(&self, name: &str) -> HdfResult<()> {
        if self.lock().remove(name).is_some() {
            debug!(service = name, "service removed");
        }
        Ok(())
    }

    fn get_service(&self, name: &str) -> Option<ServiceObject> {
        self.lock().get(name).map(|e| ServiceObject::clone(&e.service))
    }
}

impl fmt::Debug for LocalServiceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalServiceManager")
            .field("services", &self.list_services())
            .finish()
    }
}
