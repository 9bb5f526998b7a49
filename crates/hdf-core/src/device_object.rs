//! [`DeviceObject`] – the driver-facing view of a device node.
//!
//! Every driver callback receives a `&DeviceObject`.  Through it a driver
//! exposes its service, subscribes to other services in the same host,
//! registers power callbacks, takes wake locks and allocates child nodes.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use hdf_power::{PowerManager, PowerRequest, PowerStateListener, PowerStateToken};
use hdf_types::{DevId, DeviceClass, HdfError, HdfResult, PowerMode, ServiceObject};
use tracing::debug;

use crate::host::DeviceHostService;
use crate::node::DeviceNode;

pub struct DeviceObject {
    dev_id: DevId,
    service_name: String,
    device_class: DeviceClass,
    match_attr: String,
    service: Mutex<Option<ServiceObject>>,
    power_token: Mutex<Option<Arc<PowerStateToken>>>,
    host: Weak<DeviceHostService>,
}

impl DeviceObject {
    pub(crate) fn new(
        dev_id: DevId,
        service_name: String,
        device_class: DeviceClass,
        match_attr: String,
        host: Weak<DeviceHostService>,
    ) -> Self {
        Self {
            dev_id,
            service_name,
            device_class,
            match_attr,
            service: Mutex::new(None),
            power_token: Mutex::new(None),
            host,
        }
    }

    pub fn dev_id(&self) -> DevId {
        self.dev_id
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn device_class(&self) -> DeviceClass {
        self.device_class
    }

    /// Key into the external device-tree data for this node.
    pub fn match_attr(&self) -> &str {
        &self.match_attr
    }

    pub(crate) fn set_dev_id(&mut self, dev_id: DevId) {
        self.dev_id = dev_id;
    }

    pub(crate) fn set_service_name(&mut self, name: String) {
        self.service_name = name;
    }

    /// The host this node lives in, while it is alive.
    pub fn host(&self) -> Option<Arc<DeviceHostService>> {
        self.host.upgrade()
    }

    // ── service ─────────────────────────────────────────────────────────────

    /// Expose `service` as this node's service object.  Normally done from
    /// the driver's `bind`.
    pub fn set_service(&self, service: ServiceObject) {
        *self.service.lock().unwrap_or_else(|e| e.into_inner()) = Some(service);
    }

    /// Convenience wrapper around [`DeviceObject::set_service`].
    pub fn set_service_value<T: Any + Send + Sync>(&self, value: T) {
        self.set_service(Arc::new(value));
    }

    pub fn service(&self) -> Option<ServiceObject> {
        self.service
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn clear_service(&self) {
        self.service.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Ask to be called back with the service published as `name` in this
    /// host.  Runs immediately when it is already visible to this node.
    pub fn subscribe_service<F>(&self, name: &str, callback: F) -> HdfResult<()>
    where
        F: Fn(&ServiceObject) -> HdfResult<()> + Send + Sync + 'static,
    {
        let host = self.require_host()?;
        host.observer().subscribe(name, self.dev_id, callback)
    }

    // ── power ───────────────────────────────────────────────────────────────

    /// Attach a power listener to this node.  Only one listener per node.
    pub fn register_power_listener(&self, listener: Arc<dyn PowerStateListener>) -> HdfResult<()> {
        let mut token = self.power_token.lock().unwrap_or_else(|e| e.into_inner());
        if token.is_some() {
            return Err(HdfError::Failure(format!(
                "{} already has a power listener",
                self.dev_id
            )));
        }
        *token = Some(Arc::new(PowerStateToken::new(self.dev_id, listener)));
        debug!(dev_id = %self.dev_id, "power listener registered");
        Ok(())
    }

    pub fn unregister_power_listener(&self) {
        if self
            .power_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some()
        {
            debug!(dev_id = %self.dev_id, "power listener unregistered");
        }
    }

    pub fn power_token(&self) -> Option<Arc<PowerStateToken>> {
        self.power_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Take a wake lock synchronously.  No-op without a power listener.
    pub fn acquire_wake_lock(&self) {
        if let Some(token) = self.power_token() {
            token.acquire_wake_lock();
        }
    }

    /// Drop a wake lock synchronously.  No-op without a power listener.
    pub fn release_wake_lock(&self) {
        if let Some(token) = self.power_token() {
            token.release_wake_lock();
        }
    }

    /// Queue a wake-lock acquire on the host's power manager.
    pub fn acquire_wake_lock_async(&self) -> HdfResult<()> {
        self.queue_power_request(PowerRequest::Acquire)
    }

    /// Queue a wake-lock release on the host's power manager.
    pub fn release_wake_lock_async(&self) -> HdfResult<()> {
        self.queue_power_request(PowerRequest::Release)
    }

    pub fn set_power_mode(&self, mode: PowerMode) -> HdfResult<()> {
        let token = self.power_token().ok_or_else(|| {
            HdfError::Failure(format!("{} has no power listener", self.dev_id))
        })?;
        token.set_mode(mode);
        Ok(())
    }

    fn queue_power_request(&self, request: PowerRequest) -> HdfResult<()> {
        let Some(token) = self.power_token() else {
            return Ok(());
        };
        let manager = match self.host() {
            Some(host) => Arc::clone(host.power_manager()),
            None => PowerManager::shared()?,
        };
        manager.request(&token, request)
    }

    // ── children ────────────────────────────────────────────────────────────

    /// Allocate an unattached node on this node's device, bound to
    /// `module_name`.  Finish it with `DeviceHostService::register_device_node`.
    pub fn alloc_child(&self, module_name: &str) -> HdfResult<DeviceNode> {
        let host = self.require_host()?;
        host.alloc_device_node(self, module_name)
    }

    fn require_host(&self) -> HdfResult<Arc<DeviceHostService>> {
        self.host()
            .ok_or_else(|| HdfError::InvalidObject(format!("{} is not in a live host", self.dev_id)))
    }
}

impl fmt::Debug for DeviceObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceObject")
            .field("dev_id", &self.dev_id)
            .field("service_name", &self.service_name)
            .field("device_class", &self.device_class)
            .field("has_service", &self.service().is_some())
            .field("has_power_token", &self.power_token().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hdf_types::PowerTokenState;

    struct Quiet;
    impl PowerStateListener for Quiet {}

    fn orphan() -> DeviceObject {
        DeviceObject::new(
            DevId::new(0, 1, 1),
            "svc".into(),
            DeviceClass::Default,
            String::new(),
            Weak::new(),
        )
    }

    #[test]
    fn service_value_roundtrips() {
        let obj = orphan();
        assert!(obj.service().is_none());
        obj.set_service_value(17u16);
        let svc = obj.service().unwrap();
        assert_eq!(svc.downcast_ref::<u16>(), Some(&17));
        obj.clear_service();
        assert!(obj.service().is_none());
    }

    #[test]
    fn single_power_listener_per_node() {
        let obj = orphan();
        obj.register_power_listener(Arc::new(Quiet)).unwrap();
        let err = obj.register_power_listener(Arc::new(Quiet)).unwrap_err();
        assert!(matches!(err, HdfError::Failure(_)));

        obj.unregister_power_listener();
        assert!(obj.power_token().is_none());
        obj.register_power_listener(Arc::new(Quiet)).unwrap();
    }

    #[test]
    fn wake_locks_follow_power_mode() {
        let obj = orphan();
        // No token: everything is a quiet no-op except mode changes.
        obj.acquire_wake_lock();
        assert!(obj.acquire_wake_lock_async().is_ok());
        assert!(matches!(
            obj.set_power_mode(PowerMode::DynamicControlled),
            Err(HdfError::Failure(_))
        ));

        obj.register_power_listener(Arc::new(Quiet)).unwrap();
        obj.set_power_mode(PowerMode::DynamicControlled).unwrap();
        obj.acquire_wake_lock();
        let token = obj.power_token().unwrap();
        assert_eq!(token.wake_ref_count(), 1);
        assert_eq!(token.state(), PowerTokenState::Active);
        obj.release_wake_lock();
        assert_eq!(token.state(), PowerTokenState::Inactive);
    }

    #[test]
    fn hostless_object_cannot_subscribe() {
        let obj = orphan();
        let err = obj.subscribe_service("other", |_svc| Ok(())).unwrap_err();
        assert!(matches!(err, HdfError::InvalidObject(_)));
        assert!(obj.alloc_child("child").is_err());
    }
}
