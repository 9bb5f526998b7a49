//! [`DeviceNode`] – one driver instance bound to one structured identifier.
//!
//! # Lifecycle
//!
//! ```text
//!   new ──► Inited ──launch──► Launched ──unlaunch──► Inited
//!                     │
//!                     └─ failure ─► None
//! ```
//!
//! # Launch sequence
//!
//! | Step | Failure |
//! |---|---|
//! | driver bound and has `init` | [`HdfError::InvalidParam`] |
//! | `bind` present when the policy is public / capability-scoped | [`HdfError::InvalidObject`] |
//! | `bind(object)` if present | [`HdfError::DevInitFail`] |
//! | `init(object)` | [`HdfError::DevInitFail`] |
//! | publish service per policy | [`HdfError::PublishFail`] |
//! | attach token with the device manager | [`HdfError::AttachDevFail`] |
//!
//! A failed launch releases the driver (when `init` already ran), removes
//! any publication, drops the power token, returns the driver to the loader
//! and leaves the node in [`DeviceState::None`].  Unlaunch undoes the same
//! steps and leaves the node in [`DeviceState::Inited`].

use std::fmt;
use std::sync::{Mutex, MutexGuard, Weak};

use hdf_types::{DevId, DeviceInfo, DeviceState, HdfError, HdfResult, ServicePolicy};
use tracing::{debug, info, instrument, warn};

use crate::device_object::DeviceObject;
use crate::driver::DriverHandle;
use crate::host::DeviceHostService;
use crate::token::DeviceToken;

struct NodeState {
    status: DeviceState,
    driver: Option<DriverHandle>,
    /// Registered with the external service manager.
    published: bool,
    /// Published on the host observer.
    local_published: bool,
    service_info: String,
}

pub struct DeviceNode {
    object: DeviceObject,
    token: DeviceToken,
    module_name: String,
    policy: ServicePolicy,
    permission: u16,
    state: Mutex<NodeState>,
}

impl DeviceNode {
    /// Build an unattached node from a load description.
    pub fn new(info: &DeviceInfo, host: Weak<DeviceHostService>) -> Self {
        Self {
            object: DeviceObject::new(
                info.dev_id,
                info.service_name.clone(),
                info.device_class,
                info.match_attr.clone(),
                host,
            ),
            token: DeviceToken::new(info.dev_id),
            module_name: info.module_name.clone(),
            policy: info.policy,
            permission: info.permission,
            state: Mutex::new(NodeState {
                status: DeviceState::Inited,
                driver: None,
                published: false,
                local_published: false,
                service_info: info.service_info.clone(),
            }),
        }
    }

    pub fn with_driver(self, driver: DriverHandle) -> Self {
        self.lock().driver = Some(driver);
        self
    }

    /// Change how the node publishes its service.  Only meaningful before
    /// the node is attached.
    pub fn set_service_policy(&mut self, service_name: impl Into<String>, policy: ServicePolicy) {
        self.object.set_service_name(service_name.into());
        self.policy = policy;
    }

    /// Move the node (and its token) to `dev_id`.
    pub(crate) fn assign_dev_id(&mut self, dev_id: DevId) {
        self.object.set_dev_id(dev_id);
        self.token.set_dev_id(dev_id);
    }

    pub fn dev_id(&self) -> DevId {
        self.object.dev_id()
    }

    pub fn object(&self) -> &DeviceObject {
        &self.object
    }

    pub fn token(&self) -> DeviceToken {
        self.token
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn policy(&self) -> ServicePolicy {
        self.policy
    }

    pub fn permission(&self) -> u16 {
        self.permission
    }

    pub fn status(&self) -> DeviceState {
        self.lock().status
    }

    pub fn driver(&self) -> Option<DriverHandle> {
        self.lock().driver.clone()
    }

    pub fn is_published(&self) -> bool {
        let state = self.lock();
        state.published || state.local_published
    }

    // ── lifecycle ───────────────────────────────────────────────────────────

    /// Run the driver and publish its service.
    ///
    /// # Errors
    ///
    /// See the module-level table.  Launching a node that is already
    /// launched yields [`HdfError::DeviceBusy`].
    #[instrument(skip(self), fields(dev_id = %self.dev_id(), module = %self.module_name))]
    pub fn launch(&self) -> HdfResult<()> {
        let driver = {
            let mut state = self.lock();
            if state.status == DeviceState::Launched {
                return Err(HdfError::DeviceBusy(self.dev_id()));
            }
            let Some(driver) = state.driver.clone() else {
                state.status = DeviceState::None;
                return Err(HdfError::InvalidParam(format!(
                    "{} has no driver bound",
                    self.dev_id()
                )));
            };
            state.status = DeviceState::Launched;
            driver
        };

        let mut init_ran = false;
        match self.run_launch(&driver, &mut init_ran) {
            Ok(()) => {
                info!(service = self.object.service_name(), "device node launched");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "device node launch failed, rolling back");
                if init_ran {
                    if let Some(release) = driver.release.as_ref() {
                        release(&self.object);
                    }
                }
                if let Err(remove_err) = self.remove_service() {
                    warn!(error = %remove_err, "service removal during rollback failed");
                }
                self.object.clear_service();
                self.object.unregister_power_listener();
                self.reclaim_driver();
                self.lock().status = DeviceState::None;
                Err(e)
            }
        }
    }

    fn run_launch(&self, driver: &DriverHandle, init_ran: &mut bool) -> HdfResult<()> {
        let dev_id = self.dev_id();
        let Some(init) = driver.init.as_ref() else {
            return Err(HdfError::InvalidParam(format!(
                "driver '{}' has no init entry",
                driver.module_name()
            )));
        };
        if self.policy.is_external() && driver.bind.is_none() {
            return Err(HdfError::InvalidObject(format!(
                "driver '{}' must provide bind for policy {:?}",
                driver.module_name(),
                self.policy
            )));
        }
        if let Some(bind) = driver.bind.as_ref() {
            bind(&self.object).map_err(|e| HdfError::DevInitFail {
                dev_id,
                details: format!("bind: {e}"),
            })?;
        }
        *init_ran = true;
        init(&self.object).map_err(|e| HdfError::DevInitFail {
            dev_id,
            details: format!("init: {e}"),
        })?;

        self.publish_service()?;

        if let Some(host) = self.object.host() {
            host.device_manager()
                .attach_device(&self.token)
                .map_err(|e| HdfError::AttachDevFail {
                    dev_id,
                    details: e.to_string(),
                })?;
        }
        Ok(())
    }

    /// Stop the driver and withdraw its service.  A node that is not
    /// launched is left untouched.
    pub fn unlaunch(&self) {
        let driver = {
            let mut state = self.lock();
            if state.status != DeviceState::Launched {
                return;
            }
            state.driver.clone()
        };
        let dev_id = self.dev_id();

        if let Some(release) = driver.as_ref().and_then(|d| d.release.as_ref()) {
            release(&self.object);
        }
        if let Err(e) = self.remove_service() {
            warn!(%dev_id, error = %e, "service removal failed");
        }
        self.object.clear_service();
        self.object.unregister_power_listener();
        if let Some(host) = self.object.host() {
            if let Err(e) = host.device_manager().detach_device(dev_id) {
                warn!(%dev_id, error = %e, "device manager detach failed");
            }
        }
        self.reclaim_driver();
        self.lock().status = DeviceState::Inited;
        info!(%dev_id, module = %self.module_name, "device node unlaunched");
    }

    // ── service publication ─────────────────────────────────────────────────

    /// Publish the node's service according to its policy.
    ///
    /// `None` and an empty service name publish nothing.  Public and
    /// capability-scoped services go to the external service manager first,
    /// then to the host observer.
    pub fn publish_service(&self) -> HdfResult<()> {
        let name = self.object.service_name();
        if !self.policy.publishes() || name.is_empty() {
            return Ok(());
        }
        let publish_fail = |details: String| HdfError::PublishFail {
            service: name.to_string(),
            details,
        };
        let service = self
            .object
            .service()
            .ok_or_else(|| publish_fail("driver did not expose a service object".into()))?;
        let host = self
            .object
            .host()
            .ok_or_else(|| publish_fail("host is gone".into()))?;

        if self.policy.is_external() {
            let info = self.lock().service_info.clone();
            host.service_manager()
                .add_service(name, self.object.device_class(), &service, &info)
                .map_err(|e| publish_fail(e.to_string()))?;
            self.lock().published = true;
        }
        host.observer()
            .publish(name, self.dev_id(), self.policy, service)
            .map_err(|e| publish_fail(e.to_string()))?;
        self.lock().local_published = true;
        debug!(service = name, dev_id = %self.dev_id(), policy = ?self.policy, "service published");
        Ok(())
    }

    /// Withdraw whatever [`DeviceNode::publish_service`] published.
    ///
    /// Only this node's publication leaves the host observer; drivers
    /// subscribed to the name stay subscribed.  Each published flag is
    /// cleared once its removal went through, so a failed call can be
    /// retried.  Repeated calls succeed.
    pub fn remove_service(&self) -> HdfResult<()> {
        let (published, local_published) = {
            let state = self.lock();
            (state.published, state.local_published)
        };
        if !published && !local_published {
            return Ok(());
        }
        let Some(host) = self.object.host() else {
            let mut state = self.lock();
            state.published = false;
            state.local_published = false;
            return Ok(());
        };
        let name = self.object.service_name();
        if published {
            host.service_manager().remove_service(name)?;
            self.lock().published = false;
        }
        if local_published {
            host.observer().withdraw(name, self.dev_id());
            self.lock().local_published = false;
        }
        debug!(service = name, dev_id = %self.dev_id(), "service withdrawn");
        Ok(())
    }

    /// Replace the service info string and push it to the external service
    /// manager when the service is registered there.
    pub fn update_service(&self, info: &str) -> HdfResult<()> {
        let published = {
            let mut state = self.lock();
            state.service_info = info.to_string();
            state.published
        };
        if !published {
            return Ok(());
        }
        let service = self.object.service().ok_or_else(|| {
            HdfError::InvalidObject(format!("{} has no service object", self.dev_id()))
        })?;
        let host = self
            .object
            .host()
            .ok_or_else(|| HdfError::InvalidObject(format!("{} has no host", self.dev_id())))?;
        host.service_manager().update_service(
            self.object.service_name(),
            self.object.device_class(),
            &service,
            info,
        )
    }

    /// Hand the bound driver back to the host's loader.
    pub(crate) fn reclaim_driver(&self) {
        let Some(driver) = self.lock().driver.take() else {
            return;
        };
        if let Some(host) = self.object.host() {
            host.loader().reclaim_driver(driver);
        }
    }

    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for DeviceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceNode")
            .field("dev_id", &self.dev_id())
            .field("module_name", &self.module_name)
            .field("policy", &self.policy)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverEntry, DriverRegistry};
    use crate::object_registry::{ObjectKind, ObjectRegistry};
    use crate::service_manager::{LocalServiceManager, ServiceManager};
    use crate::sim::{SimHost, stub_driver};
    use hdf_observer::SubscriberState;
    use hdf_types::{DeviceClass, ServiceObject};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn info(device: u16, module: &str) -> DeviceInfo {
        DeviceInfo::new(DevId::new(0, device, 1), module)
    }

    #[test]
    fn node_without_driver_fails_with_invalid_param() {
        let node = DeviceNode::new(&info(1, "none"), Weak::new());
        assert_eq!(node.status(), DeviceState::Inited);
        let err = node.launch().unwrap_err();
        assert!(matches!(err, HdfError::InvalidParam(_)));
        assert_eq!(node.status(), DeviceState::None);
    }

    #[test]
    fn driver_without_init_fails_with_invalid_param() {
        let node = DeviceNode::new(&info(1, "no_init"), Weak::new())
            .with_driver(Arc::new(DriverEntry::new("no_init")));
        assert!(matches!(node.launch(), Err(HdfError::InvalidParam(_))));
        assert!(node.driver().is_none(), "driver is reclaimed on failure");
    }

    #[test]
    fn public_policy_requires_bind() {
        let entry = DriverEntry::new("nobind").with_init(|_obj| Ok(()));
        let node = DeviceNode::new(
            &info(1, "nobind").with_service("nobind_svc", ServicePolicy::Public),
            Weak::new(),
        )
        .with_driver(Arc::new(entry));
        assert!(matches!(node.launch(), Err(HdfError::InvalidObject(_))));
    }

    #[test]
    fn init_failure_releases_driver() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let entry = DriverEntry::new("bad_init")
            .with_init(|obj| Err(HdfError::Failure(format!("{} refuses", obj.dev_id()))))
            .with_release(move |_obj| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        let node = DeviceNode::new(&info(1, "bad_init"), Weak::new()).with_driver(Arc::new(entry));

        let err = node.launch().unwrap_err();
        assert!(matches!(err, HdfError::DevInitFail { .. }));
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(node.status(), DeviceState::None);
    }

    #[test]
    fn bind_failure_does_not_release() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let entry = DriverEntry::new("bad_bind")
            .with_bind(|_obj| Err(HdfError::NoMemory("bind".into())))
            .with_init(|_obj| Ok(()))
            .with_release(move |_obj| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        let node = DeviceNode::new(&info(1, "bad_bind"), Weak::new()).with_driver(Arc::new(entry));

        assert!(matches!(node.launch(), Err(HdfError::DevInitFail { .. })));
        assert_eq!(released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn publishing_policy_requires_service_object() {
        let bench = SimHost::builder()
            .with_driver(DriverEntry::new("silent").with_bind(|_obj| Ok(())).with_init(|_obj| Ok(())))
            .build()
            .unwrap();
        let err = bench
            .host
            .add_device(&info(3, "silent").with_service("silent_svc", ServicePolicy::Public))
            .unwrap_err();
        assert!(matches!(err, HdfError::PublishFail { .. }));
        assert!(bench.services.get_service("silent_svc").is_none());
        assert!(bench.host.node(DevId::new(0, 3, 1)).is_none());
    }

    #[test]
    fn public_service_reaches_both_directories() {
        let bench = SimHost::builder().with_stub_driver("stub").build().unwrap();
        let dev_id = bench
            .host
            .add_device(&info(4, "stub").with_service("stub_svc", ServicePolicy::Public))
            .unwrap();

        let node = bench.host.node(dev_id).unwrap();
        assert_eq!(node.status(), DeviceState::Launched);
        assert!(node.is_published());
        assert!(bench.services.get_service("stub_svc").is_some());
        assert!(bench.host.observer().is_published("stub_svc"));
        assert!(bench.devmgr.is_attached(dev_id));

        node.unlaunch();
        assert_eq!(node.status(), DeviceState::Inited);
        assert!(bench.services.get_service("stub_svc").is_none());
        assert!(!bench.host.observer().is_published("stub_svc"));
        assert!(!bench.devmgr.is_attached(dev_id));
        assert!(node.remove_service().is_ok());
    }

    #[test]
    fn private_service_stays_local() {
        let bench = SimHost::builder().with_stub_driver("stub").build().unwrap();
        bench
            .host
            .add_device(&info(5, "stub").with_service("private_svc", ServicePolicy::Private))
            .unwrap();
        assert!(bench.host.observer().is_published("private_svc"));
        assert!(bench.services.get_service("private_svc").is_none());
    }

    #[test]
    fn update_service_pushes_info_when_external() {
        let bench = SimHost::builder().with_stub_driver("stub").build().unwrap();
        let dev_id = bench
            .host
            .add_device(&info(6, "stub").with_service("info_svc", ServicePolicy::Capacity))
            .unwrap();
        bench.host.update_service(dev_id, "v2").unwrap();
        assert_eq!(bench.services.service_info("info_svc").as_deref(), Some("v2"));
    }

    #[test]
    fn attach_refusal_rolls_back_publication() {
        let bench = SimHost::builder().with_stub_driver("stub").build().unwrap();
        let dev_id = DevId::new(0, 7, 1);
        // Occupy the token slot so the device manager refuses the attach.
        use crate::devmgr::DeviceManager;
        bench.devmgr.attach_device(&DeviceToken::new(dev_id)).unwrap();

        let err = bench
            .host
            .add_device(&info(7, "stub").with_service("busy_svc", ServicePolicy::Public))
            .unwrap_err();
        assert!(matches!(err, HdfError::AttachDevFail { .. }));
        assert!(bench.services.get_service("busy_svc").is_none());
        assert!(!bench.host.observer().is_published("busy_svc"));
    }

    fn consumer_driver(service: &'static str, hits: &Arc<AtomicUsize>) -> DriverEntry {
        let hits = Arc::clone(hits);
        DriverEntry::new("consumer").with_init(move |obj| {
            let hits = Arc::clone(&hits);
            obj.subscribe_service(service, move |_svc: &ServiceObject| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[test]
    fn provider_restart_renotifies_earlier_subscriber() {
        let hits = Arc::new(AtomicUsize::new(0));
        let bench = SimHost::builder()
            .with_stub_driver("stub")
            .with_driver(consumer_driver("provider_svc", &hits))
            .build()
            .unwrap();
        bench.host.add_device(&info(1, "consumer")).unwrap();
        let provider = info(2, "stub").with_service("provider_svc", ServicePolicy::Public);

        let provider_id = bench.host.add_device(&provider).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        bench.host.del_device(provider_id).unwrap();
        assert!(!bench.host.observer().is_published("provider_svc"));
        assert_eq!(
            bench.host.observer().subscriber_states("provider_svc"),
            vec![SubscriberState::Pending]
        );

        bench.host.add_device(&provider).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unlaunch_leaves_a_newer_publisher_in_place() {
        let bench = SimHost::builder().with_stub_driver("stub").build().unwrap();
        let first = bench
            .host
            .add_device(&info(2, "stub").with_service("shared_svc", ServicePolicy::Private))
            .unwrap();
        let second = bench
            .host
            .add_device(&info(3, "stub").with_service("shared_svc", ServicePolicy::Private))
            .unwrap();

        bench.host.del_device(first).unwrap();
        let current = bench.host.observer().service("shared_svc").unwrap();
        let stub = current.downcast_ref::<crate::sim::StubService>().unwrap();
        assert_eq!(stub.dev_id, second);
    }

    /// Service manager whose removals can be made to fail.
    #[derive(Default)]
    struct FlakyServiceManager {
        inner: LocalServiceManager,
        refuse_remove: AtomicBool,
    }

    impl ServiceManager for FlakyServiceManager {
        fn add_service(
            &self,
            name: &str,
            class: DeviceClass,
            service: &ServiceObject,
            info: &str,
        ) -> HdfResult<()> {
            self.inner.add_service(name, class, service, info)
        }

        fn update_service(
            &self,
            name: &str,
            class: DeviceClass,
            service: &ServiceObject,
            info: &str,
        ) -> HdfResult<()> {
            self.inner.update_service(name, class, service, info)
        }

        fn remove_service(&self, name: &str) -> HdfResult<()> {
            if self.refuse_remove.load(Ordering::SeqCst) {
                return Err(HdfError::Failure(format!("'{name}' is pinned")));
            }
            self.inner.remove_service(name)
        }

        fn get_service(&self, name: &str) -> Option<ServiceObject> {
            self.inner.get_service(name)
        }
    }

    #[test]
    fn failed_removal_can_be_retried() {
        let drivers = Arc::new(DriverRegistry::new());
        drivers.register(stub_driver("stub")).unwrap();
        let services = Arc::new(FlakyServiceManager::default());
        let host = ObjectRegistry::new()
            .with_drivers(drivers)
            .with_service_manager(services.clone() as Arc<dyn ServiceManager>)
            .with_host(0, "flaky_host")
            .create(ObjectKind::DeviceHostService)
            .unwrap()
            .into_host()
            .unwrap();
        host.start_service().unwrap();
        let dev_id = host
            .add_device(&info(4, "stub").with_service("flaky_svc", ServicePolicy::Public))
            .unwrap();
        let node = host.node(dev_id).unwrap();

        services.refuse_remove.store(true, Ordering::SeqCst);
        assert!(matches!(node.remove_service(), Err(HdfError::Failure(_))));
        assert!(node.is_published());
        assert!(host.observer().is_published("flaky_svc"));

        services.refuse_remove.store(false, Ordering::SeqCst);
        node.remove_service().unwrap();
        assert!(!node.is_published());
        assert!(services.get_service("flaky_svc").is_none());
        assert!(!host.observer().is_published("flaky_svc"));
        host.teardown();
    }
}
