//! [`DeviceHostService`] – one device host: its devices, its service
//! observer and the collaborators it talks to.
//!
//! # Locking
//!
//! The host device list is taken before any device node list, never the
//! other way round.  Neither is held while driver code runs.
//!
//! # Power sweep order
//!
//! | Event | Devices | Nodes within a device |
//! |---|---|---|
//! | resume, doze-resume | last added first | attach order |
//! | suspend, doze-suspend | attach order | last attached first |

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use hdf_observer::ServiceObserver;
use hdf_power::PowerManager;
use hdf_types::{DevId, DeviceInfo, DeviceState, HdfError, HdfResult, PowerEvent};
use tracing::{debug, error, info, instrument, warn};

use crate::device::Device;
use crate::device_object::DeviceObject;
use crate::devmgr::DevmgrServiceClient;
use crate::loader::DriverLoader;
use crate::node::DeviceNode;
use crate::service_manager::ServiceManager;

/// Collaborators a host is wired to.
#[derive(Clone)]
pub struct HostContext {
    pub devmgr: Arc<DevmgrServiceClient>,
    pub service_manager: Arc<dyn ServiceManager>,
    pub loader: Arc<dyn DriverLoader>,
    pub power: Arc<PowerManager>,
}

/// Outcome of a [`DeviceHostService::pm_notify`] sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PowerSweep {
    /// Nodes with a power listener that were handed the event.
    pub notified: usize,
    /// Of those, how many returned an error.
    pub failed: usize,
}

impl PowerSweep {
    pub fn merge(self, other: PowerSweep) -> PowerSweep {
        PowerSweep {
            notified: self.notified + other.notified,
            failed: self.failed + other.failed,
        }
    }
}

pub struct DeviceHostService {
    host_id: u8,
    host_name: String,
    this: Weak<DeviceHostService>,
    devices: Mutex<Vec<Arc<Device>>>,
    observer: ServiceObserver,
    ctx: HostContext,
}

impl DeviceHostService {
    pub fn new(host_id: u8, host_name: impl Into<String>, ctx: HostContext) -> Arc<Self> {
        let host_name = host_name.into();
        Arc::new_cyclic(|this| Self {
            host_id,
            host_name,
            this: Weak::clone(this),
            devices: Mutex::new(Vec::new()),
            observer: ServiceObserver::new(),
            ctx,
        })
    }

    pub fn host_id(&self) -> u8 {
        self.host_id
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn observer(&self) -> &ServiceObserver {
        &self.observer
    }

    pub fn device_manager(&self) -> &DevmgrServiceClient {
        &self.ctx.devmgr
    }

    pub fn service_manager(&self) -> &Arc<dyn ServiceManager> {
        &self.ctx.service_manager
    }

    pub fn loader(&self) -> &Arc<dyn DriverLoader> {
        &self.ctx.loader
    }

    pub fn power_manager(&self) -> &Arc<PowerManager> {
        &self.ctx.power
    }

    /// Announce this host to the device manager.
    pub fn start_service(&self) -> HdfResult<()> {
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| HdfError::InvalidObject(format!("host '{}' is gone", self.host_name)))?;
        self.ctx.devmgr.attach_device_host(self.host_id, &this)?;
        info!(host_id = self.host_id, host = %self.host_name, "device host started");
        Ok(())
    }

    // ── devices ─────────────────────────────────────────────────────────────

    /// Resolve the driver for `info`, build a node and attach it to its
    /// device (created on demand).  Returns the node's final id.
    ///
    /// # Errors
    ///
    /// - [`HdfError::InvalidParam`] for a foreign host id or empty module.
    /// - [`HdfError::NoData`] when no driver resolves.
    /// - any error from [`Device::attach`].
    #[instrument(skip(self, info), fields(host = %self.host_name, dev_id = %info.dev_id, module = %info.module_name))]
    pub fn add_device(&self, info: &DeviceInfo) -> HdfResult<DevId> {
        if info.dev_id.host_id() != self.host_id {
            return Err(HdfError::InvalidParam(format!(
                "{} does not belong to host {}",
                info.dev_id, self.host_id
            )));
        }
        if info.module_name.is_empty() {
            return Err(HdfError::InvalidParam("device has no module name".into()));
        }
        let driver = self.ctx.loader.get_driver(&info.module_name).map_err(|e| {
            warn!(error = %e, "driver lookup failed");
            HdfError::NoData(info.module_name.clone())
        })?;

        let node = DeviceNode::new(info, Weak::clone(&self.this)).with_driver(driver);
        match self.attach_node(node, true) {
            Ok(node) => {
                info!(dev_id = %node.dev_id(), "device added");
                Ok(node.dev_id())
            }
            Err(e) => {
                error!(error = %e, "device add failed");
                Err(e)
            }
        }
    }

    /// Detach the node with `dev_id`; the device goes away with its last
    /// node.  Unknown ids succeed.
    pub fn del_device(&self, dev_id: DevId) -> HdfResult<()> {
        let Some(device) = self.device(dev_id) else {
            return Ok(());
        };
        device.detach_by_id(dev_id)?;
        self.release_if_empty(&device);
        info!(%dev_id, host = %self.host_name, "device deleted");
        Ok(())
    }

    /// The device that `dev_id` belongs to.
    pub fn device(&self, dev_id: DevId) -> Option<Arc<Device>> {
        let root = dev_id.device_root();
        self.lock_devices()
            .iter()
            .find(|d| d.dev_id() == root)
            .cloned()
    }

    /// Snapshot of the devices in the order they were added.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.lock_devices().clone()
    }

    pub fn node(&self, dev_id: DevId) -> Option<Arc<DeviceNode>> {
        self.device(dev_id)?.node(dev_id)
    }

    /// Insert `node` into its device and launch it.
    ///
    /// The device lookup (or creation) and the insertion happen under the
    /// host lock, the same lock [`release_if_empty`] checks emptiness under,
    /// so a device is never dropped from the host while a node is on its way
    /// in.  The launch itself runs without the host lock.
    ///
    /// [`release_if_empty`]: DeviceHostService::release_if_empty
    fn attach_node(&self, node: DeviceNode, create: bool) -> HdfResult<Arc<DeviceNode>> {
        let root = node.dev_id().device_root();
        let (device, node) = {
            let mut devices = self.lock_devices();
            let existing = devices.iter().find(|d| d.dev_id() == root).cloned();
            let device = match existing {
                Some(device) => device,
                None if create => {
                    let device = Arc::new(Device::new(root));
                    devices.push(Arc::clone(&device));
                    debug!(dev_id = %root, "device created");
                    device
                }
                None => {
                    let dev_id = node.dev_id();
                    drop(devices);
                    node.reclaim_driver();
                    return Err(HdfError::NoSuchDevice(dev_id));
                }
            };
            match device.insert(node) {
                Ok(node) => (device, node),
                Err(e) => {
                    if device.is_empty() {
                        devices.retain(|d| !Arc::ptr_eq(d, &device));
                    }
                    return Err(e);
                }
            }
        };
        if let Err(e) = device.launch_inserted(&node) {
            self.release_if_empty(&device);
            return Err(e);
        }
        Ok(node)
    }

    fn release_if_empty(&self, device: &Arc<Device>) {
        let mut devices = self.lock_devices();
        if device.is_empty() {
            devices.retain(|d| !Arc::ptr_eq(d, device));
        }
    }

    // ── dynamic child nodes ─────────────────────────────────────────────────

    /// Unattached node on `parent`'s device, bound to `module_name`.  The
    /// parent must be launched.
    pub fn alloc_device_node(&self, parent: &DeviceObject, module_name: &str) -> HdfResult<DeviceNode> {
        let parent_id = parent.dev_id();
        let parent_node = self
            .node(parent_id)
            .ok_or(HdfError::NoSuchDevice(parent_id))?;
        if parent_node.status() != DeviceState::Launched {
            return Err(HdfError::InvalidParam(format!(
                "parent {parent_id} is not launched"
            )));
        }
        let info = DeviceInfo::new(parent_id.with_node_id(0), module_name)
            .with_class(parent.device_class());
        Ok(DeviceNode::new(&info, Weak::clone(&self.this)))
    }

    /// Resolve the driver of a node from [`alloc_device_node`] and attach it
    /// to its device.
    ///
    /// [`alloc_device_node`]: DeviceHostService::alloc_device_node
    pub fn register_device_node(&self, node: DeviceNode) -> HdfResult<DevId> {
        if self.device(node.dev_id()).is_none() {
            return Err(HdfError::NoSuchDevice(node.dev_id()));
        }
        let driver = self
            .ctx
            .loader
            .get_driver(node.module_name())
            .map_err(|_| HdfError::NoData(node.module_name().to_string()))?;
        let node = self.attach_node(node.with_driver(driver), false)?;
        info!(dev_id = %node.dev_id(), module = node.module_name(), "child node registered");
        Ok(node.dev_id())
    }

    /// Detach a node added with [`DeviceHostService::register_device_node`].
    pub fn unregister_device_node(&self, dev_id: DevId) -> HdfResult<()> {
        self.del_device(dev_id)
    }

    /// Push new service info for the node with `dev_id`.
    pub fn update_service(&self, dev_id: DevId, info: &str) -> HdfResult<()> {
        let node = self.node(dev_id).ok_or(HdfError::NoSuchDevice(dev_id))?;
        node.update_service(info)
    }

    // ── power ───────────────────────────────────────────────────────────────

    /// Deliver `event` to every node with a power listener.
    ///
    /// Per-node failures are logged and the sweep continues.
    ///
    /// # Errors
    ///
    /// [`HdfError::Failure`] only when every notified node failed.
    pub fn pm_notify(&self, event: PowerEvent) -> HdfResult<PowerSweep> {
        let sweep = self.power_sweep(event);
        if sweep.notified > 0 && sweep.failed == sweep.notified {
            return Err(HdfError::Failure(format!(
                "all {} nodes rejected {event:?}",
                sweep.notified
            )));
        }
        Ok(sweep)
    }

    /// The sweep behind [`DeviceHostService::pm_notify`], reporting counts
    /// only.
    pub fn power_sweep(&self, event: PowerEvent) -> PowerSweep {
        let mut devices = self.devices();
        if event.is_wake() {
            devices.reverse();
        }
        let mut sweep = PowerSweep::default();
        for device in devices {
            let mut nodes = device.nodes();
            if !event.is_wake() {
                nodes.reverse();
            }
            for node in nodes {
                let Some(token) = node.object().power_token() else {
                    continue;
                };
                sweep.notified += 1;
                if let Err(e) = token.power_state_change(event) {
                    sweep.failed += 1;
                    warn!(dev_id = %node.dev_id(), ?event, error = %e, "power transition failed");
                }
            }
        }
        debug!(host = %self.host_name, ?event, notified = sweep.notified, failed = sweep.failed, "power sweep done");
        sweep
    }

    /// Tear down every device, last added first.
    pub fn teardown(&self) {
        let devices = std::mem::take(&mut *self.lock_devices());
        for device in devices.iter().rev() {
            device.detach_all();
        }
        info!(host = %self.host_name, devices = devices.len(), "device host torn down");
    }

    fn lock_devices(&self) -> MutexGuard<'_, Vec<Arc<Device>>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for DeviceHostService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHostService")
            .field("host_id", &self.host_id)
            .field("host_name", &self.host_name)
            .field("devices", &self.lock_devices().len())
            .field("services", &self.observer.len())
            .finish()
    }
}
