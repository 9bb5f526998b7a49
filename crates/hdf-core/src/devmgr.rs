//! Device manager seam.
//!
//! A host talks to the system device manager through a
//! [`DevmgrServiceClient`], a thin proxy over any [`DeviceManager`]
//! implementation.  [`LocalDeviceManager`] is the in-process one: it keeps
//! track of live hosts and attached device tokens, and can load devices
//! onto hosts or broadcast power events to all of them.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use hdf_types::{DevId, DeviceInfo, HdfError, HdfResult, PowerEvent};
use tracing::{debug, info};

use crate::host::{DeviceHostService, PowerSweep};
use crate::token::DeviceToken;

/// Operations a host needs from the device manager.
pub trait DeviceManager: Send + Sync {
    fn attach_device_host(&self, host_id: u8, host: &Arc<DeviceHostService>) -> HdfResult<()>;

    fn attach_device(&self, token: &DeviceToken) -> HdfResult<()>;

    /// Forget a previously attached device.  Unknown ids succeed.
    fn detach_device(&self, dev_id: DevId) -> HdfResult<()>;
}

/// Host-side proxy to the device manager.
#[derive(Clone)]
pub struct DevmgrServiceClient {
    remote: Arc<dyn DeviceManager>,
}

impl DevmgrServiceClient {
    pub fn new(remote: Arc<dyn DeviceManager>) -> Self {
        Self { remote }
    }

    pub fn attach_device_host(&self, host_id: u8, host: &Arc<DeviceHostService>) -> HdfResult<()> {
        self.remote.attach_device_host(host_id, host)
    }

    pub fn attach_device(&self, token: &DeviceToken) -> HdfResult<()> {
        debug!(dev_id = %token.dev_id(), "attach device");
        self.remote.attach_device(token)
    }

    pub fn detach_device(&self, dev_id: DevId) -> HdfResult<()> {
        debug!(%dev_id, "detach device");
        self.remote.detach_device(dev_id)
    }
}

impl fmt::Debug for DevmgrServiceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevmgrServiceClient").finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// LocalDeviceManager
// ─────────────────────────────────────────────────────────────────────────────

struct HostSlot {
    host_id: u8,
    host: Weak<DeviceHostService>,
}

/// In-process device manager.
#[derive(Default)]
pub struct LocalDeviceManager {
    hosts: Mutex<Vec<HostSlot>>,
    devices: Mutex<Vec<DevId>>,
}

impl LocalDeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live host registered under `host_id`.
    pub fn host(&self, host_id: u8) -> Option<Arc<DeviceHostService>> {
        self.lock_hosts()
            .iter()
            .find(|slot| slot.host_id == host_id)
            .and_then(|slot| slot.host.upgrade())
    }

    /// Add `info` to the host its id points at.
    pub fn load_device(&self, info: &DeviceInfo) -> HdfResult<DevId> {
        let host_id = info.dev_id.host_id();
        let host = self
            .host(host_id)
            .ok_or_else(|| HdfError::NotFound(format!("device host {host_id}")))?;
        host.add_device(info)
    }

    /// Remove the node `dev_id` from its host.
    pub fn unload_device(&self, dev_id: DevId) -> HdfResult<()> {
        let host = self
            .host(dev_id.host_id())
            .ok_or(HdfError::NoSuchDevice(dev_id))?;
        host.del_device(dev_id)
    }

    /// Deliver `event` to every live host and add up the sweeps.
    ///
    /// # Errors
    ///
    /// [`HdfError::Failure`] when at least one node was notified and all of
    /// them failed.
    pub fn broadcast_power_state(&self, event: PowerEvent) -> HdfResult<PowerSweep> {
        let hosts: Vec<Arc<DeviceHostService>> = self
            .lock_hosts()
            .iter()
            .filter_map(|slot| slot.host.upgrade())
            .collect();
        let total = hosts
            .iter()
            .map(|host| host.power_sweep(event))
            .fold(PowerSweep::default(), PowerSweep::merge);
        if total.notified > 0 && total.failed == total.notified {
            return Err(HdfError::Failure(format!(
                "no device accepted {event:?}"
            )));
        }
        Ok(total)
    }

    pub fn is_attached(&self, dev_id: DevId) -> bool {
        self.lock_devices().contains(&dev_id)
    }

    /// Attached device ids in attach order.
    pub fn attached_devices(&self) -> Vec<DevId> {
        self.lock_devices().clone()
    }

    pub fn host_ids(&self) -> Vec<u8> {
        self.lock_hosts()
            .iter()
            .filter(|slot| slot.host.strong_count() > 0)
            .map(|slot| slot.host_id)
            .collect()
    }

    fn lock_hosts(&self) -> MutexGuard<'_, Vec<HostSlot>> {
        self.hosts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_devices(&self) -> MutexGuard<'_, Vec<DevId>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DeviceManager for LocalDeviceManager {
    fn attach_device_host(&self, host_id: u8, host: &Arc<DeviceHostService>) -> HdfResult<()> {
        let mut hosts = self.lock_hosts();
        hosts.retain(|slot| slot.host.strong_count() > 0);
        if hosts.iter().any(|slot| slot.host_id == host_id) {
            return Err(HdfError::DeviceBusy(DevId::new(host_id, 0, 0)));
        }
        hosts.push(HostSlot {
            host_id,
            host: Arc::downgrade(host),
        });
        info!(host_id, host = host.host_name(), "device host attached");
        Ok(())
    }

    fn attach_device(&self, token: &DeviceToken) -> HdfResult<()> {
        let mut devices = self.lock_devices();
        if devices.contains(&token.dev_id()) {
            return Err(HdfError::DeviceBusy(token.dev_id()));
        }
        devices.push(token.dev_id());
        Ok(())
    }

    fn detach_device(&self, dev_id: DevId) -> HdfResult<()> {
        self.lock_devices().retain(|id| *id != dev_id);
        Ok(())
    }
}

impl fmt::Debug for LocalDeviceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalDeviceManager")
            .field("hosts", &self.host_ids())
            .field("devices", &self.lock_devices().len())
            .finish()
    }
}
