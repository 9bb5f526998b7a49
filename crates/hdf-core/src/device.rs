//! [`Device`] – the set of nodes sharing one `(host, device)` pair.
//!
//! Node ids are unique within a device.  Id `0` on an incoming node asks the
//! device to allocate the next one; allocation only moves forward, so ids
//! are never reused within the device's lifetime.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use hdf_types::{DevId, HdfError, HdfResult};
use tracing::{debug, info};

use crate::node::DeviceNode;

struct DeviceInner {
    nodes: Vec<Arc<DeviceNode>>,
    max_node_id: u8,
}

pub struct Device {
    dev_id: DevId,
    inner: Mutex<DeviceInner>,
}

impl Device {
    /// Empty device.  The node field of `dev_id` is ignored.
    pub fn new(dev_id: DevId) -> Self {
        Self {
            dev_id: dev_id.device_root(),
            inner: Mutex::new(DeviceInner {
                nodes: Vec::new(),
                max_node_id: 0,
            }),
        }
    }

    /// Identifier of the device itself (node id `0`).
    pub fn dev_id(&self) -> DevId {
        self.dev_id
    }

    /// Assign an id to `node`, insert it and launch it.
    ///
    /// The device lock is not held while the driver runs.  If the launch
    /// fails the node is taken out again and dropped.
    ///
    /// # Errors
    ///
    /// - [`HdfError::InvalidParam`] when node ids are exhausted or a
    ///   pre-assigned id belongs to another device.
    /// - [`HdfError::DeviceBusy`] when a pre-assigned id is taken.
    /// - any launch error from [`DeviceNode::launch`].
    pub fn attach(&self, node: DeviceNode) -> HdfResult<Arc<DeviceNode>> {
        let node = self.insert(node)?;
        self.launch_inserted(&node)?;
        Ok(node)
    }

    /// First half of [`Device::attach`]: assign the id and insert the node
    /// without launching it.  On an id error the driver is reclaimed.
    pub(crate) fn insert(&self, mut node: DeviceNode) -> HdfResult<Arc<DeviceNode>> {
        let node = {
            let mut inner = self.lock();
            let dev_id = match self.assign_id(&mut inner, node.dev_id()) {
                Ok(id) => id,
                Err(e) => {
                    drop(inner);
                    node.reclaim_driver();
                    return Err(e);
                }
            };
            node.assign_dev_id(dev_id);
            let node = Arc::new(node);
            inner.nodes.push(Arc::clone(&node));
            node
        };
        debug!(dev_id = %node.dev_id(), module = node.module_name(), "node attached");
        Ok(node)
    }

    /// Second half of [`Device::attach`]: launch an inserted node, taking it
    /// out again when the launch fails.
    pub(crate) fn launch_inserted(&self, node: &Arc<DeviceNode>) -> HdfResult<()> {
        if let Err(e) = node.launch() {
            self.lock().nodes.retain(|n| !Arc::ptr_eq(n, node));
            return Err(e);
        }
        Ok(())
    }

    fn assign_id(&self, inner: &mut DeviceInner, requested: DevId) -> HdfResult<DevId> {
        if requested.node_id() == 0 {
            let next = inner.max_node_id.checked_add(1).ok_or_else(|| {
                HdfError::InvalidParam(format!("{} has no free node id", self.dev_id))
            })?;
            inner.max_node_id = next;
            return Ok(self.dev_id.with_node_id(next));
        }
        if requested.device_root() != self.dev_id {
            return Err(HdfError::InvalidParam(format!(
                "node {requested} does not belong to device {}",
                self.dev_id
            )));
        }
        if inner.nodes.iter().any(|n| n.dev_id() == requested) {
            return Err(HdfError::DeviceBusy(requested));
        }
        inner.max_node_id = inner.max_node_id.max(requested.node_id());
        Ok(requested)
    }

    /// Remove `node` and unlaunch it.  Nodes not in this device are ignored.
    pub fn detach(&self, node: &Arc<DeviceNode>) {
        let removed = {
            let mut inner = self.lock();
            let before = inner.nodes.len();
            inner.nodes.retain(|n| !Arc::ptr_eq(n, node));
            inner.nodes.len() != before
        };
        if removed {
            node.unlaunch();
            debug!(dev_id = %node.dev_id(), "node detached");
        }
    }

    /// Remove and unlaunch the node with `dev_id`.  Unknown ids succeed.
    pub fn detach_by_id(&self, dev_id: DevId) -> HdfResult<()> {
        let node = {
            let mut inner = self.lock();
            inner
                .nodes
                .iter()
                .position(|n| n.dev_id() == dev_id)
                .map(|idx| inner.nodes.remove(idx))
        };
        if let Some(node) = node {
            node.unlaunch();
            debug!(%dev_id, "node detached");
        }
        Ok(())
    }

    /// Unlaunch every node, most recently attached first, and empty the
    /// device.
    pub fn detach_all(&self) {
        let nodes = std::mem::take(&mut self.lock().nodes);
        for node in nodes.iter().rev() {
            node.unlaunch();
        }
        if !nodes.is_empty() {
            info!(dev_id = %self.dev_id, count = nodes.len(), "device torn down");
        }
    }

    /// Snapshot of the attached nodes in attach order.
    pub fn nodes(&self) -> Vec<Arc<DeviceNode>> {
        self.lock().nodes.clone()
    }

    pub fn node(&self, dev_id: DevId) -> Option<Arc<DeviceNode>> {
        self.lock()
            .nodes
            .iter()
            .find(|n| n.dev_id() == dev_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, DeviceInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Device")
            .field("dev_id", &self.dev_id)
            .field("nodes", &inner.nodes.len())
            .field("max_node_id", &inner.max_node_id)
            .finish()
    }
}
