//! `hdf-types` – shared vocabulary of the driver framework.
//!
//! Everything that crosses a crate (or process) boundary lives here: the
//! packed [`DevId`] structured identifier, service publication policies,
//! power-management enums, the [`DeviceInfo`] load description and the
//! framework-wide [`HdfError`] taxonomy.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Structured identifier
// ─────────────────────────────────────────────────────────────────────────────

/// Width of the host field of a [`DevId`].
pub const HOST_ID_BITS: u32 = 8;
/// Width of the device field of a [`DevId`].
pub const DEVICE_ID_BITS: u32 = 16;
/// Width of the node field of a [`DevId`].
pub const NODE_ID_BITS: u32 = 8;

/// Packed `host (8 bits) | device (16 bits) | node (8 bits)` identifier.
///
/// The host occupies the most significant byte.  A node id of `0` denotes the
/// device itself (or a node whose id has not been assigned yet).
///
/// ```
/// use hdf_types::DevId;
///
/// let id = DevId::new(3, 0x0102, 7);
/// assert_eq!(id.unpack(), (3, 0x0102, 7));
/// assert_eq!(id.device_root(), DevId::new(3, 0x0102, 0));
/// ```
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DevId(u32);

impl DevId {
    /// Pack a `(host, device, node)` triple.
    pub const fn new(host_id: u8, device_id: u16, node_id: u8) -> Self {
        Self(
            ((host_id as u32) << (DEVICE_ID_BITS + NODE_ID_BITS))
                | ((device_id as u32) << NODE_ID_BITS)
                | node_id as u32,
        )
    }

    /// Reinterpret a raw 32-bit value received from another process.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn host_id(self) -> u8 {
        (self.0 >> (DEVICE_ID_BITS + NODE_ID_BITS)) as u8
    }

    pub const fn device_id(self) -> u16 {
        (self.0 >> NODE_ID_BITS) as u16
    }

    pub const fn node_id(self) -> u8 {
        self.0 as u8
    }

    /// Split back into the `(host, device, node)` triple.
    pub const fn unpack(self) -> (u8, u16, u8) {
        (self.host_id(), self.device_id(), self.node_id())
    }

    /// The identifier of the device this node belongs to (node id `0`).
    pub const fn device_root(self) -> Self {
        Self::new(self.host_id(), self.device_id(), 0)
    }

    /// Same host and device, different node.
    pub const fn with_node_id(self, node_id: u8) -> Self {
        Self::new(self.host_id(), self.device_id(), node_id)
    }
}

impl fmt::Display for DevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host_id(), self.device_id(), self.node_id())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service vocabulary
// ─────────────────────────────────────────────────────────────────────────────

/// Type-erased service object a driver exposes to other drivers.
///
/// Consumers recover the concrete type with [`Arc::downcast`] or
/// `service.downcast_ref::<T>()`.
pub type ServiceObject = Arc<dyn Any + Send + Sync>;

/// Who may see a service published by a device node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServicePolicy {
    /// The node never publishes a service.
    #[default]
    None,
    /// Visible only to subscribers on the same device id.
    Private,
    /// Visible to everyone, also registered with the service manager.
    Public,
    /// Capability-scoped.  Published the same way as `Public`.
    Capacity,
}

impl ServicePolicy {
    /// `true` for every policy that results in a local publication.
    pub fn publishes(self) -> bool {
        self != ServicePolicy::None
    }

    /// `true` when the service is also registered with the external
    /// service manager.  Such nodes must provide a bind entry point.
    pub fn is_external(self) -> bool {
        matches!(self, ServicePolicy::Public | ServicePolicy::Capacity)
    }
}

/// Coarse class a service is registered under with the service manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    #[default]
    Default,
    Plat,
    Sensor,
    Input,
    Display,
    Audio,
    Camera,
    Usb,
    Userauth,
}

/// Lifecycle of a device node.
///
/// `None → Inited → Launched → Inited (unlaunch)`.  A failed launch leaves the
/// node in `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    #[default]
    None,
    Inited,
    Launched,
}

// ─────────────────────────────────────────────────────────────────────────────
// Power vocabulary
// ─────────────────────────────────────────────────────────────────────────────

/// System power transition propagated down the device tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerEvent {
    Suspend,
    Resume,
    DozeSuspend,
    DozeResume,
}

impl PowerEvent {
    /// Resume-like events wake the tree up; the rest put it to sleep.
    pub fn is_wake(self) -> bool {
        matches!(self, PowerEvent::Resume | PowerEvent::DozeResume)
    }
}

/// Who drives a power state token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerMode {
    /// System-wide transitions (`pm_notify`) reach the listener.
    #[default]
    SystemControlled,
    /// Wake-lock reference counting drives the listener.
    DynamicControlled,
}

/// State machine of a power state token: `Idle → Active ⇄ Inactive`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerTokenState {
    #[default]
    Idle,
    Active,
    Inactive,
}

// ─────────────────────────────────────────────────────────────────────────────
// Device load description
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a host needs to instantiate one device node.
///
/// A node id of `0` in [`DeviceInfo::dev_id`] asks the device to allocate
/// the next free node id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub dev_id: DevId,
    pub module_name: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub policy: ServicePolicy,
    #[serde(default)]
    pub permission: u16,
    #[serde(default)]
    pub device_class: DeviceClass,
    /// Key into the external device-tree data.
    #[serde(default)]
    pub match_attr: String,
    #[serde(default)]
    pub service_info: String,
}

impl DeviceInfo {
    pub fn new(dev_id: DevId, module_name: impl Into<String>) -> Self {
        Self {
            dev_id,
            module_name: module_name.into(),
            ..Self::default()
        }
    }

    /// Publish the node's service under `name` with the given policy.
    pub fn with_service(mut self, name: impl Into<String>, policy: ServicePolicy) -> Self {
        self.service_name = name.into();
        self.policy = policy;
        self
    }

    pub fn with_class(mut self, device_class: DeviceClass) -> Self {
        self.device_class = device_class;
        self
    }

    pub fn with_permission(mut self, permission: u16) -> Self {
        self.permission = permission;
        self
    }

    pub fn with_match_attr(mut self, match_attr: impl Into<String>) -> Self {
        self.match_attr = match_attr.into();
        self
    }

    pub fn with_service_info(mut self, info: impl Into<String>) -> Self {
        self.service_info = info.into();
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Framework-wide error taxonomy.  Success is `Ok(..)`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HdfError {
    #[error("Operation failed: {0}")]
    Failure(String),

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    /// Malformed descriptor or missing mandatory entry point.
    #[error("Invalid object: {0}")]
    InvalidObject(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No such device: {0}")]
    NoSuchDevice(DevId),

    #[error("Device busy: {0}")]
    DeviceBusy(DevId),

    /// A driver module could not be resolved.
    #[error("No driver data for module '{0}'")]
    NoData(String),

    #[error("Out of memory: {0}")]
    NoMemory(String),

    #[error("Device {dev_id} failed to initialise: {details}")]
    DevInitFail { dev_id: DevId, details: String },

    #[error("Failed to publish service '{service}': {details}")]
    PublishFail { service: String, details: String },

    #[error("Device manager refused to attach {dev_id}: {details}")]
    AttachDevFail { dev_id: DevId, details: String },
}

impl HdfError {
    /// Framework status code (negative, `0` is success).
    pub fn status(&self) -> i32 {
        match self {
            HdfError::Failure(_) => -1,
            HdfError::InvalidParam(_) => -3,
            HdfError::InvalidObject(_) => -4,
            HdfError::NoMemory(_) => -6,
            HdfError::DeviceBusy(_) => -16,
            HdfError::NoSuchDevice(_) => -208,
            HdfError::NotFound(_) => -209,
            HdfError::DevInitFail { .. } => -210,
            HdfError::PublishFail { .. } => -211,
            HdfError::AttachDevFail { .. } => -212,
            HdfError::NoData(_) => -213,
        }
    }

    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        self.status().abs()
    }
}

pub type HdfResult<T> = Result<T, HdfError>;
