//! Driver entry points and the process-wide driver table.
//!
//! A driver is described by a [`DriverEntry`]: a module name plus optional
//! `bind`, `init` and `release` closures that operate on the node's
//! [`DeviceObject`].  Entries live in a [`DriverRegistry`]; a miss can be
//! resolved by a [`ModuleInstaller`] that loads the module on demand.
//!
//! # Example
//!
//! ```
//! use hdf_core::driver::{DriverEntry, DriverRegistry};
//!
//! let registry = DriverRegistry::new();
//! registry
//!     .register(DriverEntry::new("sample").with_init(|_obj| Ok(())))
//!     .unwrap();
//!
//! assert!(registry.get_driver("sample").is_ok());
//! assert!(registry.get_driver("missing").is_err());
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use hdf_types::{HdfError, HdfResult};
use tracing::{debug, info, warn};

use crate::device_object::DeviceObject;

/// Driver lifecycle callback: `bind` or `init`.
pub type DriverCallback = Arc<dyn Fn(&DeviceObject) -> HdfResult<()> + Send + Sync>;

/// Driver teardown callback.
pub type ReleaseCallback = Arc<dyn Fn(&DeviceObject) + Send + Sync>;

/// Shared handle to a registered driver.
pub type DriverHandle = Arc<DriverEntry>;

/// System event class used when asking an installer for a module.
pub const SYSEVENT_CLASS_MODULE: u64 = 1 << 1;

/// What a [`ModuleInstaller`] is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleEvent {
    Install,
}

/// On-demand module loading (kernel module install or equivalent).
///
/// A successful `Install` is expected to register the module's entry in the
/// [`DriverRegistry`] before returning when `synchronous` is set.
pub trait ModuleInstaller: Send + Sync {
    fn load_module(
        &self,
        class: u64,
        event: ModuleEvent,
        module_name: &str,
        synchronous: bool,
    ) -> HdfResult<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// DriverEntry
// ─────────────────────────────────────────────────────────────────────────────

/// Entry points exported by one driver module.
pub struct DriverEntry {
    module_version: u32,
    module_name: String,
    pub(crate) bind: Option<DriverCallback>,
    pub(crate) init: Option<DriverCallback>,
    pub(crate) release: Option<ReleaseCallback>,
}

impl DriverEntry {
    pub fn new(module_name: impl Into<String>) -> Self {
        Self {
            module_version: 1,
            module_name: module_name.into(),
            bind: None,
            init: None,
            release: None,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.module_version = version;
        self
    }

    /// Called before `init`; expected to expose the node's service object.
    pub fn with_bind<F>(mut self, bind: F) -> Self
    where
        F: Fn(&DeviceObject) -> HdfResult<()> + Send + Sync + 'static,
    {
        self.bind = Some(Arc::new(bind));
        self
    }

    pub fn with_init<F>(mut self, init: F) -> Self
    where
        F: Fn(&DeviceObject) -> HdfResult<()> + Send + Sync + 'static,
    {
        self.init = Some(Arc::new(init));
        self
    }

    pub fn with_release<F>(mut self, release: F) -> Self
    where
        F: Fn(&DeviceObject) + Send + Sync + 'static,
    {
        self.release = Some(Arc::new(release));
        self
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn module_version(&self) -> u32 {
        self.module_version
    }

    pub fn has_bind(&self) -> bool {
        self.bind.is_some()
    }

    pub fn has_init(&self) -> bool {
        self.init.is_some()
    }
}

impl fmt::Debug for DriverEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverEntry")
            .field("module_name", &self.module_name)
            .field("module_version", &self.module_version)
            .field("bind", &self.bind.is_some())
            .field("init", &self.init.is_some())
            .field("release", &self.release.is_some())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DriverRegistry
// ─────────────────────────────────────────────────────────────────────────────

/// Ordered table of registered drivers.
///
/// Lookups scan in registration order, so the first entry registered under a
/// module name wins.
#[derive(Default)]
pub struct DriverRegistry {
    entries: Mutex<Vec<DriverHandle>>,
    installer: Mutex<Option<Arc<dyn ModuleInstaller>>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_installer(&self, installer: Arc<dyn ModuleInstaller>) {
        *self.installer.lock().unwrap_or_else(|e| e.into_inner()) = Some(installer);
    }

    /// Add `entry` to the table.
    ///
    /// # Errors
    ///
    /// [`HdfError::InvalidObject`] when the module name is empty.
    pub fn register(&self, entry: DriverEntry) -> HdfResult<DriverHandle> {
        if entry.module_name.is_empty() {
            return Err(HdfError::InvalidObject(
                "driver entry has no module name".into(),
            ));
        }
        let handle = Arc::new(entry);
        self.lock_entries().push(Arc::clone(&handle));
        info!(module = %handle.module_name, version = handle.module_version, "driver registered");
        Ok(handle)
    }

    /// Remove exactly the entry behind `handle`.  Unknown handles are ignored.
    pub fn unregister(&self, handle: &DriverHandle) {
        let mut entries = self.lock_entries();
        let before = entries.len();
        entries.retain(|e| !Arc::ptr_eq(e, handle));
        if entries.len() != before {
            debug!(module = %handle.module_name, "driver unregistered");
        }
    }

    /// Look up `module_name` without consulting the installer.
    pub fn find(&self, module_name: &str) -> Option<DriverHandle> {
        self.lock_entries()
            .iter()
            .find(|e| e.module_name == module_name)
            .cloned()
    }

    /// Look up `module_name`, asking the installer to load it on a miss and
    /// searching once more.
    ///
    /// # Errors
    ///
    /// [`HdfError::NotFound`] when the module is still missing.
    pub fn get_driver(&self, module_name: &str) -> HdfResult<DriverHandle> {
        if let Some(handle) = self.find(module_name) {
            return Ok(handle);
        }
        let installer = self
            .installer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(installer) = installer {
            debug!(module = module_name, "driver missing, asking installer");
            if let Err(e) = installer.load_module(
                SYSEVENT_CLASS_MODULE,
                ModuleEvent::Install,
                module_name,
                true,
            ) {
                warn!(module = module_name, error = %e, "module install failed");
            }
            if let Some(handle) = self.find(module_name) {
                return Ok(handle);
            }
        }
        Err(HdfError::NotFound(format!("driver '{module_name}'")))
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered module names in registration order.
    pub fn module_names(&self) -> Vec<String> {
        self.lock_entries()
            .iter()
            .map(|e| e.module_name.clone())
            .collect()
    }

    fn lock_entries(&self) -> MutexGuard<'_, Vec<DriverHandle>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
