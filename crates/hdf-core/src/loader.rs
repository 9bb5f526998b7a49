//! Driver loader seam between a host and wherever driver code comes from.

use std::sync::Arc;

use hdf_types::HdfResult;
use tracing::debug;

use crate::driver::{DriverHandle, DriverRegistry};

/// Resolves module names to drivers and takes them back on unload.
pub trait DriverLoader: Send + Sync {
    fn get_driver(&self, module_name: &str) -> HdfResult<DriverHandle>;

    /// Give back a driver obtained from [`DriverLoader::get_driver`].
    /// Loaders that map code in on demand unmap it here.
    fn reclaim_driver(&self, _driver: DriverHandle) {}
}

/// Loader for drivers linked into the process: a thin front over a
/// [`DriverRegistry`].
pub struct StaticDriverLoader {
    registry: Arc<DriverRegistry>,
}

impl StaticDriverLoader {
    pub fn new(registry: Arc<DriverRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }
}

impl DriverLoader for StaticDriverLoader {
    fn get_driver(&self, module_name: &str) -> HdfResult<DriverHandle> {
        self.registry.get_driver(module_name)
    }

    fn reclaim_driver(&self, driver: DriverHandle) {
        debug!(module = driver.module_name(), "driver reclaimed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverEntry;
    use hdf_types::HdfError;

    #[test]
    fn static_loader_fronts_registry() {
        let registry = Arc::new(DriverRegistry::new());
        registry.register(DriverEntry::new("uart")).unwrap();
        let loader = StaticDriverLoader::new(Arc::clone(&registry));

        let driver = loader.get_driver("uart").unwrap();
        assert_eq!(driver.module_name(), "uart");
        loader.reclaim_driver(driver);
        // Static drivers stay registered after reclaim.
        assert_eq!(registry.len(), 1);

        assert!(matches!(
            loader.get_driver("spi"),
            Err(HdfError::NotFound(_))
        ));
    }
}
