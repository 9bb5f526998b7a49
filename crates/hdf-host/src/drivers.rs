//! Drivers linked into the host binary.

use std::sync::Arc;

use hdf_core::{DriverEntry, DriverRegistry};
use hdf_power::PowerStateListener;
use hdf_types::{DevId, HdfResult};
use tracing::info;

pub const SAMPLE_MODULE: &str = "hdf_sample";

/// Service object published by the sample driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleService {
    pub dev_id: DevId,
    pub match_attr: String,
}

struct SamplePower;

impl PowerStateListener for SamplePower {
    fn suspend(&self, dev_id: DevId) -> HdfResult<()> {
        info!(%dev_id, "sample device suspended");
        Ok(())
    }

    fn resume(&self, dev_id: DevId) -> HdfResult<()> {
        info!(%dev_id, "sample device resumed");
        Ok(())
    }
}

fn sample_driver() -> DriverEntry {
    DriverEntry::new(SAMPLE_MODULE)
        .with_bind(|obj| {
            obj.set_service_value(SampleService {
                dev_id: obj.dev_id(),
                match_attr: obj.match_attr().to_string(),
            });
            Ok(())
        })
        .with_init(|obj| {
            obj.register_power_listener(Arc::new(SamplePower))?;
            info!(dev_id = %obj.dev_id(), "sample driver initialised");
            Ok(())
        })
        .with_release(|obj| {
            obj.unregister_power_listener();
            info!(dev_id = %obj.dev_id(), "sample driver released");
        })
}

/// Every built-in driver entry.
pub fn builtin_drivers() -> Vec<DriverEntry> {
    vec![sample_driver()]
}

/// Registry pre-populated with [`builtin_drivers`].
pub fn builtin_registry() -> HdfResult<Arc<DriverRegistry>> {
    let registry = Arc::new(DriverRegistry::new());
    for entry in builtin_drivers() {
        registry.register(entry)?;
    }
    Ok(registry)
}
