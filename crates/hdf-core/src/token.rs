//! [`DeviceToken`] – the handle a node hands to the device manager on attach.

use hdf_types::DevId;

/// Device-manager side identity of a launched node.  Always carries the
/// same id as the node that owns it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DeviceToken {
    dev_id: DevId,
}

impl DeviceToken {
    pub fn new(dev_id: DevId) -> Self {
        Self { dev_id }
    }

    pub fn dev_id(&self) -> DevId {
        self.dev_id
    }

    pub(crate) fn set_dev_id(&mut self, dev_id: DevId) {
        self.dev_id = dev_id;
    }
}
