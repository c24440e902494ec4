//! Registry of running devices and interrupt source memberships.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use pinboard_core::DeviceId;

use crate::device::Device;
use crate::lock;

/// Running devices keyed by id, plus which relay master each interrupt
/// source is registered with.
///
/// Memberships outlive the master device so a restarted master can adopt
/// the sources still registered against it.
#[derive(Default)]
pub struct Directory {
    devices: Mutex<HashMap<DeviceId, Arc<Device>>>,
    memberships: Mutex<HashMap<DeviceId, DeviceId>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &DeviceId) -> Option<Arc<Device>> {
        lock(&self.devices).get(id).cloned()
    }

    /// Insert `device` unless one with its id is already present.
    ///
    /// # Errors
    ///
    /// Returns the device already registered under the id.
    pub fn insert_if_absent(&self, device: Arc<Device>) -> Result<(), Arc<Device>> {
        let mut devices = lock(&self.devices);
        if let Some(existing) = devices.get(device.id()) {
            return Err(Arc::clone(existing));
        }
        devices.insert(device.id().clone(), device);
        Ok(())
    }

    /// Remove the entry for `id` only if it is `device`.
    pub fn remove_if_same(&self, id: &DeviceId, device: &Device) -> bool {
        let mut devices = lock(&self.devices);
        match devices.get(id) {
            Some(entry) if std::ptr::eq(Arc::as_ptr(entry), device) => {
                devices.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Running devices ordered by id.
    pub fn snapshot(&self) -> Vec<Arc<Device>> {
        let mut devices: Vec<_> = lock(&self.devices).values().cloned().collect();
        devices.sort_by(|a, b| a.id().cmp(b.id()));
        devices
    }

    pub fn len(&self) -> usize {
        lock(&self.devices).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Master `source` is registered with.
    pub fn membership(&self, source: &DeviceId) -> Option<DeviceId> {
        lock(&self.memberships).get(source).cloned()
    }

    /// Record `source` as registered with `master`, returning the previous
    /// master.
    pub(crate) fn set_membership(&self, source: &DeviceId, master: &DeviceId) -> Option<DeviceId> {
        lock(&self.memberships).insert(source.clone(), master.clone())
    }

    pub(crate) fn take_membership(&self, source: &DeviceId) -> Option<DeviceId> {
        lock(&self.memberships).remove(source)
    }

    /// Sources registered with `master`, ordered by id.
    pub fn sources_of(&self, master: &DeviceId) -> Vec<DeviceId> {
        let mut sources: Vec<_> = lock(&self.memberships)
            .iter()
            .filter(|(_, registered)| *registered == master)
            .map(|(source, _)| source.clone())
            .collect();
        sources.sort();
        sources
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> DeviceId {
        DeviceId::new(name).unwrap()
    }

    #[test]
    fn test_memberships() {
        let directory = Directory::new();
        assert_eq!(directory.set_membership(&id("door"), &id("int1")), None);
        directory.set_membership(&id("window"), &id("int1"));
        assert_eq!(
            directory.set_membership(&id("door"), &id("int2")),
            Some(id("int1"))
        );

        assert_eq!(directory.sources_of(&id("int1")), vec![id("window")]);
        assert_eq!(directory.membership(&id("door")), Some(id("int2")));

        assert_eq!(directory.take_membership(&id("door")), Some(id("int2")));
        assert!(directory.sources_of(&id("int2")).is_empty());
    }
}
