/// Subscriber bookkeeping for local characteristics
///
/// Maps each (service, characteristic) pair to the set of devices that
/// enabled notifications on it. A device appears at most once per pair.

use crate::gatt::{CharId, DeviceId, ServiceId};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

#[derive(Debug, Default, Clone)]
pub struct NotificationRegistry {
    entries: HashMap<(ServiceId, CharId), BTreeSet<DeviceId>>,
}

impl NotificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the device was not already subscribed
    pub fn subscribe(&mut self, service: ServiceId, characteristic: CharId, device: DeviceId) -> bool {
        debug!("{} subscribed to {}", device, characteristic);
        self.entries
            .entry((service, characteristic))
            .or_default()
            .insert(device)
    }

    pub fn unsubscribe(&mut self, service: ServiceId, characteristic: CharId, device: &DeviceId) -> bool {
        let key = (service, characteristic);
        let Some(devices) = self.entries.get_mut(&key) else {
            return false;
        };
        let removed = devices.remove(device);
        if devices.is_empty() {
            self.entries.remove(&key);
        }
        if removed {
            debug!("{} unsubscribed from {}", device, characteristic);
        }
        removed
    }

    /// Remove a device from every entry; returns how many entries it left
    pub fn forget_device(&mut self, device: &DeviceId) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, devices| {
            if devices.remove(device) {
                removed += 1;
            }
            !devices.is_empty()
        });
        removed
    }

    /// Subscribed devices in stable order
    pub fn subscribers(&self, service: ServiceId, characteristic: CharId) -> Vec<DeviceId> {
        self.entries
            .get(&(service, characteristic))
            .map(|devices| devices.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, service: ServiceId, characteristic: CharId, device: &DeviceId) -> bool {
        self.entries
            .get(&(service, characteristic))
            .map_or(false, |devices| devices.contains(device))
    }

    /// Number of (pair, device) subscriptions
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
