//! Central-side radio primitives
//!
//! The platform supplies scanning, link management and attribute access;
//! results arrive later as [`CentralEvent`]s fed back into the controller.
//! Implementations must not deliver events synchronously from inside a
//! primitive call.

use crate::gatt::{
    CharId, CharProperties, Characteristic, DeviceId, GattStatus, ServiceId, TransportError,
    CLIENT_CONFIG_DESCRIPTOR_UUID,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether a characteristic write expects an acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

/// Advertisement observed while scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub device: DeviceId,
    /// Service ids listed in the advertising payload
    pub service_ids: Vec<ServiceId>,
    pub rssi: Option<i16>,
    pub local_name: Option<String>,
}

impl ScanReport {
    pub fn new(device: DeviceId, service_ids: Vec<ServiceId>) -> Self {
        Self {
            device,
            service_ids,
            rssi: None,
            local_name: None,
        }
    }

    pub fn advertises(&self, service_id: &ServiceId) -> bool {
        self.service_ids.contains(service_id)
    }
}

/// Remote characteristic as reported by service discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredCharacteristic {
    pub id: CharId,
    pub properties: CharProperties,
    pub descriptors: Vec<Uuid>,
}

impl DiscoveredCharacteristic {
    pub fn new(id: CharId, properties: CharProperties) -> Self {
        Self {
            id,
            properties,
            descriptors: Vec::new(),
        }
    }

    /// Attach the client configuration descriptor
    pub fn with_config_descriptor(mut self) -> Self {
        if !self.has_config_descriptor() {
            self.descriptors.push(CLIENT_CONFIG_DESCRIPTOR_UUID);
        }
        self
    }

    pub fn has_config_descriptor(&self) -> bool {
        self.descriptors.contains(&CLIENT_CONFIG_DESCRIPTOR_UUID)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredService {
    pub id: ServiceId,
    pub characteristics: Vec<DiscoveredCharacteristic>,
}

impl DiscoveredService {
    pub fn new(id: ServiceId, characteristics: Vec<DiscoveredCharacteristic>) -> Self {
        Self {
            id,
            characteristics,
        }
    }

    pub fn characteristic(&self, id: &CharId) -> Option<&DiscoveredCharacteristic> {
        self.characteristics.iter().find(|c| c.id == *id)
    }
}

/// Platform callbacks delivered to the central
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralEvent {
    ScanResult(ScanReport),
    ScanFailed {
        code: i32,
    },
    LinkStateChanged {
        device: DeviceId,
        connected: bool,
    },
    ServicesDiscovered {
        device: DeviceId,
        status: GattStatus,
        services: Vec<DiscoveredService>,
    },
    CharacteristicChanged {
        device: DeviceId,
        characteristic: Characteristic,
    },
    CharacteristicRead {
        device: DeviceId,
        status: GattStatus,
        characteristic: Characteristic,
    },
    CharacteristicWritten {
        device: DeviceId,
        status: GattStatus,
        characteristic: Characteristic,
    },
    DescriptorWritten {
        device: DeviceId,
        characteristic: CharId,
        descriptor: Uuid,
        status: GattStatus,
    },
}

impl CentralEvent {
    /// Device the event belongs to, for link-scoped events
    pub fn device(&self) -> Option<&DeviceId> {
        match self {
            CentralEvent::ScanResult(_) | CentralEvent::ScanFailed { .. } => None,
            CentralEvent::LinkStateChanged { device, .. }
            | CentralEvent::ServicesDiscovered { device, .. }
            | CentralEvent::CharacteristicChanged { device, .. }
            | CentralEvent::CharacteristicRead { device, .. }
            | CentralEvent::CharacteristicWritten { device, .. }
            | CentralEvent::DescriptorWritten { device, .. } => Some(device),
        }
    }
}

/// Radio primitives consumed by the central role
#[cfg_attr(test, mockall::automock)]
pub trait CentralTransport: Send + Sync {
    fn start_scan(&self) -> Result<(), TransportError>;

    fn stop_scan(&self);

    /// Begin establishing a link; completion arrives as `LinkStateChanged`
    fn connect(&self, device: &DeviceId) -> Result<(), TransportError>;

    fn discover_services(&self, device: &DeviceId) -> Result<(), TransportError>;

    /// Route value-change notifications for a characteristic to this host
    fn set_notification_enabled(
        &self,
        device: &DeviceId,
        service: ServiceId,
        characteristic: CharId,
        enabled: bool,
    ) -> Result<(), TransportError>;

    fn write_descriptor(
        &self,
        device: &DeviceId,
        service: ServiceId,
        characteristic: CharId,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError>;

    fn read_characteristic(
        &self,
        device: &DeviceId,
        service: ServiceId,
        characteristic: CharId,
    ) -> Result<(), TransportError>;

    fn write_characteristic(
        &self,
        device: &DeviceId,
        service: ServiceId,
        characteristic: CharId,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError>;

    /// Request a graceful link teardown; the platform acknowledges with
    /// `LinkStateChanged { connected: false }`
    fn disconnect(&self, device: &DeviceId);

    /// Release the link immediately; no callback follows
    fn close_link(&self, device: &DeviceId);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::uuid_from_short;

    #[test]
    fn test_scan_report_advertises() {
        let report = ScanReport::new(
            DeviceId::from("00:11:22:33:44:55"),
            vec![uuid_from_short(0x180D), uuid_from_short(0xFFF0)],
        );
        assert!(report.advertises(&uuid_from_short(0xFFF0)));
        assert!(!report.advertises(&uuid_from_short(0x180F)));
    }

    #[test]
    fn test_config_descriptor_attached_once() {
        let ch = DiscoveredCharacteristic::new(uuid_from_short(0xFFF1), CharProperties::NOTIFY)
            .with_config_descriptor()
            .with_config_descriptor();
        assert!(ch.has_config_descriptor());
        assert_eq!(ch.descriptors.len(), 1);
    }

    #[test]
    fn test_event_device() {
        let device = DeviceId::from("dev");
        let event = CentralEvent::LinkStateChanged {
            device: device.clone(),
            connected: true,
        };
        assert_eq!(event.device(), Some(&device));
        assert_eq!(CentralEvent::ScanFailed { code: 2 }.device(), None);
    }
}
