//! Peripheral-side radio primitives and the callbacks they produce

use super::registry::ServiceDescriptor;
use super::request::{DescriptorWriteRequest, ReadRequest, TransactionReply, WriteRequest};
use crate::config::AdvertiseSettings;
use crate::gatt::{CharId, DeviceId, GattStatus, ServiceId, TransportError};
use serde::{Deserialize, Serialize};

/// Advertising payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertiseData {
    pub service_ids: Vec<ServiceId>,
    pub include_tx_power: bool,
}

/// Radio primitives consumed by the peripheral role
#[cfg_attr(test, mockall::automock)]
pub trait PeripheralTransport: Send + Sync {
    fn open_server(&self) -> Result<(), TransportError>;

    fn add_service(&self, service: &ServiceDescriptor) -> Result<(), TransportError>;

    fn clear_services(&self);

    fn close_server(&self);

    /// Outcome arrives as `AdvertiseStarted` / `AdvertiseFailed`
    fn start_advertising(
        &self,
        settings: &AdvertiseSettings,
        data: &AdvertiseData,
    ) -> Result<(), TransportError>;

    fn stop_advertising(&self);

    fn notify_characteristic_changed(
        &self,
        device: &DeviceId,
        service: ServiceId,
        characteristic: CharId,
        value: &[u8],
        confirm: bool,
    ) -> Result<(), TransportError>;

    fn send_reply(&self, reply: &TransactionReply) -> Result<(), TransportError>;
}

/// Platform callbacks delivered to the peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralEvent {
    AdvertiseStarted,
    AdvertiseFailed { code: i32 },
    ServiceAdded { service_id: ServiceId, status: GattStatus },
    LinkStateChanged { device: DeviceId, connected: bool },
    ReadRequest(ReadRequest),
    WriteRequest(WriteRequest),
    DescriptorWriteRequest(DescriptorWriteRequest),
}
