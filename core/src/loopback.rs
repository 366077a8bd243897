//! In-memory radio linking one central to one peripheral
//!
//! [`LoopbackRadio`] implements both transport traits over shared state.
//! Primitive calls never deliver callbacks inline: every resulting platform
//! event is queued on an unbounded channel and handed to the two roles by
//! [`run_router`].

use crate::central::{
    CentralController, CentralEvent, CentralTransport, DiscoveredCharacteristic,
    DiscoveredService, ScanReport, WriteType,
};
use crate::config::AdvertiseSettings;
use crate::gatt::{CharId, Characteristic, DeviceId, GattStatus, ServiceId, TransportError};
use crate::peripheral::{
    AdvertiseData, DescriptorWriteRequest, Peripheral, PeripheralEvent, PeripheralTransport,
    ReadRequest, ServiceDescriptor, TransactionReply, WriteRequest,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Platform event addressed to one side of the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    Central(CentralEvent),
    Peripheral(PeripheralEvent),
}

/// Inbound transaction awaiting the peripheral's reply
#[derive(Debug, Clone)]
enum PendingRequest {
    Read {
        service: ServiceId,
        characteristic: CharId,
    },
    Write {
        service: ServiceId,
        characteristic: CharId,
    },
    Descriptor {
        characteristic: CharId,
        descriptor: Uuid,
    },
}

#[derive(Debug, Default)]
struct RadioState {
    scanning: bool,
    advertising: Option<Vec<ServiceId>>,
    server_open: bool,
    services: Vec<ServiceDescriptor>,
    link_up: bool,
    next_request_id: u32,
    pending: HashMap<u32, PendingRequest>,
    notifications_enabled: HashSet<CharId>,
}

impl RadioState {
    fn next_request_id(&mut self) -> u32 {
        self.next_request_id = self.next_request_id.wrapping_add(1);
        self.next_request_id
    }

    fn reset_link(&mut self) {
        self.link_up = false;
        self.pending.clear();
        self.notifications_enabled.clear();
    }

    fn find_service(&self, service: &ServiceId) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|s| s.id == *service)
    }
}

pub struct LoopbackRadio {
    central_device: DeviceId,
    peripheral_device: DeviceId,
    state: Mutex<RadioState>,
    events: mpsc::UnboundedSender<RadioEvent>,
}

impl LoopbackRadio {
    /// Create a radio and the receiver its events are queued on
    pub fn new(
        central_device: DeviceId,
        peripheral_device: DeviceId,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RadioEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let radio = Arc::new(Self {
            central_device,
            peripheral_device,
            state: Mutex::new(RadioState::default()),
            events: tx,
        });
        (radio, rx)
    }

    pub fn central(self: &Arc<Self>) -> LoopbackCentral {
        LoopbackCentral(Arc::clone(self))
    }

    pub fn peripheral(self: &Arc<Self>) -> LoopbackPeripheral {
        LoopbackPeripheral(Arc::clone(self))
    }

    pub fn central_device(&self) -> &DeviceId {
        &self.central_device
    }

    pub fn peripheral_device(&self) -> &DeviceId {
        &self.peripheral_device
    }

    pub fn is_linked(&self) -> bool {
        self.state.lock().link_up
    }

    /// Simulate the link vanishing out of range; both sides see it drop
    pub fn drop_link(&self) -> bool {
        let mut state = self.state.lock();
        if !state.link_up {
            return false;
        }
        debug!("Loopback link lost");
        state.reset_link();
        self.emit_link(false);
        true
    }

    fn emit(&self, event: RadioEvent) {
        trace!("Loopback queued {:?}", event);
        if self.events.send(event).is_err() {
            debug!("Loopback router gone, event dropped");
        }
    }

    fn to_central(&self, event: CentralEvent) {
        self.emit(RadioEvent::Central(event));
    }

    fn to_peripheral(&self, event: PeripheralEvent) {
        self.emit(RadioEvent::Peripheral(event));
    }

    fn emit_link(&self, connected: bool) {
        self.to_central(CentralEvent::LinkStateChanged {
            device: self.peripheral_device.clone(),
            connected,
        });
        self.to_peripheral(PeripheralEvent::LinkStateChanged {
            device: self.central_device.clone(),
            connected,
        });
    }

    fn advertisement(&self, service_ids: Vec<ServiceId>) -> CentralEvent {
        let mut report = ScanReport::new(self.peripheral_device.clone(), service_ids);
        report.rssi = Some(-40);
        CentralEvent::ScanResult(report)
    }

    fn check_peer(&self, device: &DeviceId, state: &RadioState) -> Result<(), TransportError> {
        if *device != self.peripheral_device || !state.link_up {
            return Err(TransportError::NoLink(device.clone()));
        }
        Ok(())
    }
}

// ============================================================================
// CENTRAL SIDE
// ============================================================================

/// Central half of a [`LoopbackRadio`]
#[derive(Clone)]
pub struct LoopbackCentral(Arc<LoopbackRadio>);

impl CentralTransport for LoopbackCentral {
    fn start_scan(&self) -> Result<(), TransportError> {
        let radio = &self.0;
        let mut state = radio.state.lock();
        state.scanning = true;
        if let Some(service_ids) = state.advertising.clone() {
            radio.to_central(radio.advertisement(service_ids));
        }
        Ok(())
    }

    fn stop_scan(&self) {
        self.0.state.lock().scanning = false;
    }

    fn connect(&self, device: &DeviceId) -> Result<(), TransportError> {
        let radio = &self.0;
        let mut state = radio.state.lock();
        if *device != radio.peripheral_device || !state.server_open {
            return Err(TransportError::NoLink(device.clone()));
        }
        if !state.link_up {
            state.link_up = true;
            radio.emit_link(true);
        }
        Ok(())
    }

    fn discover_services(&self, device: &DeviceId) -> Result<(), TransportError> {
        let radio = &self.0;
        let state = radio.state.lock();
        radio.check_peer(device, &state)?;
        let services = state
            .services
            .iter()
            .map(|service| {
                DiscoveredService::new(
                    service.id,
                    service
                        .characteristics
                        .iter()
                        .map(|ch| DiscoveredCharacteristic {
                            id: ch.id,
                            properties: ch.properties,
                            descriptors: ch.descriptors.iter().map(|d| d.id).collect(),
                        })
                        .collect(),
                )
            })
            .collect();
        radio.to_central(CentralEvent::ServicesDiscovered {
            device: device.clone(),
            status: GattStatus::Success,
            services,
        });
        Ok(())
    }

    fn set_notification_enabled(
        &self,
        device: &DeviceId,
        service: ServiceId,
        characteristic: CharId,
        enabled: bool,
    ) -> Result<(), TransportError> {
        let radio = &self.0;
        let mut state = radio.state.lock();
        radio.check_peer(device, &state)?;
        if state.find_service(&service).is_none() {
            return Err(TransportError::Rejected(format!("unknown service {}", service)));
        }
        if enabled {
            state.notifications_enabled.insert(characteristic);
        } else {
            state.notifications_enabled.remove(&characteristic);
        }
        Ok(())
    }

    fn write_descriptor(
        &self,
        device: &DeviceId,
        service: ServiceId,
        characteristic: CharId,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let radio = &self.0;
        let mut state = radio.state.lock();
        radio.check_peer(device, &state)?;
        let request_id = state.next_request_id();
        state.pending.insert(
            request_id,
            PendingRequest::Descriptor {
                characteristic,
                descriptor,
            },
        );
        radio.to_peripheral(PeripheralEvent::DescriptorWriteRequest(DescriptorWriteRequest {
            device: radio.central_device.clone(),
            request_id,
            service_id: service,
            characteristic,
            descriptor,
            response_needed: true,
            offset: 0,
            value: value.to_vec(),
        }));
        Ok(())
    }

    fn read_characteristic(
        &self,
        device: &DeviceId,
        service: ServiceId,
        characteristic: CharId,
    ) -> Result<(), TransportError> {
        let radio = &self.0;
        let mut state = radio.state.lock();
        radio.check_peer(device, &state)?;
        let request_id = state.next_request_id();
        state.pending.insert(
            request_id,
            PendingRequest::Read {
                service,
                characteristic,
            },
        );
        radio.to_peripheral(PeripheralEvent::ReadRequest(ReadRequest {
            device: radio.central_device.clone(),
            request_id,
            service_id: service,
            characteristic,
            offset: 0,
        }));
        Ok(())
    }

    fn write_characteristic(
        &self,
        device: &DeviceId,
        service: ServiceId,
        characteristic: CharId,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError> {
        let radio = &self.0;
        let mut state = radio.state.lock();
        radio.check_peer(device, &state)?;
        let request_id = state.next_request_id();
        let response_needed = write_type == WriteType::WithResponse;
        if response_needed {
            state.pending.insert(
                request_id,
                PendingRequest::Write {
                    service,
                    characteristic,
                },
            );
        }
        radio.to_peripheral(PeripheralEvent::WriteRequest(WriteRequest {
            device: radio.central_device.clone(),
            request_id,
            service_id: service,
            characteristic,
            prepared_write: false,
            response_needed,
            offset: 0,
            value: value.to_vec(),
        }));
        if !response_needed {
            // Unacknowledged writes complete as soon as they are queued
            radio.to_central(CentralEvent::CharacteristicWritten {
                device: device.clone(),
                status: GattStatus::Success,
                characteristic: Characteristic::new(service, characteristic, value.to_vec()),
            });
        }
        Ok(())
    }

    fn disconnect(&self, device: &DeviceId) {
        let radio = &self.0;
        let mut state = radio.state.lock();
        if *device != radio.peripheral_device || !state.link_up {
            debug!("Loopback disconnect of {} ignored", device);
            return;
        }
        state.reset_link();
        radio.emit_link(false);
    }

    fn close_link(&self, device: &DeviceId) {
        let radio = &self.0;
        let mut state = radio.state.lock();
        if *device != radio.peripheral_device || !state.link_up {
            return;
        }
        state.reset_link();
        radio.to_peripheral(PeripheralEvent::LinkStateChanged {
            device: radio.central_device.clone(),
            connected: false,
        });
    }
}

// ============================================================================
// PERIPHERAL SIDE
// ============================================================================

/// Peripheral half of a [`LoopbackRadio`]
#[derive(Clone)]
pub struct LoopbackPeripheral(Arc<LoopbackRadio>);

impl PeripheralTransport for LoopbackPeripheral {
    fn open_server(&self) -> Result<(), TransportError> {
        let mut state = self.0.state.lock();
        if state.server_open {
            return Err(TransportError::Rejected("server already open".to_string()));
        }
        state.server_open = true;
        Ok(())
    }

    fn add_service(&self, service: &ServiceDescriptor) -> Result<(), TransportError> {
        let radio = &self.0;
        let mut state = radio.state.lock();
        if !state.server_open {
            return Err(TransportError::Unavailable);
        }
        state.services.retain(|s| s.id != service.id);
        state.services.push(service.clone());
        radio.to_peripheral(PeripheralEvent::ServiceAdded {
            service_id: service.id,
            status: GattStatus::Success,
        });
        Ok(())
    }

    fn clear_services(&self) {
        self.0.state.lock().services.clear();
    }

    fn close_server(&self) {
        let radio = &self.0;
        let mut state = radio.state.lock();
        state.server_open = false;
        state.services.clear();
        if state.link_up {
            state.reset_link();
            radio.emit_link(false);
        }
    }

    fn start_advertising(
        &self,
        settings: &AdvertiseSettings,
        data: &AdvertiseData,
    ) -> Result<(), TransportError> {
        let radio = &self.0;
        let mut state = radio.state.lock();
        if !settings.connectable {
            warn!("Loopback only carries connectable advertising");
        }
        state.advertising = Some(data.service_ids.clone());
        radio.to_peripheral(PeripheralEvent::AdvertiseStarted);
        if state.scanning {
            radio.to_central(radio.advertisement(data.service_ids.clone()));
        }
        Ok(())
    }

    fn stop_advertising(&self) {
        self.0.state.lock().advertising = None;
    }

    fn notify_characteristic_changed(
        &self,
        device: &DeviceId,
        service: ServiceId,
        characteristic: CharId,
        value: &[u8],
        _confirm: bool,
    ) -> Result<(), TransportError> {
        let radio = &self.0;
        let state = radio.state.lock();
        if *device != radio.central_device || !state.link_up {
            return Err(TransportError::NoLink(device.clone()));
        }
        if state.notifications_enabled.contains(&characteristic) {
            radio.to_central(CentralEvent::CharacteristicChanged {
                device: radio.peripheral_device.clone(),
                characteristic: Characteristic::new(service, characteristic, value.to_vec()),
            });
        } else {
            trace!("Notification for {} not routed", characteristic);
        }
        Ok(())
    }

    fn send_reply(&self, reply: &TransactionReply) -> Result<(), TransportError> {
        let radio = &self.0;
        let mut state = radio.state.lock();
        let Some(pending) = state.pending.remove(&reply.request_id) else {
            return Err(TransportError::Rejected(format!(
                "no pending request {}",
                reply.request_id
            )));
        };
        let device = radio.peripheral_device.clone();
        let event = match pending {
            PendingRequest::Read {
                service,
                characteristic,
            } => CentralEvent::CharacteristicRead {
                device,
                status: reply.status,
                characteristic: Characteristic::new(service, characteristic, reply.value.clone()),
            },
            PendingRequest::Write {
                service,
                characteristic,
            } => CentralEvent::CharacteristicWritten {
                device,
                status: reply.status,
                characteristic: Characteristic::new(service, characteristic, reply.value.clone()),
            },
            PendingRequest::Descriptor {
                characteristic,
                descriptor,
            } => CentralEvent::DescriptorWritten {
                device,
                characteristic,
                descriptor,
                status: reply.status,
            },
        };
        radio.to_central(event);
        Ok(())
    }
}

/// Deliver queued radio events to both roles; runs until the radio is gone
/// or the task is aborted
pub async fn run_router(
    mut events: mpsc::UnboundedReceiver<RadioEvent>,
    central: CentralController<LoopbackCentral>,
    peripheral: Arc<Peripheral<LoopbackPeripheral>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            RadioEvent::Central(event) => central.handle_event(event),
            RadioEvent::Peripheral(event) => peripheral.handle_event(event),
        }
    }
    debug!("Loopback router finished");
}
