//! Peripheral lifecycle and event routing

use super::registry::PeripheralRegistry;
use super::session::{PeripheralSession, ValuePush};
use super::transport::{AdvertiseData, PeripheralEvent, PeripheralTransport};
use crate::config::{AdvertiseSettings, PeripheralConfig};
use crate::gatt::{CharId, DeviceId, ServiceId};
use crate::GattLinkError;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Callbacks from the peripheral role. Every method has an empty default.
pub trait PeripheralListener: Send + Sync {
    fn on_advertise_success(&self, _settings: &AdvertiseSettings) {}

    fn on_advertise_failure(&self, _code: i32) {}

    fn on_connection_state_changed(&self, _device: &DeviceId, _connected: bool) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPeripheralListener;

impl PeripheralListener for NoopPeripheralListener {}

/// A GATT server advertising the registered services
pub struct Peripheral<T: PeripheralTransport> {
    transport: Arc<T>,
    session: PeripheralSession,
    config: PeripheralConfig,
    listener: Arc<dyn PeripheralListener>,
    running: Mutex<bool>,
}

impl<T: PeripheralTransport> Peripheral<T> {
    pub fn new(
        transport: Arc<T>,
        registry: PeripheralRegistry,
        config: PeripheralConfig,
        listener: Arc<dyn PeripheralListener>,
    ) -> Self {
        Self {
            transport,
            session: PeripheralSession::new(Arc::new(registry)),
            config,
            listener,
            running: Mutex::new(false),
        }
    }

    pub fn session(&self) -> &PeripheralSession {
        &self.session
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock()
    }

    /// Open the server, add every service and start advertising.
    ///
    /// The peripheral counts as running while it is brought up, so platform
    /// callbacks delivered during `start` are served.
    pub fn start(&self) -> Result<(), GattLinkError> {
        {
            let mut running = self.running.lock();
            if *running {
                return Err(GattLinkError::InvalidState(
                    "peripheral is already running".to_string(),
                ));
            }
            *running = true;
        }

        match self.bring_up() {
            Ok(count) => {
                info!("Peripheral started ({} services)", count);
                Ok(())
            }
            Err(err) => {
                *self.running.lock() = false;
                Err(err)
            }
        }
    }

    fn bring_up(&self) -> Result<usize, GattLinkError> {
        self.transport.open_server()?;
        for service in self.session.registry().service_descriptors() {
            if let Err(err) = self.transport.add_service(&service) {
                warn!("Failed to add service {}: {}", service.id, err);
                self.release_server();
                return Err(err.into());
            }
        }

        let data = AdvertiseData {
            service_ids: self.session.registry().service_ids(),
            include_tx_power: self.config.advertise.include_tx_power,
        };
        if let Err(err) = self.transport.start_advertising(&self.config.advertise, &data) {
            warn!("Failed to start advertising: {}", err);
            self.release_server();
            return Err(err.into());
        }
        Ok(data.service_ids.len())
    }

    /// Returns false if the peripheral was not running
    pub fn stop(&self) -> bool {
        if !self.take_running() {
            return false;
        }
        self.release_server();
        self.transport.stop_advertising();
        info!("Peripheral stopped");
        true
    }

    /// Clear the running flag; true if it was set
    fn take_running(&self) -> bool {
        std::mem::replace(&mut *self.running.lock(), false)
    }

    fn release_server(&self) {
        self.transport.clear_services();
        self.transport.close_server();
    }

    /// Store a server-side value and notify subscribers; returns pushes sent
    pub fn update_value(&self, service: ServiceId, characteristic: CharId, value: Vec<u8>) -> usize {
        if !self.is_running() {
            debug!("Peripheral not running, ignoring update of {}", characteristic);
            return 0;
        }
        let pushes = self.session.update_value(service, characteristic, value);
        self.push_all(&pushes)
    }

    /// Feed one platform callback into the peripheral
    pub fn handle_event(&self, event: PeripheralEvent) {
        if !self.is_running() {
            debug!("Peripheral not running, dropping {:?}", event);
            return;
        }
        match event {
            PeripheralEvent::AdvertiseStarted => {
                info!("Advertising started");
                self.listener.on_advertise_success(&self.config.advertise);
            }
            PeripheralEvent::AdvertiseFailed { code } => {
                warn!("Advertising failed with code {}", code);
                if self.take_running() {
                    self.release_server();
                }
                self.listener.on_advertise_failure(code);
            }
            PeripheralEvent::ServiceAdded { service_id, status } => {
                if status.is_success() {
                    debug!("Service {} added", service_id);
                } else {
                    warn!("Service {} not added: {}", service_id, status);
                }
            }
            PeripheralEvent::LinkStateChanged { device, connected } => {
                debug!("Link to {} {}", device, if connected { "up" } else { "down" });
                if !connected {
                    self.session.on_link_lost(&device);
                }
                self.listener.on_connection_state_changed(&device, connected);
            }
            PeripheralEvent::ReadRequest(request) => {
                if let Some(reply) = self.session.on_read_request(request) {
                    self.reply(&reply);
                }
            }
            PeripheralEvent::WriteRequest(request) => {
                if let Some(outcome) = self.session.on_write_request(request) {
                    self.push_all(&outcome.pushes);
                    if let Some(reply) = outcome.reply {
                        self.reply(&reply);
                    }
                }
            }
            PeripheralEvent::DescriptorWriteRequest(request) => {
                if let Some(reply) = self.session.on_descriptor_write_request(request) {
                    self.reply(&reply);
                }
            }
        }
    }

    fn reply(&self, reply: &super::request::TransactionReply) {
        if let Err(err) = self.transport.send_reply(reply) {
            warn!("Reply {} to {} failed: {}", reply.request_id, reply.device, err);
        }
    }

    fn push_all(&self, pushes: &[ValuePush]) -> usize {
        pushes
            .iter()
            .filter(|push| {
                match self.transport.notify_characteristic_changed(
                    &push.device,
                    push.service_id,
                    push.characteristic,
                    &push.value,
                    false,
                ) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!("Push to {} failed: {}", push.device, err);
                        false
                    }
                }
            })
            .count()
    }
}
