//! Central connection state machine
//!
//! One [`Connection`] represents one physical link. Every input (an
//! application call or a platform event) goes through a method that mutates
//! the state and returns the [`Effect`]s to carry out: transport commands
//! and listener notices. Nothing here performs I/O.

use super::capability::{CapabilitySpec, CharRole};
use super::transport::{CentralEvent, DiscoveredCharacteristic, DiscoveredService, WriteType};
use crate::gatt::{
    CharId, Characteristic, DeviceId, GattStatus, ServiceId, TransportError,
    CLIENT_CONFIG_DESCRIPTOR_UUID, ENABLE_NOTIFICATION_VALUE,
};
use crate::GattLinkError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// STATES AND REASONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Ready,
    Connecting,
    Connected,
    Closing,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Ready => write!(f, "Ready"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Closing => write!(f, "Closing"),
            ConnectionState::Error => write!(f, "Error"),
        }
    }
}

/// Outward reason attached to every terminal disconnect notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// Local side called `close()`
    Normal,
    /// Peer dropped the link
    Remote,
    /// Discovered shape did not satisfy the capability spec
    ConditionMismatch,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Normal => write!(f, "NORMAL"),
            DisconnectReason::Remote => write!(f, "REMOTE"),
            DisconnectReason::ConditionMismatch => write!(f, "CONDITION_MISMATCH"),
        }
    }
}

// ============================================================================
// PENDING SUBSCRIPTIONS
// ============================================================================

/// One configuration-descriptor write still to be sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEnable {
    pub characteristic: CharId,
    pub descriptor: Uuid,
    pub value: Vec<u8>,
}

impl SubscriptionEnable {
    pub fn enable(characteristic: CharId) -> Self {
        Self {
            characteristic,
            descriptor: CLIENT_CONFIG_DESCRIPTOR_UUID,
            value: ENABLE_NOTIFICATION_VALUE.to_vec(),
        }
    }
}

/// Ordered subscription-enable operations awaiting their turn on the link
#[derive(Debug, Default)]
pub struct PendingSubscriptionQueue {
    queue: VecDeque<SubscriptionEnable>,
}

impl PendingSubscriptionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn enqueue(&mut self, op: SubscriptionEnable) {
        self.queue.push_back(op);
    }

    pub fn dequeue(&mut self) -> Option<SubscriptionEnable> {
        self.queue.pop_front()
    }

    pub fn peek(&self) -> Option<&SubscriptionEnable> {
        self.queue.front()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

// ============================================================================
// EFFECTS AND INPUTS
// ============================================================================

/// Transport call requested by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattCommand {
    Connect(DeviceId),
    DiscoverServices(DeviceId),
    EnableNotification {
        device: DeviceId,
        service: ServiceId,
        characteristic: CharId,
    },
    WriteDescriptor {
        device: DeviceId,
        service: ServiceId,
        characteristic: CharId,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    Read {
        device: DeviceId,
        service: ServiceId,
        characteristic: CharId,
    },
    Write {
        device: DeviceId,
        service: ServiceId,
        characteristic: CharId,
        value: Vec<u8>,
        write_type: WriteType,
    },
    Disconnect(DeviceId),
    CloseLink(DeviceId),
}

impl fmt::Display for GattCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GattCommand::Connect(device) => write!(f, "Connect({})", device),
            GattCommand::DiscoverServices(device) => write!(f, "DiscoverServices({})", device),
            GattCommand::EnableNotification { characteristic, .. } => {
                write!(f, "EnableNotification({})", characteristic)
            }
            GattCommand::WriteDescriptor { characteristic, .. } => {
                write!(f, "WriteDescriptor({})", characteristic)
            }
            GattCommand::Read { characteristic, .. } => write!(f, "Read({})", characteristic),
            GattCommand::Write {
                characteristic,
                value,
                ..
            } => write!(f, "Write({}, {} bytes)", characteristic, value.len()),
            GattCommand::Disconnect(device) => write!(f, "Disconnect({})", device),
            GattCommand::CloseLink(device) => write!(f, "CloseLink({})", device),
        }
    }
}

/// Listener-facing outcome produced by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionNotice {
    Connected,
    /// Subscription queue drained; the link is idle
    SubscriptionsReady,
    Disconnected {
        reason: DisconnectReason,
        message: String,
    },
    CharacteristicChanged(Characteristic),
    CharacteristicRead {
        success: bool,
        characteristic: Characteristic,
    },
    CharacteristicWritten {
        success: bool,
        characteristic: Characteristic,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Command(GattCommand),
    Notify(ConnectionNotice),
}

/// Link-scoped input to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    LinkUp,
    LinkDown,
    /// The local close of the link has completed
    LinkReleased,
    ServicesDiscovered {
        status: GattStatus,
        services: Vec<DiscoveredService>,
    },
    CharacteristicChanged(Characteristic),
    CharacteristicRead {
        status: GattStatus,
        characteristic: Characteristic,
    },
    CharacteristicWritten {
        status: GattStatus,
        characteristic: Characteristic,
    },
    DescriptorWritten {
        characteristic: CharId,
        status: GattStatus,
    },
    /// A command was refused synchronously by the transport
    CommandFailed {
        command: GattCommand,
        error: TransportError,
    },
}

impl LinkEvent {
    /// Link-scoped part of a platform event; scan events yield `None`
    pub fn from_central(event: CentralEvent) -> Option<Self> {
        match event {
            CentralEvent::ScanResult(_) | CentralEvent::ScanFailed { .. } => None,
            CentralEvent::LinkStateChanged { connected, .. } => Some(if connected {
                LinkEvent::LinkUp
            } else {
                LinkEvent::LinkDown
            }),
            CentralEvent::ServicesDiscovered {
                status, services, ..
            } => Some(LinkEvent::ServicesDiscovered { status, services }),
            CentralEvent::CharacteristicChanged { characteristic, .. } => {
                Some(LinkEvent::CharacteristicChanged(characteristic))
            }
            CentralEvent::CharacteristicRead {
                status,
                characteristic,
                ..
            } => Some(LinkEvent::CharacteristicRead {
                status,
                characteristic,
            }),
            CentralEvent::CharacteristicWritten {
                status,
                characteristic,
                ..
            } => Some(LinkEvent::CharacteristicWritten {
                status,
                characteristic,
            }),
            CentralEvent::DescriptorWritten {
                characteristic,
                status,
                ..
            } => Some(LinkEvent::DescriptorWritten {
                characteristic,
                status,
            }),
        }
    }
}

// ============================================================================
// PER-LINK STATE
// ============================================================================

/// The single GATT request allowed on the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InFlight {
    Subscription(CharId),
    Read(CharId),
    Write(CharId),
}

type ResolvedRoles = HashMap<CharRole, HashMap<CharId, DiscoveredCharacteristic>>;

#[derive(Debug)]
struct LinkSession {
    device: DeviceId,
    resolved: ResolvedRoles,
    pending: PendingSubscriptionQueue,
    in_flight: Option<InFlight>,
    initial_done: bool,
}

impl LinkSession {
    fn resolves(&self, role: CharRole, id: &CharId) -> bool {
        self.resolved
            .get(&role)
            .map_or(false, |table| table.contains_key(id))
    }

    /// Send the next queued subscription if the link is free
    fn pump(&mut self, service: ServiceId) -> Vec<Effect> {
        if self.in_flight.is_some() {
            return Vec::new();
        }
        match self.pending.dequeue() {
            Some(op) => {
                debug!("Enabling subscription for {}", op.characteristic);
                self.in_flight = Some(InFlight::Subscription(op.characteristic));
                vec![Effect::Command(GattCommand::WriteDescriptor {
                    device: self.device.clone(),
                    service,
                    characteristic: op.characteristic,
                    descriptor: op.descriptor,
                    value: op.value,
                })]
            }
            None if !self.initial_done => {
                self.initial_done = true;
                info!("Subscriptions ready on {}", self.device);
                vec![Effect::Notify(ConnectionNotice::SubscriptionsReady)]
            }
            None => Vec::new(),
        }
    }
}

#[derive(Debug)]
enum Phase {
    Ready,
    Connecting {
        device: DeviceId,
        link_up: bool,
    },
    Connected(LinkSession),
    Closing {
        device: DeviceId,
    },
    Error {
        device: DeviceId,
        reason: DisconnectReason,
        message: String,
    },
}

/// Check the discovered table against the capability spec, fail-fast in role order
fn resolve(spec: &CapabilitySpec, services: &[DiscoveredService]) -> Result<ResolvedRoles, String> {
    let service = services
        .iter()
        .find(|s| s.id == spec.service_id())
        .ok_or_else(|| format!("service not found: {}", spec.service_id()))?;

    let mut resolved = ResolvedRoles::new();
    for role in CharRole::ALL {
        let mut table = HashMap::new();
        for id in spec.characteristics(role) {
            let ch = service
                .characteristic(id)
                .ok_or_else(|| format!("characteristic not found: {}", id))?;
            if !ch.properties.contains(role.required_property()) {
                return Err(format!("characteristic {} does not support {}", id, role));
            }
            if role == CharRole::Observe && !ch.has_config_descriptor() {
                return Err(format!(
                    "characteristic {} has no client configuration descriptor",
                    id
                ));
            }
            table.insert(*id, ch.clone());
        }
        resolved.insert(role, table);
    }
    Ok(resolved)
}

// ============================================================================
// CONNECTION
// ============================================================================

pub struct Connection {
    spec: Arc<CapabilitySpec>,
    phase: Phase,
}

impl Connection {
    pub fn new(spec: Arc<CapabilitySpec>) -> Self {
        Self {
            spec,
            phase: Phase::Ready,
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self.phase {
            Phase::Ready => ConnectionState::Ready,
            Phase::Connecting { .. } => ConnectionState::Connecting,
            Phase::Connected(_) => ConnectionState::Connected,
            Phase::Closing { .. } => ConnectionState::Closing,
            Phase::Error { .. } => ConnectionState::Error,
        }
    }

    pub fn spec(&self) -> &CapabilitySpec {
        &self.spec
    }

    /// Device of the current link, if any
    pub fn device(&self) -> Option<&DeviceId> {
        match &self.phase {
            Phase::Ready => None,
            Phase::Connecting { device, .. }
            | Phase::Closing { device }
            | Phase::Error { device, .. } => Some(device),
            Phase::Connected(session) => Some(&session.device),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.phase, Phase::Connected(_))
    }

    /// True once every connect-time subscription has completed
    pub fn is_initial_interaction_done(&self) -> bool {
        matches!(&self.phase, Phase::Connected(session) if session.initial_done)
    }

    pub fn pending_subscriptions(&self) -> usize {
        match &self.phase {
            Phase::Connected(session) => session.pending.len(),
            _ => 0,
        }
    }

    /// Drop all per-link state and return to `Ready`
    pub fn clear(&mut self) {
        if let Phase::Connected(session) = &mut self.phase {
            session.pending.clear();
            session.resolved.clear();
        }
        self.phase = Phase::Ready;
    }

    pub fn connect(&mut self, device: DeviceId) -> Result<Vec<Effect>, GattLinkError> {
        if !matches!(self.phase, Phase::Ready) {
            return Err(GattLinkError::InvalidState(format!(
                "cannot connect while {}",
                self.state()
            )));
        }
        info!("Connecting to {}", device);
        self.phase = Phase::Connecting {
            device: device.clone(),
            link_up: false,
        };
        Ok(vec![Effect::Command(GattCommand::Connect(device))])
    }

    /// Tear down the link locally; safe from any state.
    ///
    /// A live link stays `Closing` until `LinkReleased` (or a link-down)
    /// completes the teardown and reports `Normal`.
    pub fn close(&mut self) -> Vec<Effect> {
        match std::mem::replace(&mut self.phase, Phase::Ready) {
            Phase::Ready => Vec::new(),
            closing @ Phase::Closing { .. } => {
                self.phase = closing;
                Vec::new()
            }
            Phase::Connecting { device, .. } | Phase::Connected(LinkSession { device, .. }) => {
                debug!("Closing link to {}", device);
                self.phase = Phase::Closing {
                    device: device.clone(),
                };
                vec![Effect::Command(GattCommand::CloseLink(device))]
            }
            Phase::Error {
                device,
                reason,
                message,
            } => {
                debug!("Closing failed link to {}", device);
                self.clear();
                vec![
                    Effect::Command(GattCommand::CloseLink(device)),
                    Effect::Notify(ConnectionNotice::Disconnected { reason, message }),
                ]
            }
        }
    }

    pub fn read(&mut self, id: CharId) -> Result<Vec<Effect>, GattLinkError> {
        let service = self.spec.service_id();
        let session = self.request_slot(CharRole::Read, &id)?;
        session.in_flight = Some(InFlight::Read(id));
        Ok(vec![Effect::Command(GattCommand::Read {
            device: session.device.clone(),
            service,
            characteristic: id,
        })])
    }

    /// Write with response to a declared writable characteristic
    pub fn write(&mut self, id: CharId, value: Vec<u8>) -> Result<Vec<Effect>, GattLinkError> {
        self.write_as(CharRole::Write, id, value, WriteType::WithResponse)
    }

    /// Write without response to a declared sendable characteristic
    pub fn send(&mut self, id: CharId, value: Vec<u8>) -> Result<Vec<Effect>, GattLinkError> {
        self.write_as(CharRole::Send, id, value, WriteType::WithoutResponse)
    }

    fn write_as(
        &mut self,
        role: CharRole,
        id: CharId,
        value: Vec<u8>,
        write_type: WriteType,
    ) -> Result<Vec<Effect>, GattLinkError> {
        let service = self.spec.service_id();
        let session = self.request_slot(role, &id)?;
        session.in_flight = Some(InFlight::Write(id));
        Ok(vec![Effect::Command(GattCommand::Write {
            device: session.device.clone(),
            service,
            characteristic: id,
            value,
            write_type,
        })])
    }

    fn request_slot(&mut self, role: CharRole, id: &CharId) -> Result<&mut LinkSession, GattLinkError> {
        let Phase::Connected(session) = &mut self.phase else {
            return Err(GattLinkError::InvalidState(
                "connection is not available".to_string(),
            ));
        };
        if !session.resolves(role, id) {
            return Err(GattLinkError::InvalidState(format!(
                "characteristic {} is not declared for {}",
                id, role
            )));
        }
        if let Some(op) = session.in_flight {
            return Err(GattLinkError::InvalidState(format!(
                "GATT request already in flight: {:?}",
                op
            )));
        }
        Ok(session)
    }

    /// Feed one link event through the state machine
    pub fn handle(&mut self, event: LinkEvent) -> Vec<Effect> {
        match event {
            LinkEvent::LinkUp => self.on_link_up(),
            LinkEvent::LinkDown => self.on_link_down(),
            LinkEvent::LinkReleased => self.on_link_released(),
            LinkEvent::ServicesDiscovered { status, services } => {
                self.on_services_discovered(status, &services)
            }
            LinkEvent::CharacteristicChanged(characteristic) => {
                if self.is_connected() {
                    vec![Effect::Notify(ConnectionNotice::CharacteristicChanged(
                        characteristic,
                    ))]
                } else {
                    debug!("Ignoring value change while {}", self.state());
                    Vec::new()
                }
            }
            LinkEvent::CharacteristicRead {
                status,
                characteristic,
            } => self.on_request_complete(
                InFlight::Read(characteristic.id),
                Some(ConnectionNotice::CharacteristicRead {
                    success: status.is_success(),
                    characteristic,
                }),
            ),
            LinkEvent::CharacteristicWritten {
                status,
                characteristic,
            } => self.on_request_complete(
                InFlight::Write(characteristic.id),
                Some(ConnectionNotice::CharacteristicWritten {
                    success: status.is_success(),
                    characteristic,
                }),
            ),
            LinkEvent::DescriptorWritten {
                characteristic,
                status,
            } => {
                if !status.is_success() {
                    warn!(
                        "Subscription enable for {} completed with {}",
                        characteristic, status
                    );
                }
                self.on_request_complete(InFlight::Subscription(characteristic), None)
            }
            LinkEvent::CommandFailed { command, error } => self.on_command_failed(command, error),
        }
    }

    fn on_link_up(&mut self) -> Vec<Effect> {
        let state = self.state();
        match &mut self.phase {
            Phase::Connecting { device, link_up } if !*link_up => {
                *link_up = true;
                info!("Link up with {}, discovering services", device);
                vec![Effect::Command(GattCommand::DiscoverServices(
                    device.clone(),
                ))]
            }
            _ => {
                debug!("Ignoring link-up while {}", state);
                Vec::new()
            }
        }
    }

    fn on_link_released(&mut self) -> Vec<Effect> {
        match std::mem::replace(&mut self.phase, Phase::Ready) {
            Phase::Closing { device } => self.finish_close(device),
            other => {
                self.phase = other;
                Vec::new()
            }
        }
    }

    fn finish_close(&mut self, device: DeviceId) -> Vec<Effect> {
        debug!("Link to {} released", device);
        self.clear();
        vec![Effect::Notify(ConnectionNotice::Disconnected {
            reason: DisconnectReason::Normal,
            message: String::new(),
        })]
    }

    fn on_link_down(&mut self) -> Vec<Effect> {
        match std::mem::replace(&mut self.phase, Phase::Ready) {
            Phase::Ready => Vec::new(),
            Phase::Closing { device } => self.finish_close(device),
            Phase::Connecting { device, .. } | Phase::Connected(LinkSession { device, .. }) => {
                warn!("Link to {} lost", device);
                self.clear();
                vec![
                    Effect::Command(GattCommand::CloseLink(device)),
                    Effect::Notify(ConnectionNotice::Disconnected {
                        reason: DisconnectReason::Remote,
                        message: GattLinkError::RemoteDisconnect.to_string(),
                    }),
                ]
            }
            Phase::Error {
                device,
                reason,
                message,
            } => {
                info!("Link to {} torn down after error", device);
                self.clear();
                vec![
                    Effect::Command(GattCommand::CloseLink(device)),
                    Effect::Notify(ConnectionNotice::Disconnected { reason, message }),
                ]
            }
        }
    }

    fn on_services_discovered(
        &mut self,
        status: GattStatus,
        services: &[DiscoveredService],
    ) -> Vec<Effect> {
        let Phase::Connecting {
            device,
            link_up: true,
        } = &self.phase
        else {
            debug!("Ignoring discovery result while {}", self.state());
            return Vec::new();
        };
        let device = device.clone();

        if !status.is_success() {
            return self.fail(
                DisconnectReason::ConditionMismatch,
                format!("service discovery failed: {}", status),
            );
        }

        let resolved = match resolve(&self.spec, services) {
            Ok(resolved) => resolved,
            Err(message) => return self.fail(DisconnectReason::ConditionMismatch, message),
        };

        let service = self.spec.service_id();
        let mut effects = Vec::new();
        let mut pending = PendingSubscriptionQueue::new();
        for id in self.spec.observable() {
            effects.push(Effect::Command(GattCommand::EnableNotification {
                device: device.clone(),
                service,
                characteristic: *id,
            }));
            pending.enqueue(SubscriptionEnable::enable(*id));
        }
        info!(
            "Connected to {} ({} subscriptions pending)",
            device,
            pending.len()
        );
        effects.push(Effect::Notify(ConnectionNotice::Connected));

        let mut session = LinkSession {
            device,
            resolved,
            pending,
            in_flight: None,
            initial_done: false,
        };
        effects.extend(session.pump(service));
        self.phase = Phase::Connected(session);
        effects
    }

    fn on_request_complete(&mut self, op: InFlight, notice: Option<ConnectionNotice>) -> Vec<Effect> {
        let service = self.spec.service_id();
        let Phase::Connected(session) = &mut self.phase else {
            debug!("Ignoring completion of {:?} outside Connected", op);
            return Vec::new();
        };
        if session.in_flight == Some(op) {
            session.in_flight = None;
        } else {
            debug!("Completion of {:?} without a matching request", op);
        }

        let mut effects: Vec<Effect> = notice.map(Effect::Notify).into_iter().collect();
        effects.extend(session.pump(service));
        effects
    }

    fn on_command_failed(&mut self, command: GattCommand, error: TransportError) -> Vec<Effect> {
        warn!("{} failed: {}", command, error);
        match command {
            GattCommand::Connect(_) => match std::mem::replace(&mut self.phase, Phase::Ready) {
                Phase::Connecting { .. } => {
                    self.clear();
                    vec![Effect::Notify(ConnectionNotice::Disconnected {
                        reason: DisconnectReason::Remote,
                        message: format!("connect failed: {}", error),
                    })]
                }
                other => {
                    self.phase = other;
                    Vec::new()
                }
            },
            GattCommand::DiscoverServices(_) => self.fail(
                DisconnectReason::ConditionMismatch,
                format!("service discovery failed: {}", error),
            ),
            GattCommand::EnableNotification { characteristic, .. } => self.fail(
                DisconnectReason::ConditionMismatch,
                format!(
                    "failed to register notification for {}: {}",
                    characteristic, error
                ),
            ),
            GattCommand::WriteDescriptor { characteristic, .. } => self.fail(
                DisconnectReason::ConditionMismatch,
                format!(
                    "failed to enable subscription for {}: {}",
                    characteristic, error
                ),
            ),
            GattCommand::Read {
                service,
                characteristic,
                ..
            } => self.on_request_complete(
                InFlight::Read(characteristic),
                Some(ConnectionNotice::CharacteristicRead {
                    success: false,
                    characteristic: Characteristic::new(service, characteristic, Vec::new()),
                }),
            ),
            GattCommand::Write {
                service,
                characteristic,
                value,
                ..
            } => self.on_request_complete(
                InFlight::Write(characteristic),
                Some(ConnectionNotice::CharacteristicWritten {
                    success: false,
                    characteristic: Characteristic::new(service, characteristic, value),
                }),
            ),
            // no graceful teardown available; release now and report
            GattCommand::Disconnect(_) => match std::mem::replace(&mut self.phase, Phase::Ready) {
                Phase::Error {
                    device,
                    reason,
                    message,
                } => {
                    self.clear();
                    vec![
                        Effect::Command(GattCommand::CloseLink(device)),
                        Effect::Notify(ConnectionNotice::Disconnected { reason, message }),
                    ]
                }
                other => {
                    self.phase = other;
                    Vec::new()
                }
            },
            GattCommand::CloseLink(_) => Vec::new(),
        }
    }

    /// Record the failure and ask the platform to drop the link
    fn fail(&mut self, reason: DisconnectReason, message: String) -> Vec<Effect> {
        let device = match std::mem::replace(&mut self.phase, Phase::Ready) {
            Phase::Connecting { device, .. } | Phase::Connected(LinkSession { device, .. }) => {
                device
            }
            settled @ (Phase::Error { .. } | Phase::Closing { .. }) => {
                self.phase = settled;
                return Vec::new();
            }
            Phase::Ready => return Vec::new(),
        };
        warn!("Connection to {} aborted: {}", device, message);
        self.phase = Phase::Error {
            device: device.clone(),
            reason,
            message,
        };
        vec![Effect::Command(GattCommand::Disconnect(device))]
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("service", &self.spec.service_id())
            .field("state", &self.state())
            .field("device", &self.device())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::{uuid_from_short, CharProperties};
    use proptest::prelude::*;

    fn service() -> ServiceId {
        uuid_from_short(0xFFF0)
    }

    fn c1() -> CharId {
        uuid_from_short(0xFFF1)
    }

    fn c2() -> CharId {
        uuid_from_short(0xFFF2)
    }

    fn device() -> DeviceId {
        DeviceId::from("AA:BB:CC:DD:EE:FF")
    }

    /// One observable C1 and one writable C2
    fn scenario_spec() -> Arc<CapabilitySpec> {
        Arc::new(
            CapabilitySpec::builder(service())
                .observable(c1())
                .writable(c2())
                .build(),
        )
    }

    fn notifying(id: CharId) -> DiscoveredCharacteristic {
        DiscoveredCharacteristic::new(id, CharProperties::NOTIFY).with_config_descriptor()
    }

    fn discovered(chars: Vec<DiscoveredCharacteristic>) -> LinkEvent {
        LinkEvent::ServicesDiscovered {
            status: GattStatus::Success,
            services: vec![DiscoveredService::new(service(), chars)],
        }
    }

    fn linked(spec: Arc<CapabilitySpec>) -> Connection {
        let mut conn = Connection::new(spec);
        conn.connect(device()).expect("connect from Ready");
        conn.handle(LinkEvent::LinkUp);
        conn
    }

    fn connected() -> Connection {
        let mut conn = linked(scenario_spec());
        conn.handle(discovered(vec![
            notifying(c1()),
            DiscoveredCharacteristic::new(c2(), CharProperties::WRITE),
        ]));
        conn.handle(LinkEvent::DescriptorWritten {
            characteristic: c1(),
            status: GattStatus::Success,
        });
        assert!(conn.is_initial_interaction_done());
        conn
    }

    fn commands(effects: &[Effect]) -> Vec<&GattCommand> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Command(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    fn notices(effects: &[Effect]) -> Vec<&ConnectionNotice> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Notify(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_connect_requires_ready() {
        let mut conn = Connection::new(scenario_spec());
        let effects = conn.connect(device()).expect("connect from Ready");
        assert_eq!(
            effects,
            vec![Effect::Command(GattCommand::Connect(device()))]
        );
        assert_eq!(conn.state(), ConnectionState::Connecting);

        let err = conn.connect(device()).unwrap_err();
        assert!(matches!(err, GattLinkError::InvalidState(_)));
    }

    #[test]
    fn test_link_up_triggers_discovery_once() {
        let mut conn = Connection::new(scenario_spec());
        conn.connect(device()).expect("connect");
        assert_eq!(
            conn.handle(LinkEvent::LinkUp),
            vec![Effect::Command(GattCommand::DiscoverServices(device()))]
        );
        assert!(conn.handle(LinkEvent::LinkUp).is_empty());
    }

    #[test]
    fn test_missing_notify_property_is_condition_mismatch() {
        let mut conn = linked(scenario_spec());
        let effects = conn.handle(discovered(vec![
            DiscoveredCharacteristic::new(c1(), CharProperties::READ).with_config_descriptor(),
            DiscoveredCharacteristic::new(c2(), CharProperties::WRITE),
        ]));

        assert_eq!(
            effects,
            vec![Effect::Command(GattCommand::Disconnect(device()))]
        );
        assert_eq!(conn.state(), ConnectionState::Error);

        let effects = conn.handle(LinkEvent::LinkDown);
        assert_eq!(
            notices(&effects),
            vec![&ConnectionNotice::Disconnected {
                reason: DisconnectReason::ConditionMismatch,
                message: format!("characteristic {} does not support NOTIFY", c1()),
            }]
        );
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[test]
    fn test_scenario_reaches_connected_and_drains() {
        let mut conn = linked(scenario_spec());
        let effects = conn.handle(discovered(vec![
            notifying(c1()),
            DiscoveredCharacteristic::new(c2(), CharProperties::WRITE),
        ]));

        assert_eq!(
            effects,
            vec![
                Effect::Command(GattCommand::EnableNotification {
                    device: device(),
                    service: service(),
                    characteristic: c1(),
                }),
                Effect::Notify(ConnectionNotice::Connected),
                Effect::Command(GattCommand::WriteDescriptor {
                    device: device(),
                    service: service(),
                    characteristic: c1(),
                    descriptor: CLIENT_CONFIG_DESCRIPTOR_UUID,
                    value: vec![0x01, 0x00],
                }),
            ]
        );
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(!conn.is_initial_interaction_done());

        let effects = conn.handle(LinkEvent::DescriptorWritten {
            characteristic: c1(),
            status: GattStatus::Success,
        });
        assert_eq!(
            effects,
            vec![Effect::Notify(ConnectionNotice::SubscriptionsReady)]
        );
        assert!(conn.is_initial_interaction_done());
    }

    #[test]
    fn test_missing_service() {
        let mut conn = linked(scenario_spec());
        conn.handle(LinkEvent::ServicesDiscovered {
            status: GattStatus::Success,
            services: vec![DiscoveredService::new(uuid_from_short(0x180D), Vec::new())],
        });
        assert_eq!(conn.state(), ConnectionState::Error);
    }

    #[test]
    fn test_discovery_failure_status() {
        let mut conn = linked(scenario_spec());
        conn.handle(LinkEvent::ServicesDiscovered {
            status: GattStatus::Failure,
            services: Vec::new(),
        });
        assert_eq!(conn.state(), ConnectionState::Error);
    }

    #[test]
    fn test_observable_needs_config_descriptor() {
        let mut conn = linked(scenario_spec());
        conn.handle(discovered(vec![
            DiscoveredCharacteristic::new(c1(), CharProperties::NOTIFY),
            DiscoveredCharacteristic::new(c2(), CharProperties::WRITE),
        ]));
        assert_eq!(conn.state(), ConnectionState::Error);
    }

    #[test]
    fn test_subscriptions_drain_serially() {
        let ids: Vec<CharId> = (0..4).map(|i| uuid_from_short(0xFF10 + i)).collect();
        let spec = ids
            .iter()
            .fold(CapabilitySpec::builder(service()), |b, id| b.observable(*id))
            .build();
        let mut conn = linked(Arc::new(spec));

        let effects = conn.handle(discovered(ids.iter().map(|id| notifying(*id)).collect()));
        let writes: Vec<_> = commands(&effects)
            .into_iter()
            .filter(|c| matches!(c, GattCommand::WriteDescriptor { .. }))
            .collect();
        assert_eq!(writes.len(), 1);
        assert_eq!(conn.pending_subscriptions(), 3);

        let mut sent = vec![ids[0]];
        for _ in 0..4 {
            let last = *sent.last().expect("sent");
            let effects = conn.handle(LinkEvent::DescriptorWritten {
                characteristic: last,
                status: GattStatus::Success,
            });
            for cmd in commands(&effects) {
                if let GattCommand::WriteDescriptor { characteristic, .. } = cmd {
                    sent.push(*characteristic);
                }
            }
        }
        assert_eq!(sent, ids);
        assert!(conn.is_initial_interaction_done());
    }

    #[test]
    fn test_failed_descriptor_write_continues_drain() {
        let spec = CapabilitySpec::builder(service())
            .observable(c1())
            .observable(c2())
            .build();
        let mut conn = linked(Arc::new(spec));
        conn.handle(discovered(vec![notifying(c1()), notifying(c2())]));

        let effects = conn.handle(LinkEvent::DescriptorWritten {
            characteristic: c1(),
            status: GattStatus::Failure,
        });
        assert!(matches!(
            commands(&effects)[..],
            [GattCommand::WriteDescriptor { characteristic, .. }] if *characteristic == c2()
        ));
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_role_isolation() {
        let mut conn = connected();

        assert!(matches!(
            conn.read(c2()),
            Err(GattLinkError::InvalidState(_))
        ));
        assert!(matches!(
            conn.send(c2(), vec![1]),
            Err(GattLinkError::InvalidState(_))
        ));
        assert!(matches!(
            conn.write(c1(), vec![1]),
            Err(GattLinkError::InvalidState(_))
        ));

        let effects = conn.write(c2(), vec![7]).expect("declared writable");
        assert_eq!(
            effects,
            vec![Effect::Command(GattCommand::Write {
                device: device(),
                service: service(),
                characteristic: c2(),
                value: vec![7],
                write_type: WriteType::WithResponse,
            })]
        );
    }

    #[test]
    fn test_operations_rejected_when_not_connected() {
        let mut conn = Connection::new(scenario_spec());
        assert!(conn.write(c2(), vec![1]).is_err());
        conn.connect(device()).expect("connect");
        assert!(conn.write(c2(), vec![1]).is_err());
    }

    #[test]
    fn test_one_request_in_flight() {
        let mut conn = connected();
        conn.write(c2(), vec![1]).expect("first write");
        let err = conn.write(c2(), vec![2]).unwrap_err();
        assert!(matches!(err, GattLinkError::InvalidState(_)));

        let written = Characteristic::new(service(), c2(), vec![1]);
        let effects = conn.handle(LinkEvent::CharacteristicWritten {
            status: GattStatus::Success,
            characteristic: written.clone(),
        });
        assert_eq!(
            effects,
            vec![Effect::Notify(ConnectionNotice::CharacteristicWritten {
                success: true,
                characteristic: written,
            })]
        );
        assert!(conn.write(c2(), vec![2]).is_ok());
    }

    #[test]
    fn test_requests_rejected_during_drain() {
        let mut conn = linked(scenario_spec());
        conn.handle(discovered(vec![
            notifying(c1()),
            DiscoveredCharacteristic::new(c2(), CharProperties::WRITE),
        ]));
        assert!(matches!(
            conn.write(c2(), vec![1]),
            Err(GattLinkError::InvalidState(_))
        ));
    }

    #[test]
    fn test_remote_disconnect() {
        let mut conn = connected();
        let effects = conn.handle(LinkEvent::LinkDown);
        assert_eq!(
            effects,
            vec![
                Effect::Command(GattCommand::CloseLink(device())),
                Effect::Notify(ConnectionNotice::Disconnected {
                    reason: DisconnectReason::Remote,
                    message: GattLinkError::RemoteDisconnect.to_string(),
                }),
            ]
        );
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(conn.device(), None);
    }

    #[test]
    fn test_close_reports_normal() {
        let mut conn = connected();
        assert_eq!(
            conn.close(),
            vec![Effect::Command(GattCommand::CloseLink(device()))]
        );
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert_eq!(conn.device(), Some(&device()));
        assert_eq!(conn.pending_subscriptions(), 0);
        assert!(conn.close().is_empty());
        assert!(matches!(
            conn.write(c2(), vec![1]),
            Err(GattLinkError::InvalidState(_))
        ));

        assert_eq!(
            conn.handle(LinkEvent::LinkReleased),
            vec![Effect::Notify(ConnectionNotice::Disconnected {
                reason: DisconnectReason::Normal,
                message: String::new(),
            })]
        );
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(conn.device(), None);

        assert!(conn.close().is_empty());
        assert!(conn.handle(LinkEvent::LinkDown).is_empty());
        assert!(conn.handle(LinkEvent::LinkReleased).is_empty());
    }

    #[test]
    fn test_link_down_while_closing_is_normal() {
        let mut conn = connected();
        conn.close();
        let effects = conn.handle(LinkEvent::LinkDown);
        assert!(commands(&effects).is_empty());
        assert_eq!(
            notices(&effects),
            vec![&ConnectionNotice::Disconnected {
                reason: DisconnectReason::Normal,
                message: String::new(),
            }]
        );
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[test]
    fn test_release_ignored_outside_closing() {
        let mut conn = connected();
        assert!(conn.handle(LinkEvent::LinkReleased).is_empty());
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_close_in_error_reports_recorded_reason() {
        let mut conn = linked(scenario_spec());
        conn.handle(discovered(Vec::new()));
        assert_eq!(conn.state(), ConnectionState::Error);

        let effects = conn.close();
        assert!(matches!(
            notices(&effects)[..],
            [ConnectionNotice::Disconnected {
                reason: DisconnectReason::ConditionMismatch,
                ..
            }]
        ));
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[test]
    fn test_value_changes_only_while_connected() {
        let changed = Characteristic::new(service(), c1(), vec![9]);
        let mut conn = linked(scenario_spec());
        assert!(conn
            .handle(LinkEvent::CharacteristicChanged(changed.clone()))
            .is_empty());

        let mut conn = connected();
        assert_eq!(
            conn.handle(LinkEvent::CharacteristicChanged(changed.clone())),
            vec![Effect::Notify(ConnectionNotice::CharacteristicChanged(
                changed
            ))]
        );
    }

    #[test]
    fn test_failed_connect_reports_remote() {
        let mut conn = Connection::new(scenario_spec());
        conn.connect(device()).expect("connect");
        let effects = conn.handle(LinkEvent::CommandFailed {
            command: GattCommand::Connect(device()),
            error: TransportError::Unavailable,
        });
        assert!(matches!(
            notices(&effects)[..],
            [ConnectionNotice::Disconnected {
                reason: DisconnectReason::Remote,
                ..
            }]
        ));
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[test]
    fn test_failed_notification_registration_aborts() {
        let mut conn = linked(scenario_spec());
        conn.handle(discovered(vec![
            notifying(c1()),
            DiscoveredCharacteristic::new(c2(), CharProperties::WRITE),
        ]));
        let effects = conn.handle(LinkEvent::CommandFailed {
            command: GattCommand::EnableNotification {
                device: device(),
                service: service(),
                characteristic: c1(),
            },
            error: TransportError::Rejected("no slot".to_string()),
        });
        assert_eq!(
            effects,
            vec![Effect::Command(GattCommand::Disconnect(device()))]
        );
        assert_eq!(conn.state(), ConnectionState::Error);
    }

    #[test]
    fn test_failed_read_completes_unsuccessfully() {
        let spec = CapabilitySpec::builder(service()).readable(c1()).build();
        let mut conn = linked(Arc::new(spec));
        conn.handle(discovered(vec![DiscoveredCharacteristic::new(
            c1(),
            CharProperties::READ,
        )]));

        let effects = conn.read(c1()).expect("read");
        let Effect::Command(command) = effects[0].clone() else {
            panic!("expected command");
        };
        let effects = conn.handle(LinkEvent::CommandFailed {
            command,
            error: TransportError::NoLink(device()),
        });
        assert!(matches!(
            notices(&effects)[..],
            [ConnectionNotice::CharacteristicRead { success: false, .. }]
        ));
        assert!(conn.read(c1()).is_ok());
    }

    #[test]
    fn test_pending_queue_fifo() {
        let mut queue = PendingSubscriptionQueue::new();
        assert!(queue.is_empty());
        queue.enqueue(SubscriptionEnable::enable(c1()));
        queue.enqueue(SubscriptionEnable::enable(c2()));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.peek().map(|op| op.characteristic), Some(c1()));
        assert_eq!(queue.dequeue().map(|op| op.characteristic), Some(c1()));
        queue.clear();
        assert!(queue.is_empty());
    }

    fn props() -> impl Strategy<Value = CharProperties> {
        (0u8..32).prop_map(CharProperties::from_bits_truncate)
    }

    proptest! {
        #[test]
        fn prop_capability_gating(
            observe in props(),
            read in props(),
            write in props(),
            send in props(),
        ) {
            let ids: Vec<CharId> = (1..=4).map(|i| uuid_from_short(0xFFA0 + i)).collect();
            let spec = CapabilitySpec::builder(service())
                .observable(ids[0])
                .readable(ids[1])
                .writable(ids[2])
                .sendable(ids[3])
                .build();
            let mut conn = linked(Arc::new(spec));
            conn.handle(discovered(vec![
                DiscoveredCharacteristic::new(ids[0], observe).with_config_descriptor(),
                DiscoveredCharacteristic::new(ids[1], read),
                DiscoveredCharacteristic::new(ids[2], write),
                DiscoveredCharacteristic::new(ids[3], send),
            ]));

            let satisfied = observe.contains(CharProperties::NOTIFY)
                && read.contains(CharProperties::READ)
                && write.contains(CharProperties::WRITE)
                && send.contains(CharProperties::WRITE_NO_RESPONSE);
            let expected = if satisfied {
                ConnectionState::Connected
            } else {
                ConnectionState::Error
            };
            prop_assert_eq!(conn.state(), expected);
        }
    }
}
