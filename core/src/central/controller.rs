//! Central orchestrator
//!
//! Owns the [`Scanner`] and at most one [`Connection`], executes the effects
//! they request against a [`CentralTransport`], arms scan timers on the tokio
//! runtime, and reports outcomes to a [`CentralListener`]. All state sits
//! behind one lock; listener callbacks run after it is released.

use super::capability::CapabilitySpec;
use super::connection::{
    Connection, ConnectionNotice, ConnectionState, DisconnectReason, Effect, GattCommand, LinkEvent,
};
use super::scanner::{ScanAction, Scanner, TimerToken};
use super::transport::{CentralEvent, CentralTransport, ScanReport};
use crate::config::CentralConfig;
use crate::gatt::{CharId, Characteristic, ServiceId, TransportError};
use crate::GattLinkError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Application-visible central state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CentralState {
    Idle,
    Scanning,
    Connected,
    Error,
}

impl fmt::Display for CentralState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CentralState::Idle => write!(f, "Idle"),
            CentralState::Scanning => write!(f, "Scanning"),
            CentralState::Connected => write!(f, "Connected"),
            CentralState::Error => write!(f, "Error"),
        }
    }
}

/// Callbacks from the central role. Every method has an empty default.
pub trait CentralListener: Send + Sync {
    fn on_state_changed(&self, _service_id: ServiceId, _state: CentralState) {}

    fn on_connected(&self) {}

    /// Connect-time subscriptions have all completed
    fn on_subscriptions_ready(&self) {}

    fn on_disconnected(&self, _reason: DisconnectReason, _message: &str) {}

    fn on_characteristic_changed(&self, _characteristic: &Characteristic) {}

    fn on_characteristic_read(&self, _success: bool, _characteristic: &Characteristic) {}

    fn on_characteristic_write(&self, _success: bool, _characteristic: &Characteristic) {}

    fn on_scan_failure(&self, _code: i32) {}
}

/// Listener that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl CentralListener for NoopListener {}

/// Callback queued while the lock is held
enum Output {
    State(ServiceId, CentralState),
    Notice(ConnectionNotice),
    ScanFailure(i32),
}

struct Inner<T: CentralTransport> {
    transport: Arc<T>,
    config: CentralConfig,
    scanner: Scanner,
    connection: Option<Connection>,
    spec: Option<Arc<CapabilitySpec>>,
    state: CentralState,
    timer: Option<(TimerToken, JoinHandle<()>)>,
}

/// Application-facing central role
pub struct CentralController<T: CentralTransport + 'static> {
    inner: Arc<Mutex<Inner<T>>>,
    listener: Arc<dyn CentralListener>,
}

impl<T: CentralTransport + 'static> Clone for CentralController<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            listener: Arc::clone(&self.listener),
        }
    }
}

impl<T: CentralTransport + 'static> CentralController<T> {
    pub fn new(
        transport: Arc<T>,
        config: CentralConfig,
        listener: Arc<dyn CentralListener>,
    ) -> Result<Self, GattLinkError> {
        let scanner = Scanner::new(config.scan.clone())?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                transport,
                config,
                scanner,
                connection: None,
                spec: None,
                state: CentralState::Idle,
                timer: None,
            })),
            listener,
        })
    }

    pub fn state(&self) -> CentralState {
        self.inner.lock().state
    }

    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.inner.lock().connection.as_ref().map(Connection::state)
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.lock().scanner.is_working()
    }

    /// True when neither a scan nor a link is in progress
    pub fn can_start(&self) -> bool {
        self.inner.lock().can_start()
    }

    /// Scan for the spec's service and connect to the first match
    pub fn start(&self, spec: CapabilitySpec) -> Result<(), GattLinkError> {
        let mut outputs = Vec::new();
        {
            let mut inner = self.inner.lock();
            if !inner.can_start() {
                return Err(GattLinkError::InvalidState(
                    "central is already scanning or connected".to_string(),
                ));
            }
            let service_id = spec.service_id();
            info!("Central starting for service {}", service_id);
            inner.spec = Some(Arc::new(spec));
            inner.set_state(CentralState::Scanning, &mut outputs);
            let actions = inner.scanner.start(service_id);
            inner.run_scan_actions(actions, self, &mut outputs);
        }
        self.dispatch(outputs);
        Ok(())
    }

    /// Stop scanning and close any link. Returns whether anything was stopped.
    pub fn stop(&self) -> bool {
        let mut outputs = Vec::new();
        let stopped = {
            let mut inner = self.inner.lock();
            let mut stopped = false;

            if inner.scanner.is_working() {
                let actions = inner.scanner.stop();
                inner.run_scan_actions(actions, self, &mut outputs);
                if inner.state == CentralState::Scanning {
                    inner.set_state(CentralState::Idle, &mut outputs);
                }
                stopped = true;
            }

            if let Some(mut conn) = inner.connection.take() {
                if conn.state() != ConnectionState::Ready {
                    let effects = conn.close();
                    let notices = drive(inner.transport.as_ref(), &mut conn, effects);
                    inner.absorb(notices, self, &mut outputs);
                    stopped = true;
                }
            }
            stopped
        };
        if stopped {
            info!("Central stopped");
        }
        self.dispatch(outputs);
        stopped
    }

    pub fn read(&self, id: CharId) -> Result<(), GattLinkError> {
        self.with_connection(|conn| conn.read(id))
    }

    pub fn write(&self, id: CharId, value: Vec<u8>) -> Result<(), GattLinkError> {
        self.with_connection(|conn| conn.write(id, value))
    }

    pub fn send(&self, id: CharId, value: Vec<u8>) -> Result<(), GattLinkError> {
        self.with_connection(|conn| conn.send(id, value))
    }

    fn with_connection(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<Vec<Effect>, GattLinkError>,
    ) -> Result<(), GattLinkError> {
        let mut outputs = Vec::new();
        {
            let mut inner = self.inner.lock();
            let inner = &mut *inner;
            let conn = inner.connection.as_mut().ok_or_else(|| {
                GattLinkError::InvalidState("connection is not available".to_string())
            })?;
            let effects = op(conn)?;
            let notices = drive(inner.transport.as_ref(), conn, effects);
            inner.absorb(notices, self, &mut outputs);
        }
        self.dispatch(outputs);
        Ok(())
    }

    /// Feed one platform callback into the central
    pub fn handle_event(&self, event: CentralEvent) {
        let mut outputs = Vec::new();
        {
            let mut inner = self.inner.lock();
            match event {
                CentralEvent::ScanResult(report) => {
                    let actions = inner.scanner.on_scan_result(report);
                    inner.run_scan_actions(actions, self, &mut outputs);
                }
                CentralEvent::ScanFailed { code } => {
                    let actions = inner.scanner.on_scan_failed(code);
                    inner.run_scan_actions(actions, self, &mut outputs);
                }
                event => inner.route_link_event(event, self, &mut outputs),
            }
        }
        self.dispatch(outputs);
    }

    fn on_timer(&self, token: TimerToken) {
        let mut outputs = Vec::new();
        {
            let mut inner = self.inner.lock();
            if matches!(inner.timer, Some((armed, _)) if armed == token) {
                inner.timer = None;
            }
            let actions = inner.scanner.on_timer(token);
            inner.run_scan_actions(actions, self, &mut outputs);
        }
        self.dispatch(outputs);
    }

    fn dispatch(&self, outputs: Vec<Output>) {
        for output in outputs {
            match output {
                Output::State(service_id, state) => {
                    self.listener.on_state_changed(service_id, state)
                }
                Output::ScanFailure(code) => self.listener.on_scan_failure(code),
                Output::Notice(notice) => match notice {
                    ConnectionNotice::Connected => self.listener.on_connected(),
                    ConnectionNotice::SubscriptionsReady => self.listener.on_subscriptions_ready(),
                    ConnectionNotice::Disconnected { reason, message } => {
                        self.listener.on_disconnected(reason, &message)
                    }
                    ConnectionNotice::CharacteristicChanged(ch) => {
                        self.listener.on_characteristic_changed(&ch)
                    }
                    ConnectionNotice::CharacteristicRead {
                        success,
                        characteristic,
                    } => self.listener.on_characteristic_read(success, &characteristic),
                    ConnectionNotice::CharacteristicWritten {
                        success,
                        characteristic,
                    } => self
                        .listener
                        .on_characteristic_write(success, &characteristic),
                },
            }
        }
    }

    fn weak(&self) -> Weak<Mutex<Inner<T>>> {
        Arc::downgrade(&self.inner)
    }
}

impl<T: CentralTransport + 'static> Inner<T> {
    fn can_start(&self) -> bool {
        !self.scanner.is_working() && self.connection.is_none()
    }

    fn service_id(&self) -> Option<ServiceId> {
        self.spec.as_ref().map(|spec| spec.service_id())
    }

    fn set_state(&mut self, state: CentralState, outputs: &mut Vec<Output>) {
        if self.state == state {
            return;
        }
        debug!("Central state {} -> {}", self.state, state);
        self.state = state;
        if let Some(service_id) = self.service_id() {
            outputs.push(Output::State(service_id, state));
        }
    }

    fn run_scan_actions(
        &mut self,
        actions: Vec<ScanAction>,
        ctl: &CentralController<T>,
        outputs: &mut Vec<Output>,
    ) {
        let mut pending: VecDeque<ScanAction> = actions.into();
        while let Some(action) = pending.pop_front() {
            match action {
                ScanAction::StartScan => {
                    if let Err(err) = self.transport.start_scan() {
                        warn!("Scan start failed: {}", err);
                        pending.extend(self.scanner.on_scan_failed(failure_code(&err)));
                    }
                }
                ScanAction::StopScan => self.transport.stop_scan(),
                ScanAction::ArmTimer { token, after } => self.arm_timer(token, after, ctl),
                ScanAction::CancelTimer(token) => self.cancel_timer(token),
                ScanAction::Found(report) => self.on_device_found(report, ctl, outputs),
                ScanAction::Failed(code) => {
                    warn!("Scan failed with code {}", code);
                    outputs.push(Output::ScanFailure(code));
                    self.set_state(CentralState::Idle, outputs);
                }
            }
        }
    }

    fn arm_timer(&mut self, token: TimerToken, after: Duration, ctl: &CentralController<T>) {
        if let Some((_, task)) = self.timer.take() {
            task.abort();
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime available, scan timer not armed");
            return;
        };
        let weak = ctl.weak();
        let listener = Arc::clone(&ctl.listener);
        let task = runtime.spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(inner) = weak.upgrade() {
                CentralController { inner, listener }.on_timer(token);
            }
        });
        self.timer = Some((token, task));
    }

    fn cancel_timer(&mut self, token: TimerToken) {
        if let Some((armed, task)) = self.timer.take() {
            if armed != token {
                debug!("Cancelling timer {:?} in place of {:?}", armed, token);
            }
            task.abort();
        }
    }

    fn on_device_found(
        &mut self,
        report: ScanReport,
        ctl: &CentralController<T>,
        outputs: &mut Vec<Output>,
    ) {
        let Some(spec) = self.spec.clone() else {
            warn!("Device {} found without a capability spec", report.device);
            return;
        };
        if let Some(previous) = self.connection.as_ref() {
            warn!("Replacing connection in state {}", previous.state());
        }
        let mut conn = Connection::new(spec);
        match conn.connect(report.device) {
            Ok(effects) => {
                let notices = drive(self.transport.as_ref(), &mut conn, effects);
                self.connection = Some(conn);
                self.absorb(notices, ctl, outputs);
            }
            Err(err) => warn!("Connect refused: {}", err),
        }
    }

    fn route_link_event(
        &mut self,
        event: CentralEvent,
        ctl: &CentralController<T>,
        outputs: &mut Vec<Output>,
    ) {
        let Some(conn) = self.connection.as_mut() else {
            debug!("Dropping link event without a connection");
            return;
        };
        if event.device() != conn.device() {
            debug!("Dropping event for unrelated device {:?}", event.device());
            return;
        }
        let Some(link_event) = LinkEvent::from_central(event) else {
            return;
        };
        let effects = conn.handle(link_event);
        let notices = drive(self.transport.as_ref(), conn, effects);
        self.absorb(notices, ctl, outputs);
    }

    /// Translate connection notices into central state and listener output
    fn absorb(
        &mut self,
        notices: Vec<ConnectionNotice>,
        ctl: &CentralController<T>,
        outputs: &mut Vec<Output>,
    ) {
        for notice in notices {
            let mut rescan = false;
            match &notice {
                ConnectionNotice::Connected => {
                    self.set_state(CentralState::Connected, outputs);
                }
                ConnectionNotice::Disconnected { reason, .. } => match reason {
                    DisconnectReason::Normal => self.set_state(CentralState::Idle, outputs),
                    DisconnectReason::ConditionMismatch => {
                        self.set_state(CentralState::Error, outputs)
                    }
                    DisconnectReason::Remote => {
                        rescan = self.config.rescan_on_remote_disconnect;
                        if !rescan {
                            self.set_state(CentralState::Idle, outputs);
                        }
                    }
                },
                _ => {}
            }
            outputs.push(Output::Notice(notice));

            if rescan {
                if let Some(service_id) = self.service_id() {
                    info!("Remote disconnect, scanning again for {}", service_id);
                    self.set_state(CentralState::Scanning, outputs);
                    let actions = self.scanner.start(service_id);
                    self.run_scan_actions(actions, ctl, outputs);
                }
            }
        }

        if matches!(&self.connection, Some(conn) if conn.state() == ConnectionState::Ready) {
            self.connection = None;
        }
    }
}

/// Execute connection effects; a refused command is fed back and the rest
/// of its batch is dropped. Closing a link has no platform callback, so its
/// completion is fed back as `LinkReleased`.
fn drive<T: CentralTransport + ?Sized>(
    transport: &T,
    conn: &mut Connection,
    effects: Vec<Effect>,
) -> Vec<ConnectionNotice> {
    let mut pending: VecDeque<Effect> = effects.into();
    let mut notices = Vec::new();
    while let Some(effect) = pending.pop_front() {
        match effect {
            Effect::Command(command) => match execute(transport, &command) {
                Ok(()) if matches!(command, GattCommand::CloseLink(_)) => {
                    pending.extend(conn.handle(LinkEvent::LinkReleased));
                }
                Ok(()) => {}
                Err(error) => {
                    pending = conn
                        .handle(LinkEvent::CommandFailed { command, error })
                        .into();
                }
            },
            Effect::Notify(notice) => notices.push(notice),
        }
    }
    notices
}

fn execute<T: CentralTransport + ?Sized>(
    transport: &T,
    command: &GattCommand,
) -> Result<(), TransportError> {
    debug!("Executing {}", command);
    match command {
        GattCommand::Connect(device) => transport.connect(device),
        GattCommand::DiscoverServices(device) => transport.discover_services(device),
        GattCommand::EnableNotification {
            device,
            service,
            characteristic,
        } => transport.set_notification_enabled(device, *service, *characteristic, true),
        GattCommand::WriteDescriptor {
            device,
            service,
            characteristic,
            descriptor,
            value,
        } => transport.write_descriptor(device, *service, *characteristic, *descriptor, value),
        GattCommand::Read {
            device,
            service,
            characteristic,
        } => transport.read_characteristic(device, *service, *characteristic),
        GattCommand::Write {
            device,
            service,
            characteristic,
            value,
            write_type,
        } => transport.write_characteristic(device, *service, *characteristic, value, *write_type),
        GattCommand::Disconnect(device) => {
            transport.disconnect(device);
            Ok(())
        }
        GattCommand::CloseLink(device) => {
            transport.close_link(device);
            Ok(())
        }
    }
}

fn failure_code(err: &TransportError) -> i32 {
    match err {
        TransportError::Platform(code) => *code,
        _ => -1,
    }
}
