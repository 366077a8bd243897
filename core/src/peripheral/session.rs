//! Request dispatch for the peripheral role
//!
//! A [`PeripheralSession`] serves every connected central at once. The
//! capability table is immutable; stored values and subscriptions live
//! behind one lock that is never held while an application handler runs.

use super::notification::NotificationRegistry;
use super::registry::PeripheralRegistry;
use super::request::{
    DescriptorWriteRequest, ReadRequest, ReadResponse, TransactionReply, WriteRequest,
    WriteResponse,
};
use crate::gatt::{
    CharId, DeviceId, GattStatus, ServiceId, CLIENT_CONFIG_DESCRIPTOR_UUID,
    DISABLE_NOTIFICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Value-change push owed to one subscribed device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValuePush {
    pub device: DeviceId,
    pub service_id: ServiceId,
    pub characteristic: CharId,
    pub value: Vec<u8>,
}

/// Result of dispatching a characteristic write
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WriteOutcome {
    pub reply: Option<TransactionReply>,
    pub pushes: Vec<ValuePush>,
}

#[derive(Debug, Default)]
struct SessionState {
    values: HashMap<(ServiceId, CharId), Vec<u8>>,
    subscriptions: NotificationRegistry,
}

impl SessionState {
    fn value(&self, service: ServiceId, characteristic: CharId) -> Vec<u8> {
        self.values
            .get(&(service, characteristic))
            .cloned()
            .unwrap_or_default()
    }

    fn pushes(&self, service: ServiceId, characteristic: CharId, value: &[u8]) -> Vec<ValuePush> {
        self.subscriptions
            .subscribers(service, characteristic)
            .into_iter()
            .map(|device| ValuePush {
                device,
                service_id: service,
                characteristic,
                value: value.to_vec(),
            })
            .collect()
    }
}

pub struct PeripheralSession {
    registry: Arc<PeripheralRegistry>,
    state: Mutex<SessionState>,
}

impl PeripheralSession {
    pub fn new(registry: Arc<PeripheralRegistry>) -> Self {
        let values = registry
            .capabilities()
            .map(|(service, id, capability)| ((service, id), capability.initial_value().to_vec()))
            .collect();
        Self {
            registry,
            state: Mutex::new(SessionState {
                values,
                subscriptions: NotificationRegistry::new(),
            }),
        }
    }

    pub fn registry(&self) -> &PeripheralRegistry {
        &self.registry
    }

    /// Currently stored value of a registered characteristic
    pub fn value(&self, service: ServiceId, characteristic: CharId) -> Option<Vec<u8>> {
        self.registry.capability(&service, &characteristic)?;
        Some(self.state.lock().value(service, characteristic))
    }

    pub fn subscribers(&self, service: ServiceId, characteristic: CharId) -> Vec<DeviceId> {
        self.state
            .lock()
            .subscriptions
            .subscribers(service, characteristic)
    }

    /// Dispatch a read; `None` when the characteristic is unknown
    pub fn on_read_request(&self, request: ReadRequest) -> Option<TransactionReply> {
        let Some(capability) = self
            .registry
            .capability(&request.service_id, &request.characteristic)
        else {
            debug!("Dropping read for unknown characteristic {}", request.characteristic);
            return None;
        };

        let current = self
            .state
            .lock()
            .value(request.service_id, request.characteristic);
        let mut response = ReadResponse::new(current.clone());

        if let Some(handler) = capability.read_handler() {
            if let Err(err) = handler(&request, &mut response) {
                warn!("Read handler for {} failed: {}", request.characteristic, err);
                response.set_status(GattStatus::Failure);
            }
        }

        let (reply, stored) = response.finish(&request);
        if stored != current {
            self.state
                .lock()
                .values
                .insert((request.service_id, request.characteristic), stored);
        }
        Some(reply)
    }

    /// Dispatch a write; pushes go to every subscriber when the stored value changed
    pub fn on_write_request(&self, request: WriteRequest) -> Option<WriteOutcome> {
        let Some(capability) = self
            .registry
            .capability(&request.service_id, &request.characteristic)
        else {
            debug!("Dropping write for unknown characteristic {}", request.characteristic);
            return None;
        };

        let before = self
            .state
            .lock()
            .value(request.service_id, request.characteristic);
        let mut response = WriteResponse::new(before.clone());

        let handled = match capability.write_handler() {
            Some(handler) => {
                if let Err(err) = handler(&request, &mut response) {
                    warn!("Write handler for {} failed: {}", request.characteristic, err);
                    response.set_status(GattStatus::Failure);
                }
                true
            }
            None => false,
        };

        let (reply, after) = response.finish(&request);
        let mut pushes = Vec::new();
        // values stored while the handler ran are compared against, not `before`
        if handled && after != before {
            let mut state = self.state.lock();
            if state.value(request.service_id, request.characteristic) != after {
                pushes = state.pushes(request.service_id, request.characteristic, &after);
                debug!(
                    "{} changed by {}, notifying {} subscribers",
                    request.characteristic,
                    request.device,
                    pushes.len()
                );
            }
            state
                .values
                .insert((request.service_id, request.characteristic), after);
        }
        Some(WriteOutcome { reply, pushes })
    }

    /// Route configuration-descriptor writes to the subscription table
    pub fn on_descriptor_write_request(
        &self,
        request: DescriptorWriteRequest,
    ) -> Option<TransactionReply> {
        let Some(capability) = self
            .registry
            .capability(&request.service_id, &request.characteristic)
        else {
            debug!(
                "Dropping descriptor write for unknown characteristic {}",
                request.characteristic
            );
            return None;
        };

        if request.descriptor == CLIENT_CONFIG_DESCRIPTOR_UUID && capability.is_notifiable() {
            if request.value == ENABLE_NOTIFICATION_VALUE {
                self.subscribe(request.service_id, request.characteristic, request.device.clone());
            } else if request.value == DISABLE_NOTIFICATION_VALUE {
                self.unsubscribe(request.service_id, request.characteristic, &request.device);
            }
        }

        request
            .response_needed
            .then(|| request.success_reply())
    }

    /// Returns false for unknown or non-notifiable characteristics
    pub fn subscribe(&self, service: ServiceId, characteristic: CharId, device: DeviceId) -> bool {
        match self.registry.capability(&service, &characteristic) {
            Some(capability) if capability.is_notifiable() => {
                self.state
                    .lock()
                    .subscriptions
                    .subscribe(service, characteristic, device);
                true
            }
            _ => {
                debug!("Ignoring subscription to {}", characteristic);
                false
            }
        }
    }

    pub fn unsubscribe(&self, service: ServiceId, characteristic: CharId, device: &DeviceId) -> bool {
        self.state
            .lock()
            .subscriptions
            .unsubscribe(service, characteristic, device)
    }

    /// Forget every subscription held by a departed device
    pub fn on_link_lost(&self, device: &DeviceId) -> usize {
        let removed = self.state.lock().subscriptions.forget_device(device);
        if removed > 0 {
            debug!("Dropped {} subscriptions of {}", removed, device);
        }
        removed
    }

    /// Store a server-side value; pushes only when it differs from the stored one
    pub fn update_value(
        &self,
        service: ServiceId,
        characteristic: CharId,
        value: Vec<u8>,
    ) -> Vec<ValuePush> {
        if self.registry.capability(&service, &characteristic).is_none() {
            debug!("Ignoring update of unknown characteristic {}", characteristic);
            return Vec::new();
        }
        let mut state = self.state.lock();
        let key = (service, characteristic);
        if state.values.get(&key) == Some(&value) {
            return Vec::new();
        }
        let pushes = state.pushes(service, characteristic, &value);
        state.values.insert(key, value);
        pushes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::gatt::uuid_from_short;
    use crate::peripheral::registry::ServiceDefinition;
    use crate::peripheral::request::HandlerError;
    use proptest::prelude::*;

    fn svc() -> ServiceId {
        uuid_from_short(0xFFF0)
    }

    fn counter() -> CharId {
        uuid_from_short(0xFFF1)
    }

    fn command() -> CharId {
        uuid_from_short(0xFFF2)
    }

    fn plain() -> CharId {
        uuid_from_short(0xFFF3)
    }

    /// counter: read + write (stores the written value) + notify
    /// command: write that stores nothing
    /// plain: write handler rejecting everything
    fn session() -> PeripheralSession {
        let definition = ServiceDefinition::new(svc())
            .on_read(counter(), |_, _| Ok(()))
            .on_write(counter(), |req, res| {
                res.write(req.value.clone());
                Ok(())
            })
            .notifiable(counter())
            .initial_value(counter(), codec::encode_u32_le(1).to_vec())
            .on_write_with(command(), false, |_, _| Ok(()))
            .on_write(plain(), |_, _| Err(HandlerError::Rejected("read-only".to_string())));
        let registry = PeripheralRegistry::from_definitions([definition]).expect("registry");
        PeripheralSession::new(Arc::new(registry))
    }

    fn read(device: &str, characteristic: CharId) -> ReadRequest {
        ReadRequest {
            device: DeviceId::from(device),
            request_id: 1,
            service_id: svc(),
            characteristic,
            offset: 0,
        }
    }

    fn write(device: &str, characteristic: CharId, value: Vec<u8>) -> WriteRequest {
        WriteRequest {
            device: DeviceId::from(device),
            request_id: 2,
            service_id: svc(),
            characteristic,
            prepared_write: false,
            response_needed: true,
            offset: 0,
            value,
        }
    }

    fn cccd(device: &str, value: [u8; 2]) -> DescriptorWriteRequest {
        DescriptorWriteRequest {
            device: DeviceId::from(device),
            request_id: 3,
            service_id: svc(),
            characteristic: counter(),
            descriptor: CLIENT_CONFIG_DESCRIPTOR_UUID,
            response_needed: true,
            offset: 0,
            value: value.to_vec(),
        }
    }

    #[test]
    fn test_read_serves_initial_value() {
        let session = session();
        let reply = session.on_read_request(read("a", counter())).expect("reply");
        assert_eq!(reply.status, GattStatus::Success);
        assert_eq!(reply.value, vec![1, 0, 0, 0]);
    }

    #[test]
    fn test_read_without_handler_sends_default_reply() {
        let session = session();
        let reply = session.on_read_request(read("a", command())).expect("reply");
        assert_eq!(reply.status, GattStatus::Success);
        assert!(reply.value.is_empty());
    }

    #[test]
    fn test_unknown_characteristic_dropped() {
        let session = session();
        assert!(session.on_read_request(read("a", uuid_from_short(0xABCD))).is_none());
        assert!(session
            .on_write_request(write("a", uuid_from_short(0xABCD), vec![1]))
            .is_none());
    }

    #[test]
    fn test_write_fans_out_to_all_subscribers() {
        let session = session();
        session.on_descriptor_write_request(cccd("a", ENABLE_NOTIFICATION_VALUE));
        session.on_descriptor_write_request(cccd("b", ENABLE_NOTIFICATION_VALUE));

        let outcome = session
            .on_write_request(write("a", counter(), vec![9, 0, 0, 0]))
            .expect("outcome");
        let devices: Vec<_> = outcome.pushes.iter().map(|p| p.device.clone()).collect();
        assert_eq!(devices, vec![DeviceId::from("a"), DeviceId::from("b")]);
        assert!(outcome.pushes.iter().all(|p| p.value == vec![9, 0, 0, 0]));
        assert_eq!(
            outcome.reply.map(|r| r.status),
            Some(GattStatus::Success)
        );
        assert_eq!(session.value(svc(), counter()), Some(vec![9, 0, 0, 0]));
    }

    #[test]
    fn test_unchanged_write_pushes_nothing() {
        let session = session();
        session.subscribe(svc(), counter(), DeviceId::from("a"));
        let outcome = session
            .on_write_request(write("a", counter(), vec![1, 0, 0, 0]))
            .expect("outcome");
        assert!(outcome.pushes.is_empty());
        assert!(outcome.reply.is_some());
    }

    #[test]
    fn test_failing_handler_replies_failure() {
        let session = session();
        let outcome = session
            .on_write_request(write("a", plain(), vec![1]))
            .expect("outcome");
        let reply = outcome.reply.expect("reply");
        assert_eq!(reply.status, GattStatus::Failure);
        assert!(reply.value.is_empty());
        assert!(outcome.pushes.is_empty());
    }

    #[test]
    fn test_write_without_response_has_no_reply() {
        let session = session();
        let mut request = write("a", command(), vec![1]);
        request.response_needed = false;
        let outcome = session.on_write_request(request).expect("outcome");
        assert!(outcome.reply.is_none());
    }

    #[test]
    fn test_descriptor_disable_unsubscribes() {
        let session = session();
        let reply = session
            .on_descriptor_write_request(cccd("a", ENABLE_NOTIFICATION_VALUE))
            .expect("reply");
        assert_eq!(reply.value, vec![0x01, 0x00]);
        assert_eq!(session.subscribers(svc(), counter()), vec![DeviceId::from("a")]);

        session.on_descriptor_write_request(cccd("a", DISABLE_NOTIFICATION_VALUE));
        assert!(session.subscribers(svc(), counter()).is_empty());
    }

    #[test]
    fn test_subscribe_requires_notifiable() {
        let session = session();
        assert!(!session.subscribe(svc(), command(), DeviceId::from("a")));
        assert!(session.subscribe(svc(), counter(), DeviceId::from("a")));
    }

    #[test]
    fn test_link_loss_stops_pushes() {
        let session = session();
        session.subscribe(svc(), counter(), DeviceId::from("a"));
        session.subscribe(svc(), counter(), DeviceId::from("b"));

        assert_eq!(session.on_link_lost(&DeviceId::from("a")), 1);
        let pushes = session.update_value(svc(), counter(), vec![2, 0, 0, 0]);
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].device, DeviceId::from("b"));
    }

    #[test]
    fn test_update_value_is_noop_when_unchanged() {
        let session = session();
        session.subscribe(svc(), counter(), DeviceId::from("a"));
        assert!(session
            .update_value(svc(), counter(), vec![1, 0, 0, 0])
            .is_empty());
        assert_eq!(session.update_value(svc(), counter(), vec![3]).len(), 1);
        assert!(session
            .update_value(svc(), uuid_from_short(0xABCD), vec![3])
            .is_empty());
    }

    fn mirror() -> CharId {
        uuid_from_short(0xFFF4)
    }

    fn passive() -> CharId {
        uuid_from_short(0xFFF5)
    }

    /// Handlers that store a value through the session while they run.
    /// mirror: stores the request value, then writes it
    /// passive: stores [7], writes nothing
    fn racing_session() -> Arc<PeripheralSession> {
        let slot: Arc<Mutex<Option<std::sync::Weak<PeripheralSession>>>> = Arc::default();
        let mirror_hook = Arc::clone(&slot);
        let passive_hook = Arc::clone(&slot);
        let definition = ServiceDefinition::new(svc())
            .on_write(mirror(), move |req, res| {
                let session = mirror_hook.lock().as_ref().and_then(|w| w.upgrade());
                if let Some(session) = session {
                    session.update_value(svc(), mirror(), req.value.clone());
                }
                res.write(req.value.clone());
                Ok(())
            })
            .notifiable(mirror())
            .on_write(passive(), move |_, _| {
                let session = passive_hook.lock().as_ref().and_then(|w| w.upgrade());
                if let Some(session) = session {
                    session.update_value(svc(), passive(), vec![7]);
                }
                Ok(())
            })
            .notifiable(passive());
        let registry = PeripheralRegistry::from_definitions([definition]).expect("registry");
        let session = Arc::new(PeripheralSession::new(Arc::new(registry)));
        *slot.lock() = Some(Arc::downgrade(&session));
        session
    }

    #[test]
    fn test_write_matching_concurrent_update_pushes_once() {
        let session = racing_session();
        session.subscribe(svc(), mirror(), DeviceId::from("a"));

        let outcome = session
            .on_write_request(write("a", mirror(), vec![5]))
            .expect("outcome");
        assert!(outcome.pushes.is_empty());
        assert_eq!(session.value(svc(), mirror()), Some(vec![5]));

        let outcome = session
            .on_write_request(write("a", mirror(), vec![5]))
            .expect("outcome");
        assert!(outcome.pushes.is_empty());
    }

    #[test]
    fn test_untouched_write_keeps_concurrent_update() {
        let session = racing_session();
        session.subscribe(svc(), passive(), DeviceId::from("a"));

        let outcome = session
            .on_write_request(write("a", passive(), vec![1]))
            .expect("outcome");
        assert!(outcome.pushes.is_empty());
        assert_eq!(session.value(svc(), passive()), Some(vec![7]));
    }

    proptest! {
        #[test]
        fn prop_fan_out_matches_subscribers(
            subscribed in proptest::collection::btree_set(0u8..8, 0..8),
            new_value in proptest::collection::vec(any::<u8>(), 0..6),
        ) {
            let session = session();
            for device in &subscribed {
                session.subscribe(svc(), counter(), DeviceId::new(format!("dev-{}", device)));
            }
            let changed = new_value != vec![1, 0, 0, 0];
            let outcome = session
                .on_write_request(write("writer", counter(), new_value.clone()))
                .expect("outcome");

            if changed {
                prop_assert_eq!(outcome.pushes.len(), subscribed.len());
            } else {
                prop_assert!(outcome.pushes.is_empty());
            }
        }
    }
}
