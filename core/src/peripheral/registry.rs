//! Declarative service registration for the peripheral role
//!
//! Applications bind `(characteristic, event) -> handler` through
//! [`ServiceDefinition`]; the registry derives each characteristic's
//! property and permission bits from what was bound. The resulting table is
//! frozen once handed to a [`PeripheralSession`](super::PeripheralSession).

use super::request::{HandlerError, ReadRequest, ReadResponse, WriteRequest, WriteResponse};
use crate::gatt::{
    CharId, CharPermissions, CharProperties, ServiceId, CLIENT_CONFIG_DESCRIPTOR_UUID,
    DISABLE_NOTIFICATION_VALUE,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub type ReadHandler =
    Arc<dyn Fn(&ReadRequest, &mut ReadResponse) -> Result<(), HandlerError> + Send + Sync>;

pub type WriteHandler =
    Arc<dyn Fn(&WriteRequest, &mut WriteResponse) -> Result<(), HandlerError> + Send + Sync>;

/// Inbound request kind a handler is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    Read,
    Write,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Read => write!(f, "READ"),
            RequestKind::Write => write!(f, "WRITE"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Service {0} registered twice")]
    DuplicateService(ServiceId),
    #[error("Characteristic {characteristic} already has a {kind} handler")]
    DuplicateHandler {
        characteristic: CharId,
        kind: RequestKind,
    },
    #[error("Service {0} declares no characteristics")]
    EmptyService(ServiceId),
}

// ============================================================================
// CAPABILITY TABLE
// ============================================================================

/// Accumulated shape and handlers of one local characteristic
#[derive(Clone, Default)]
pub struct PeripheralCapability {
    properties: CharProperties,
    permissions: CharPermissions,
    read: Option<ReadHandler>,
    write: Option<WriteHandler>,
    initial_value: Vec<u8>,
}

impl PeripheralCapability {
    pub fn properties(&self) -> CharProperties {
        self.properties
    }

    pub fn permissions(&self) -> CharPermissions {
        self.permissions
    }

    pub fn can_handle(&self, kind: RequestKind) -> bool {
        match kind {
            RequestKind::Read => self.read.is_some(),
            RequestKind::Write => self.write.is_some(),
        }
    }

    pub fn is_notifiable(&self) -> bool {
        self.properties.contains(CharProperties::NOTIFY)
    }

    pub fn initial_value(&self) -> &[u8] {
        &self.initial_value
    }

    pub(crate) fn read_handler(&self) -> Option<&ReadHandler> {
        self.read.as_ref()
    }

    pub(crate) fn write_handler(&self) -> Option<&WriteHandler> {
        self.write.as_ref()
    }
}

impl fmt::Debug for PeripheralCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeripheralCapability")
            .field("properties", &self.properties)
            .field("permissions", &self.permissions)
            .field("read", &self.read.is_some())
            .field("write", &self.write.is_some())
            .finish()
    }
}

// ============================================================================
// SERVICE DEFINITION
// ============================================================================

/// Builder binding handlers to the characteristics of one service
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    id: ServiceId,
    characteristics: BTreeMap<CharId, PeripheralCapability>,
    conflict: Option<RegistryError>,
}

impl ServiceDefinition {
    pub fn new(id: ServiceId) -> Self {
        Self {
            id,
            characteristics: BTreeMap::new(),
            conflict: None,
        }
    }

    pub fn id(&self) -> ServiceId {
        self.id
    }

    fn characteristic(&mut self, id: CharId) -> &mut PeripheralCapability {
        self.characteristics.entry(id).or_default()
    }

    fn record_conflict(&mut self, characteristic: CharId, kind: RequestKind) {
        if self.conflict.is_none() {
            self.conflict = Some(RegistryError::DuplicateHandler {
                characteristic,
                kind,
            });
        }
    }

    /// Bind a read handler; grants READ property and permission
    pub fn on_read<F>(mut self, id: CharId, handler: F) -> Self
    where
        F: Fn(&ReadRequest, &mut ReadResponse) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let ch = self.characteristic(id);
        if ch.read.is_some() {
            self.record_conflict(id, RequestKind::Read);
            return self;
        }
        ch.read = Some(Arc::new(handler));
        ch.properties |= CharProperties::READ;
        ch.permissions |= CharPermissions::READ;
        self
    }

    /// Bind a write handler accepting both write flavours
    pub fn on_write<F>(self, id: CharId, handler: F) -> Self
    where
        F: Fn(&WriteRequest, &mut WriteResponse) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.bind_write(id, None, Arc::new(handler))
    }

    /// Bind a write handler for writes with (`true`) or without (`false`) response
    pub fn on_write_with<F>(self, id: CharId, response_needed: bool, handler: F) -> Self
    where
        F: Fn(&WriteRequest, &mut WriteResponse) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.bind_write(id, Some(response_needed), Arc::new(handler))
    }

    fn bind_write(mut self, id: CharId, response_needed: Option<bool>, handler: WriteHandler) -> Self {
        let ch = self.characteristic(id);
        if ch.write.is_some() {
            self.record_conflict(id, RequestKind::Write);
            return self;
        }
        ch.write = Some(handler);
        ch.permissions |= CharPermissions::WRITE;
        ch.properties |= match response_needed {
            Some(true) => CharProperties::WRITE,
            Some(false) => CharProperties::WRITE_NO_RESPONSE,
            None => CharProperties::WRITE | CharProperties::WRITE_NO_RESPONSE,
        };
        self
    }

    /// Advertise NOTIFY and expose the client configuration descriptor
    pub fn notifiable(mut self, id: CharId) -> Self {
        self.characteristic(id).properties |= CharProperties::NOTIFY;
        self
    }

    /// Seed the stored value served before any write
    pub fn initial_value(mut self, id: CharId, value: impl Into<Vec<u8>>) -> Self {
        self.characteristic(id).initial_value = value.into();
        self
    }
}

// ============================================================================
// DESCRIPTORS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorDefinition {
    pub id: Uuid,
    pub permissions: CharPermissions,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicDescriptor {
    pub id: CharId,
    pub properties: CharProperties,
    pub permissions: CharPermissions,
    pub descriptors: Vec<DescriptorDefinition>,
}

/// Declarative service shape handed to the radio server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub id: ServiceId,
    pub primary: bool,
    pub characteristics: Vec<CharacteristicDescriptor>,
}

// ============================================================================
// REGISTRY
// ============================================================================

#[derive(Debug, Default, Clone)]
pub struct PeripheralRegistry {
    services: BTreeMap<ServiceId, BTreeMap<CharId, PeripheralCapability>>,
}

impl PeripheralRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a set of definitions
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = ServiceDefinition>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for definition in definitions {
            registry.register(definition)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, definition: ServiceDefinition) -> Result<(), RegistryError> {
        if let Some(conflict) = definition.conflict {
            return Err(conflict);
        }
        if definition.characteristics.is_empty() {
            return Err(RegistryError::EmptyService(definition.id));
        }
        if self.services.contains_key(&definition.id) {
            return Err(RegistryError::DuplicateService(definition.id));
        }
        debug!(
            "Registered service {} with {} characteristics",
            definition.id,
            definition.characteristics.len()
        );
        self.services.insert(definition.id, definition.characteristics);
        Ok(())
    }

    pub fn service_ids(&self) -> Vec<ServiceId> {
        self.services.keys().copied().collect()
    }

    pub fn contains_service(&self, service: &ServiceId) -> bool {
        self.services.contains_key(service)
    }

    pub fn capability(&self, service: &ServiceId, characteristic: &CharId) -> Option<&PeripheralCapability> {
        self.services.get(service)?.get(characteristic)
    }

    /// Every registered characteristic with its capability
    pub fn capabilities(&self) -> impl Iterator<Item = (ServiceId, CharId, &PeripheralCapability)> {
        self.services.iter().flat_map(|(service, chars)| {
            chars
                .iter()
                .map(move |(id, capability)| (*service, *id, capability))
        })
    }

    pub fn service_descriptors(&self) -> Vec<ServiceDescriptor> {
        self.services
            .iter()
            .map(|(service, chars)| ServiceDescriptor {
                id: *service,
                primary: true,
                characteristics: chars
                    .iter()
                    .map(|(id, capability)| CharacteristicDescriptor {
                        id: *id,
                        properties: capability.properties,
                        permissions: capability.permissions,
                        descriptors: if capability.is_notifiable() {
                            vec![DescriptorDefinition {
                                id: CLIENT_CONFIG_DESCRIPTOR_UUID,
                                permissions: CharPermissions::READ | CharPermissions::WRITE,
                                value: DISABLE_NOTIFICATION_VALUE.to_vec(),
                            }]
                        } else {
                            Vec::new()
                        },
                    })
                    .collect(),
            })
            .collect()
    }
}
