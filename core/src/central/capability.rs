/// Declared capability shape of a remote service
///
/// A `CapabilitySpec` names a service and the characteristics the central
/// expects to find in it, grouped by the role each one must support. The
/// connection validates the discovered attribute table against it before
/// reporting the link as usable.

use crate::gatt::{CharId, CharProperties, ServiceId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Role a declared characteristic must support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CharRole {
    /// Subscribed for notifications at connect time
    Observe,
    Read,
    /// Write with response
    Write,
    /// Write without response
    Send,
}

impl CharRole {
    /// Validation order: observe, read, write, send
    pub const ALL: [CharRole; 4] = [
        CharRole::Observe,
        CharRole::Read,
        CharRole::Write,
        CharRole::Send,
    ];

    /// Property the remote characteristic must advertise for this role
    pub fn required_property(&self) -> CharProperties {
        match self {
            CharRole::Observe => CharProperties::NOTIFY,
            CharRole::Read => CharProperties::READ,
            CharRole::Write => CharProperties::WRITE,
            CharRole::Send => CharProperties::WRITE_NO_RESPONSE,
        }
    }
}

impl fmt::Display for CharRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CharRole::Observe => write!(f, "NOTIFY"),
            CharRole::Read => write!(f, "READ"),
            CharRole::Write => write!(f, "WRITE"),
            CharRole::Send => write!(f, "WRITE_NO_RESPONSE"),
        }
    }
}

/// Immutable declaration of a service and its required characteristic roles.
///
/// Role sets may overlap. Each set keeps declaration order, which is also
/// the order subscriptions are enabled in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySpec {
    service_id: ServiceId,
    observable: Vec<CharId>,
    readable: Vec<CharId>,
    writable: Vec<CharId>,
    sendable: Vec<CharId>,
}

impl CapabilitySpec {
    pub fn builder(service_id: ServiceId) -> CapabilitySpecBuilder {
        CapabilitySpecBuilder::new(service_id)
    }

    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }

    /// Declared characteristics for a role, in declaration order
    pub fn characteristics(&self, role: CharRole) -> &[CharId] {
        match role {
            CharRole::Observe => &self.observable,
            CharRole::Read => &self.readable,
            CharRole::Write => &self.writable,
            CharRole::Send => &self.sendable,
        }
    }

    pub fn observable(&self) -> &[CharId] {
        &self.observable
    }

    pub fn readable(&self) -> &[CharId] {
        &self.readable
    }

    pub fn writable(&self) -> &[CharId] {
        &self.writable
    }

    pub fn sendable(&self) -> &[CharId] {
        &self.sendable
    }

    /// Whether `id` was declared with `role`
    pub fn allows(&self, role: CharRole, id: &CharId) -> bool {
        self.characteristics(role).contains(id)
    }
}

/// Builder for [`CapabilitySpec`]
#[derive(Debug, Clone)]
pub struct CapabilitySpecBuilder {
    spec: CapabilitySpec,
}

impl CapabilitySpecBuilder {
    pub fn new(service_id: ServiceId) -> Self {
        Self {
            spec: CapabilitySpec {
                service_id,
                observable: Vec::new(),
                readable: Vec::new(),
                writable: Vec::new(),
                sendable: Vec::new(),
            },
        }
    }

    fn push(mut self, role: CharRole, id: CharId) -> Self {
        let set = match role {
            CharRole::Observe => &mut self.spec.observable,
            CharRole::Read => &mut self.spec.readable,
            CharRole::Write => &mut self.spec.writable,
            CharRole::Send => &mut self.spec.sendable,
        };
        if !set.contains(&id) {
            set.push(id);
        }
        self
    }

    pub fn observable(self, id: CharId) -> Self {
        self.push(CharRole::Observe, id)
    }

    pub fn readable(self, id: CharId) -> Self {
        self.push(CharRole::Read, id)
    }

    pub fn writable(self, id: CharId) -> Self {
        self.push(CharRole::Write, id)
    }

    pub fn sendable(self, id: CharId) -> Self {
        self.push(CharRole::Send, id)
    }

    pub fn build(self) -> CapabilitySpec {
        self.spec
    }
}
