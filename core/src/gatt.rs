//! Shared GATT attribute model
//!
//! Identifiers, property/permission flags and the standard client
//! configuration descriptor used by both the central and peripheral roles.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Service identifier
pub type ServiceId = Uuid;

/// Characteristic identifier
pub type CharId = Uuid;

/// Bluetooth base UUID (`0000xxxx-0000-1000-8000-00805F9B34FB`)
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Client Characteristic Configuration descriptor (0x2902)
pub const CLIENT_CONFIG_DESCRIPTOR_UUID: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5F9B_34FB);

/// Descriptor value that enables notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// Descriptor value that disables notifications
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Expand a 16-bit assigned number into a full UUID on the Bluetooth base
pub fn uuid_from_short(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Errors returned synchronously by platform radio primitives
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Radio unavailable")]
    Unavailable,
    #[error("No link to {0}")]
    NoLink(DeviceId),
    #[error("Request rejected: {0}")]
    Rejected(String),
    #[error("Platform error code {0}")]
    Platform(i32),
}

/// Opaque identity of a remote device (typically its link-layer address)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

bitflags::bitflags! {
    /// Characteristic properties advertised in the attribute table.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CharProperties: u8 {
        const READ = 0x02;
        const WRITE_NO_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
    }
}

bitflags::bitflags! {
    /// Attribute access permissions on the local server.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CharPermissions: u8 {
        const READ = 0x01;
        const WRITE = 0x10;
    }
}

/// Outcome status of an attribute transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GattStatus {
    #[default]
    Success,
    ReadNotPermitted,
    WriteNotPermitted,
    InvalidOffset,
    RequestNotSupported,
    /// Generic failure (0x101 on most stacks)
    Failure,
}

impl GattStatus {
    pub fn is_success(&self) -> bool {
        *self == GattStatus::Success
    }

    /// Numeric status code as carried on the wire
    pub fn code(&self) -> u16 {
        match self {
            GattStatus::Success => 0x0000,
            GattStatus::ReadNotPermitted => 0x0002,
            GattStatus::WriteNotPermitted => 0x0003,
            GattStatus::InvalidOffset => 0x0007,
            GattStatus::RequestNotSupported => 0x0006,
            GattStatus::Failure => 0x0101,
        }
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:04x})", self, self.code())
    }
}

/// A characteristic value observed on the remote side of a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Characteristic {
    pub service_id: ServiceId,
    pub id: CharId,
    pub value: Vec<u8>,
}

impl Characteristic {
    pub fn new(service_id: ServiceId, id: CharId, value: Vec<u8>) -> Self {
        Self {
            service_id,
            id,
            value,
        }
    }

    /// Value interpreted as a little-endian u32, if at least four bytes long
    pub fn int_value(&self) -> Option<u32> {
        crate::codec::decode_u32_le(&self.value).ok()
    }
}
