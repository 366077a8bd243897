// gattlink: GATT session core
//
// Central role: scan for a service, validate the discovered shape against a
// declared capability spec, subscribe, then read/write.
// Peripheral role: serve declared characteristics and fan out notifications.

pub mod codec;
pub mod config;
pub mod gatt;
pub mod loopback;

pub mod central;
pub mod peripheral;

use thiserror::Error;

pub use central::{
    CapabilitySpec, CentralController, CentralEvent, CentralListener, CentralState,
    CentralTransport, CharRole, Connection, ConnectionState, DisconnectReason, ScanState, Scanner,
};
pub use config::{
    AdvertiseMode, AdvertiseSettings, CentralConfig, ConfigError, GattLinkConfig,
    PeripheralConfig, ScanConfig, TxPowerLevel,
};
pub use gatt::{
    CharId, CharPermissions, CharProperties, Characteristic, DeviceId, GattStatus, ServiceId,
    TransportError, CLIENT_CONFIG_DESCRIPTOR_UUID,
};
pub use peripheral::{
    NotificationRegistry, Peripheral, PeripheralEvent, PeripheralListener, PeripheralRegistry,
    PeripheralSession, PeripheralTransport, ServiceDefinition,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Failure taxonomy shared by both roles
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GattLinkError {
    /// Operation attempted outside its legal state; never retried
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// Discovered remote shape does not satisfy the declared capability spec
    #[error("Condition mismatch: {0}")]
    ConditionMismatch(String),
    #[error("Remote device disconnected")]
    RemoteDisconnect,
    /// Scan/advertise/server start failure reported by the platform
    #[error("Transport failure: {0}")]
    TransportFailure(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] peripheral::RegistryError),
}

impl From<gatt::TransportError> for GattLinkError {
    fn from(err: gatt::TransportError) -> Self {
        GattLinkError::TransportFailure(err.to_string())
    }
}
