// Central role: discover a peripheral by service, validate it, talk to it

pub mod capability;
pub mod connection;
pub mod controller;
pub mod scanner;
pub mod transport;

pub use capability::{CapabilitySpec, CapabilitySpecBuilder, CharRole};
pub use connection::{
    Connection, ConnectionNotice, ConnectionState, DisconnectReason, Effect, GattCommand,
    LinkEvent, PendingSubscriptionQueue, SubscriptionEnable,
};
pub use controller::{CentralController, CentralListener, CentralState, NoopListener};
pub use scanner::{ScanAction, ScanState, Scanner, TimerToken};
pub use transport::{
    CentralEvent, CentralTransport, DiscoveredCharacteristic, DiscoveredService, ScanReport,
    WriteType,
};
