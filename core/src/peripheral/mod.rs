// Peripheral role: serve declared characteristics to connected centrals

pub mod notification;
pub mod registry;
pub mod request;
pub mod server;
pub mod session;
pub mod transport;

pub use notification::NotificationRegistry;
pub use registry::{
    CharacteristicDescriptor, DescriptorDefinition, PeripheralCapability, PeripheralRegistry,
    ReadHandler, RegistryError, RequestKind, ServiceDefinition, ServiceDescriptor, WriteHandler,
};
pub use request::{
    DescriptorWriteRequest, HandlerError, ReadRequest, ReadResponse, TransactionReply,
    WriteRequest, WriteResponse,
};
pub use server::{NoopPeripheralListener, Peripheral, PeripheralListener};
pub use session::{PeripheralSession, ValuePush, WriteOutcome};
pub use transport::{AdvertiseData, PeripheralEvent, PeripheralTransport};
