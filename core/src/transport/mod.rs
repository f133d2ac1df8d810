// Transport module

pub mod abstraction;
pub mod ble;
pub mod discovery;
pub mod events;
pub mod mesh;

pub use abstraction::{
    ConnectionHandle, RadioAdapter, RadioEvent, RadioEventSink, RemoteCharacteristic,
    ServiceDescriptor, TransportError, WriteType,
};
pub use discovery::{Peer, PeerTable};
pub use events::{EventBus, EventSubscription, MeshEvent};
pub use mesh::{MeshTransport, SendPhase};
