pub mod central;
pub mod identifier;
pub mod scanner;
pub mod transport;

pub use central::BtleplugTransport;
pub use identifier::{Identifier, IdentifierError};
pub use scanner::{ActiveScan, ScanCoordinator, ScanError};
pub use transport::{
    BleTransport, ConnectionHandle, PeripheralCandidate, ServiceInfo, TransportError,
    TransportEvent, WriteMode,
};
