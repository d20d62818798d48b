pub mod client;
pub mod config;
pub mod fault;
pub mod session;

pub use client::{RegisterClient, DEFAULT_READ_TIMEOUT};
pub use config::{AddressBase, ConnectionConfig, ConnectionParams, Parity, RegisterAddress};
pub use fault::{Fault, Operation};
pub use session::{open_serial_port, Link, LinkOpener, SerialOpener, TransportSession};
