//! Relay transports for AzHexGate tunnels
//!
//! A [`RelaySender`] dials [`Connection`]s that a [`RelayListener`] bound to the
//! same tunnel name accepts. Three transports implement the pair:
//! - [`memory`]: in-process pipes, for local mode
//! - [`mock`]: inspectable buffers, for tests
//! - [`azure`]: Azure Relay Hybrid Connections over WebSockets
//!
//! [`forward`] joins accepted connections with local TCP services.

pub mod azure;
mod connection;
mod error;
pub mod forward;
pub mod memory;
pub mod mock;
mod queue;
pub mod sas;
mod transport;

pub use azure::{AzureListener, AzureSender, ControlState, RelayEndpoint};
pub use connection::{ByteStream, Connection, ConnectionCloser, ConnectionInfo};
pub use error::RelayError;
pub use memory::{MemoryListener, MemorySender};
pub use mock::{MockBuffers, MockListener, MockSender};
pub use queue::ACCEPT_QUEUE_CAPACITY;
pub use transport::{RelayListener, RelaySender, TransportKind};
