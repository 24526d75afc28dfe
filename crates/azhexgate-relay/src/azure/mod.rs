//! Azure Relay Hybrid Connections transport
//!
//! A listener keeps one signaling WebSocket (the control channel) per
//! instance and opens a rendezvous WebSocket for every accept notification.
//! A sender opens one WebSocket per dial. Data flows as binary messages.

mod endpoint;
mod listener;
mod sender;
mod ws_io;

pub use endpoint::RelayEndpoint;
pub use listener::{AzureListener, ControlState};
pub use sender::AzureSender;
pub use ws_io::WsIo;
